use axum::{Router, routing::get};

use costwise_infra::jobs::JobStore;

pub mod internal;
pub mod jobs;
pub mod stream;
pub mod system;

/// Router for all authenticated (tenant-scoped) endpoints.
pub fn router<S: JobStore>() -> Router {
    Router::new()
        .route("/jobs/stream", get(stream::job_stream::<S>))
        .merge(jobs::router::<S>())
}
