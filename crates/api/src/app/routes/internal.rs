//! Scheduler trigger, authenticated by a shared secret instead of a JWT.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use costwise_infra::jobs::{ClaimFilter, JobStore};

use crate::app::{errors, services::JobServices};
use crate::config::MIN_INTERNAL_SECRET_LEN;

pub const INTERNAL_SECRET_HEADER: &str = "x-internal-secret";

/// The configured secret, as handed to the router.
#[derive(Clone)]
pub struct InternalSecret(Option<Arc<str>>);

impl InternalSecret {
    pub fn new(secret: Option<String>) -> Self {
        Self(secret.map(Arc::from))
    }
}

pub fn router<S: JobStore>() -> Router {
    Router::new().route("/internal/jobs/run", post(run_scheduled_batch::<S>))
}

/// POST /internal/jobs/run
///
/// Runs one system-wide batch (no tenant filter).
pub async fn run_scheduled_batch<S: JobStore>(
    Extension(services): Extension<Arc<JobServices<S>>>,
    Extension(secret): Extension<InternalSecret>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = verify(&secret, &headers) {
        return response;
    }

    info!("scheduler triggered job batch");
    let report = services
        .run_batch(ClaimFilter::new(services.config.batch_size))
        .await;
    (StatusCode::OK, Json(report)).into_response()
}

fn verify(secret: &InternalSecret, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = secret.0.as_deref().filter(|s| s.len() >= MIN_INTERNAL_SECRET_LEN) else {
        warn!("internal job trigger called but no usable secret is configured");
        return Err(errors::json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "internal_endpoint_disabled",
            "internal job trigger is not configured",
        ));
    };

    let provided = headers
        .get(INTERNAL_SECRET_HEADER)
        .map(|value| value.as_bytes())
        .unwrap_or_default();

    let expected = expected.as_bytes();
    if expected.len() == provided.len() && bool::from(expected.ct_eq(provided)) {
        Ok(())
    } else {
        warn!("internal job trigger rejected: secret mismatch");
        Err(errors::json_error(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "invalid internal secret",
        ))
    }
}
