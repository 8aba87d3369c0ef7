//! GET /jobs/stream: server-sent job status deltas for the caller's tenant.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
};
use tokio_stream::StreamExt;
use tracing::{info, warn};

use costwise_infra::jobs::{JobStore, StatusEvent, StreamError};

use crate::app::{errors, services::JobServices};
use crate::context::TenantContext;

/// Opens a status stream, or 429 when the tenant is at its connection cap.
///
/// Events are named `jobs`, `heartbeat` and `error`; each carries the JSON
/// form of the event. The connection slot is released when the client goes.
pub async fn job_stream<S: JobStore>(
    Extension(services): Extension<Arc<JobServices<S>>>,
    Extension(tenant): Extension<TenantContext>,
) -> Response {
    let stream = match services.feed.open(tenant.tenant_id()) {
        Ok(stream) => stream,
        Err(err @ StreamError::TooManyConnections { .. }) => {
            warn!(tenant_id = %tenant.tenant_id(), "status stream rejected: connection cap reached");
            return errors::json_error(StatusCode::TOO_MANY_REQUESTS, "too_many_connections", err.to_string());
        }
    };
    info!(tenant_id = %tenant.tenant_id(), "status stream opened");

    let events = stream.map(|event| Ok::<_, Infallible>(to_sse(&event)));
    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

fn to_sse(event: &StatusEvent) -> SseEvent {
    SseEvent::default()
        .event(event.name())
        .json_data(event)
        .unwrap_or_else(|_| SseEvent::default().event("error").data(r#"{"type":"error"}"#))
}
