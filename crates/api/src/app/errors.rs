//! JSON error responses: `{ "error": code, "message": ... }`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use costwise_infra::jobs::{EnqueueError, StoreError};

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Map a store failure to a response. Database details stay in the logs.
pub fn store_error_to_response(err: StoreError) -> Response {
    match err {
        StoreError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        StoreError::InvalidState(msg) => json_error(StatusCode::CONFLICT, "invalid_state", msg),
        StoreError::UniqueViolation(_) => {
            json_error(StatusCode::CONFLICT, "conflict", "a conflicting job already exists")
        }
        StoreError::Unavailable(msg) => {
            error!(error = %msg, "job store unavailable");
            json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
                "job store is temporarily unavailable",
            )
        }
        other => {
            error!(error = %other, "job store error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", "internal store error")
        }
    }
}

pub fn enqueue_error_to_response(err: EnqueueError) -> Response {
    match err {
        EnqueueError::Invalid(e) => json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
        EnqueueError::Store(e) => store_error_to_response(e),
        EnqueueError::DuplicateVanished(_) => json_error(
            StatusCode::CONFLICT,
            "duplicate_vanished",
            "a job with this deduplication key was removed; retry the submission",
        ),
    }
}

pub fn invalid_id() -> Response {
    json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id")
}

#[cfg(test)]
mod tests {
    use super::*;
    use costwise_core::DomainError;
    use costwise_infra::jobs::JobId;

    #[test]
    fn store_errors_map_to_statuses() {
        let cases = [
            (StoreError::NotFound(JobId::new()), StatusCode::NOT_FOUND),
            (StoreError::InvalidState("running".into()), StatusCode::CONFLICT),
            (StoreError::Unavailable("pool closed".into()), StatusCode::SERVICE_UNAVAILABLE),
            (StoreError::Database("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(store_error_to_response(err).status(), status);
        }
    }

    #[test]
    fn validation_errors_are_bad_requests() {
        let res = enqueue_error_to_response(EnqueueError::Invalid(DomainError::validation("bad")));
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }
}
