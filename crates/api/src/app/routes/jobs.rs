//! Tenant job routes: submit, inspect, retry, delete, manual batch runs.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use tracing::info;

use costwise_infra::jobs::{ClaimFilter, JobId, JobStore};

use crate::app::{dto, errors, services::JobServices};
use crate::context::{PrincipalContext, TenantContext};

pub fn router<S: JobStore>() -> Router {
    Router::new()
        .route("/jobs", post(submit_job::<S>).get(list_jobs::<S>))
        .route("/jobs/run", post(run_batch::<S>))
        .route("/jobs/stats", get(job_stats::<S>))
        .route("/jobs/:id", get(get_job::<S>).delete(delete_job::<S>))
        .route("/jobs/:id/retry", post(retry_job::<S>))
}

/// POST /jobs
///
/// 201 when a job was created, 200 with `created: false` when the
/// deduplication key matched an existing job.
pub async fn submit_job<S: JobStore>(
    Extension(services): Extension<Arc<JobServices<S>>>,
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<dto::SubmitJobRequest>,
) -> Response {
    let request = match body.into_enqueue(tenant.tenant_id()) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let enqueued = match services.enqueuer.submit(request).await {
        Ok(enqueued) => enqueued,
        Err(err) => return errors::enqueue_error_to_response(err),
    };

    let status = if enqueued.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    (
        status,
        Json(dto::SubmitJobResponse {
            id: enqueued.job.id,
            status: enqueued.job.status,
            created: enqueued.created,
        }),
    )
        .into_response()
}

/// POST /jobs/run
///
/// Runs one bounded batch of the caller's tenant jobs. Admin only.
pub async fn run_batch<S: JobStore>(
    Extension(services): Extension<Arc<JobServices<S>>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    body: Option<Json<dto::RunBatchRequest>>,
) -> Response {
    if !principal.is_admin() {
        return errors::json_error(
            StatusCode::FORBIDDEN,
            "forbidden",
            "manual batch runs require the admin role",
        );
    }

    let body = body.map(|Json(b)| b).unwrap_or_default();
    let limit = body
        .limit
        .unwrap_or(services.config.batch_size)
        .clamp(1, services.config.max_manual_batch);
    let mut filter = ClaimFilter::new(limit).with_tenant(tenant.tenant_id());
    if let Some(raw) = body.job_type.as_deref() {
        match dto::parse_job_type(raw) {
            Ok(job_type) => filter = filter.with_job_type(job_type),
            Err(response) => return response,
        }
    }

    info!(
        tenant_id = %tenant.tenant_id(),
        principal_id = %principal.principal_id(),
        limit,
        "manual job batch requested"
    );
    let report = services.run_batch(filter).await;
    (StatusCode::OK, Json(report)).into_response()
}

/// GET /jobs/stats
pub async fn job_stats<S: JobStore>(
    Extension(services): Extension<Arc<JobServices<S>>>,
    Extension(tenant): Extension<TenantContext>,
) -> Response {
    match services.store.stats(Some(tenant.tenant_id())).await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(err) => errors::store_error_to_response(err),
    }
}

/// GET /jobs?status=&job_type=&limit=&sort=
pub async fn list_jobs<S: JobStore>(
    Extension(services): Extension<Arc<JobServices<S>>>,
    Extension(tenant): Extension<TenantContext>,
    Query(params): Query<dto::ListJobsParams>,
) -> Response {
    let query = match params.into_query(tenant.tenant_id()) {
        Ok(query) => query,
        Err(response) => return response,
    };

    match services.store.list(&query).await {
        Ok(jobs) => {
            let jobs = jobs.iter().map(|job| job.summary()).collect();
            (StatusCode::OK, Json(dto::JobListResponse { jobs })).into_response()
        }
        Err(err) => errors::store_error_to_response(err),
    }
}

/// GET /jobs/:id
pub async fn get_job<S: JobStore>(
    Extension(services): Extension<Arc<JobServices<S>>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> Response {
    let Ok(job_id) = id.parse::<JobId>() else {
        return errors::invalid_id();
    };

    match services.store.get(job_id).await {
        // Jobs of other tenants (and system jobs) look the same as missing ones.
        Ok(Some(job)) if job.tenant_id == Some(tenant.tenant_id()) => {
            (StatusCode::OK, Json(dto::JobDetailResponse::from(job))).into_response()
        }
        Ok(_) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        Err(err) => errors::store_error_to_response(err),
    }
}

/// POST /jobs/:id/retry
///
/// Requeue a dead-lettered job with a fresh attempt budget.
pub async fn retry_job<S: JobStore>(
    Extension(services): Extension<Arc<JobServices<S>>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> Response {
    let Ok(job_id) = id.parse::<JobId>() else {
        return errors::invalid_id();
    };

    match services
        .store
        .requeue_dead_letter(job_id, Some(tenant.tenant_id()), Utc::now())
        .await
    {
        Ok(job) => {
            info!(job.id = %job.id, tenant_id = %tenant.tenant_id(), "dead-lettered job requeued");
            (StatusCode::OK, Json(job.summary())).into_response()
        }
        Err(err) => errors::store_error_to_response(err),
    }
}

/// DELETE /jobs/:id
///
/// Soft delete; refused with 409 while the job is running.
pub async fn delete_job<S: JobStore>(
    Extension(services): Extension<Arc<JobServices<S>>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> Response {
    let Ok(job_id) = id.parse::<JobId>() else {
        return errors::invalid_id();
    };

    match services
        .store
        .soft_delete(job_id, Some(tenant.tenant_id()), Utc::now())
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => errors::store_error_to_response(err),
    }
}
