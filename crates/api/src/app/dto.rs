//! Request/response bodies for the job routes.

use axum::http::StatusCode;
use axum::response::Response;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use costwise_core::TenantId;
use costwise_infra::jobs::{
    EnqueueRequest, Job, JobId, JobListQuery, JobSort, JobStatus, JobSummary, JobType,
};

use crate::app::errors;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 200;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub job_type: String,
    #[serde(default)]
    pub payload: Option<Value>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub max_attempts: Option<u32>,
    pub priority: Option<i32>,
    pub deduplication_key: Option<String>,
}

impl SubmitJobRequest {
    pub fn into_enqueue(self, tenant_id: TenantId) -> Result<EnqueueRequest, Response> {
        let job_type = parse_job_type(&self.job_type)?;
        let mut request = EnqueueRequest::new(job_type, self.payload.unwrap_or(Value::Null))
            .for_tenant(tenant_id)
            .priority(self.priority.unwrap_or(0));
        if let Some(at) = self.scheduled_for {
            request = request.scheduled_for(at);
        }
        if let Some(max) = self.max_attempts {
            request = request.max_attempts(max);
        }
        if let Some(key) = self.deduplication_key {
            request = request.deduplication_key(key);
        }
        Ok(request)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RunBatchRequest {
    pub limit: Option<usize>,
    pub job_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsParams {
    pub status: Option<String>,
    pub job_type: Option<String>,
    pub limit: Option<usize>,
    pub sort: Option<String>,
}

impl ListJobsParams {
    pub fn into_query(self, tenant_id: TenantId) -> Result<JobListQuery, Response> {
        let mut query = JobListQuery::for_tenant(tenant_id);
        query.limit = self
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        if let Some(raw) = self.status.as_deref() {
            query.status = Some(raw.parse::<JobStatus>().map_err(|_| {
                errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_status",
                    "status must be one of: pending, running, completed, failed, dead_letter",
                )
            })?);
        }
        if let Some(raw) = self.job_type.as_deref() {
            query.job_type = Some(parse_job_type(raw)?);
        }
        if let Some(raw) = self.sort.as_deref() {
            query.sort = raw.parse::<JobSort>().map_err(|_| {
                errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_sort",
                    "sort must be one of: created_desc, created_asc, priority",
                )
            })?;
        }
        Ok(query)
    }
}

pub fn parse_job_type(raw: &str) -> Result<JobType, Response> {
    raw.parse::<JobType>().map_err(|_| {
        let known: Vec<_> = JobType::ALL.iter().map(|t| t.as_str()).collect();
        errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_job_type",
            format!("job_type must be one of: {}", known.join(", ")),
        )
    })
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub id: JobId,
    pub status: JobStatus,
    /// `false` when the deduplication key matched an existing job.
    pub created: bool,
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobSummary>,
}

/// Single-job view. The error message is truncated like in listings.
#[derive(Debug, Serialize)]
pub struct JobDetailResponse {
    #[serde(flatten)]
    pub summary: JobSummary,
    pub payload: Value,
    pub result: Option<Value>,
    pub deduplication_key: Option<String>,
}

impl From<Job> for JobDetailResponse {
    fn from(job: Job) -> Self {
        let summary = job.summary();
        Self {
            summary,
            payload: job.payload,
            result: job.result,
            deduplication_key: job.deduplication_key,
        }
    }
}
