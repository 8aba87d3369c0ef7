//! Idempotent job submission.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

use costwise_core::{DomainError, TenantId};

use super::error::StoreError;
use super::store::JobStore;
use super::types::{Job, JobId, JobType, NewJob};

const MAX_ATTEMPTS_LIMIT: u32 = 100;
const MAX_DEDUP_KEY_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Invalid(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The dedup key collided but the conflicting row vanished before it
    /// could be read back.
    #[error("deduplication key '{0}' conflicted but no live job holds it")]
    DuplicateVanished(String),
}

/// A submission request.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
    pub job_type: JobType,
    pub tenant_id: Option<TenantId>,
    pub payload: Value,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub max_attempts: Option<u32>,
    pub priority: i32,
    pub deduplication_key: Option<String>,
}

impl EnqueueRequest {
    pub fn new(job_type: JobType, payload: Value) -> Self {
        Self {
            job_type,
            tenant_id: None,
            payload,
            scheduled_for: None,
            max_attempts: None,
            priority: 0,
            deduplication_key: None,
        }
    }

    pub fn for_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn deduplication_key(mut self, key: impl Into<String>) -> Self {
        self.deduplication_key = Some(key.into());
        self
    }
}

/// Result of a submission: the job, and whether this call created it.
#[derive(Debug, Clone, PartialEq)]
pub struct Enqueued {
    pub job: Job,
    pub created: bool,
}

/// Submits jobs to a store.
pub struct Enqueuer<S> {
    store: Arc<S>,
    default_max_attempts: u32,
}

impl<S: JobStore> Enqueuer<S> {
    pub fn new(store: Arc<S>, default_max_attempts: u32) -> Self {
        Self {
            store,
            default_max_attempts,
        }
    }

    /// Insert a pending job.
    ///
    /// With a deduplication key, a uniqueness conflict resolves to the
    /// existing job (`created: false`) instead of an error.
    #[instrument(
        skip(self, request),
        fields(job_type = %request.job_type, tenant_id = ?request.tenant_id),
        err
    )]
    pub async fn submit(&self, request: EnqueueRequest) -> Result<Enqueued, EnqueueError> {
        let max_attempts = request.max_attempts.unwrap_or(self.default_max_attempts);
        if max_attempts == 0 || max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(DomainError::validation(format!(
                "max_attempts must be between 1 and {MAX_ATTEMPTS_LIMIT}"
            ))
            .into());
        }
        if let Some(key) = &request.deduplication_key {
            if key.trim().is_empty() || key.len() > MAX_DEDUP_KEY_LEN {
                return Err(DomainError::validation(format!(
                    "deduplication_key must be 1..={MAX_DEDUP_KEY_LEN} bytes"
                ))
                .into());
            }
        }

        let now = Utc::now();
        let new_job = NewJob {
            id: JobId::new(),
            tenant_id: request.tenant_id,
            job_type: request.job_type,
            payload: request.payload,
            priority: request.priority,
            scheduled_for: request.scheduled_for.unwrap_or(now),
            max_attempts,
            deduplication_key: request.deduplication_key.clone(),
            created_at: now,
        };

        match self.store.insert(new_job).await {
            Ok(job) => {
                debug!(job.id = %job.id, "job enqueued");
                Ok(Enqueued { job, created: true })
            }
            Err(StoreError::UniqueViolation(_)) if request.deduplication_key.is_some() => {
                let key = request.deduplication_key.unwrap_or_default();
                let existing = self
                    .store
                    .find_by_deduplication_key(&key)
                    .await?
                    .ok_or_else(|| EnqueueError::DuplicateVanished(key.clone()))?;
                debug!(job.id = %existing.id, dedup_key = %key, "deduplicated submission");
                Ok(Enqueued {
                    job: existing,
                    created: false,
                })
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl<S> Clone for Enqueuer<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            default_max_attempts: self.default_max_attempts,
        }
    }
}
