//! Job persistence.
//!
//! [`JobStore`] is the seam between the job pipeline and storage. Two
//! implementations exist:
//!
//! - [`InMemoryJobStore`] for tests and single-process development
//! - [`PostgresJobStore`] for production (row locks with `SKIP LOCKED`)

mod memory;
mod postgres;

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use costwise_core::{DomainError, TenantId};

use super::error::StoreError;
use super::outcome::Transition;
use super::types::{ClaimToken, Job, JobId, JobStats, JobStatus, JobType, NewJob};

pub use memory::{InMemoryJobStore, InMemorySession};
pub use postgres::{PgJobSession, PostgresJobStore};

/// A unit of work handed to a running handler.
///
/// Backed by a database transaction in Postgres. Handlers do their writes
/// through the session; the executor wraps each invocation in a nested scope
/// so a failed handler leaves nothing behind.
#[async_trait]
pub trait JobSession: Send {
    /// Bind the tenant context for row-level isolation.
    async fn bind_tenant(&mut self, tenant_id: TenantId) -> Result<(), StoreError>;

    async fn clear_tenant(&mut self) -> Result<(), StoreError>;

    fn current_tenant(&self) -> Option<TenantId>;

    /// Open a nested scope (savepoint).
    async fn begin_scope(&mut self) -> Result<(), StoreError>;

    /// Keep the writes made since `begin_scope`.
    async fn release_scope(&mut self) -> Result<(), StoreError>;

    /// Discard the writes made since `begin_scope`.
    async fn rollback_scope(&mut self) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;
}

/// Narrows which pending jobs a claim considers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimFilter {
    pub limit: usize,
    pub tenant_id: Option<TenantId>,
    pub job_type: Option<JobType>,
    /// Only these types are claimable; `None` admits every type.
    pub job_types: Option<Vec<JobType>>,
}

impl ClaimFilter {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            tenant_id: None,
            job_type: None,
            job_types: None,
        }
    }

    pub fn with_job_types(mut self, job_types: Vec<JobType>) -> Self {
        self.job_types = Some(job_types);
        self
    }

    pub(crate) fn admits(&self, job_type: JobType) -> bool {
        self.job_type.is_none_or(|t| t == job_type)
            && self.job_types.as_ref().is_none_or(|types| types.contains(&job_type))
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_job_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }
}

/// Who claims, and for how long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimStamp {
    pub worker_id: String,
    pub now: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
}

/// Result of a lease sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapedLeases {
    pub requeued: Vec<JobId>,
    pub dead_lettered: Vec<JobId>,
}

impl ReapedLeases {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.dead_lettered.is_empty()
    }
}

/// Listing order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JobSort {
    #[default]
    CreatedDesc,
    CreatedAsc,
    /// Claim order: priority descending, then schedule ascending.
    Priority,
}

impl FromStr for JobSort {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created_desc" => Ok(JobSort::CreatedDesc),
            "created_asc" => Ok(JobSort::CreatedAsc),
            "priority" => Ok(JobSort::Priority),
            other => Err(DomainError::validation(format!("unknown sort '{other}'"))),
        }
    }
}

/// Filtered listing query. Deleted rows are never returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobListQuery {
    pub tenant_id: Option<TenantId>,
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub limit: usize,
    pub sort: JobSort,
}

impl JobListQuery {
    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            status: None,
            job_type: None,
            limit: 50,
            sort: JobSort::default(),
        }
    }
}

/// Persistence for jobs.
///
/// Writes made on behalf of an attempt (`begin_attempt`, `extend_lease`,
/// `finish`, `finish_in`) carry the [`ClaimToken`] minted by `claim` and only
/// touch a row that is still `running` under that same token. A worker whose
/// lease was reaped and re-claimed elsewhere gets `None`, a no-op or
/// `InvalidState`.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    type Session: JobSession + 'static;

    /// Insert a new pending job. Fails with `UniqueViolation` on a duplicate
    /// deduplication key among non-deleted rows.
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError>;

    async fn find_by_deduplication_key(&self, key: &str) -> Result<Option<Job>, StoreError>;

    /// Look up a non-deleted job.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Atomically move up to `filter.limit` eligible jobs to `running`, each
    /// with a fresh claim token.
    ///
    /// Concurrent claimers never receive the same job. The returned jobs are
    /// ordered by priority descending, then `scheduled_for` ascending.
    async fn claim(
        &self,
        filter: &ClaimFilter,
        stamp: &ClaimStamp,
    ) -> Result<Vec<Job>, StoreError>;

    /// Durable checkpoint before a handler runs: count the attempt and stamp
    /// `started_at`. Returns `None` when the job is no longer running under
    /// `token` or has no budget left.
    async fn begin_attempt(
        &self,
        job_id: JobId,
        token: ClaimToken,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;

    /// Push out the lease of a job still running under `token`. Returns
    /// whether the lease was extended.
    async fn extend_lease(
        &self,
        job_id: JobId,
        token: ClaimToken,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn open_session(&self) -> Result<Self::Session, StoreError>;

    /// Persist `transition` inside `session` (committed with the handler's
    /// own writes).
    async fn finish_in(
        &self,
        session: &mut Self::Session,
        job_id: JobId,
        token: ClaimToken,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Persist `transition` on its own connection.
    async fn finish(
        &self,
        job_id: JobId,
        token: ClaimToken,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Return running jobs whose lease expired before `now` to the queue
    /// (scheduled at `retry_at`), or dead-letter them when no attempt is left.
    /// Their claim tokens are revoked.
    async fn reap_expired(
        &self,
        now: DateTime<Utc>,
        retry_at: DateTime<Utc>,
    ) -> Result<ReapedLeases, StoreError>;

    async fn stats(&self, tenant_id: Option<TenantId>) -> Result<JobStats, StoreError>;

    async fn list(&self, query: &JobListQuery) -> Result<Vec<Job>, StoreError>;

    /// Active jobs of a tenant plus completed/failed ones updated since
    /// `finished_since`.
    async fn status_snapshot(
        &self,
        tenant_id: TenantId,
        finished_since: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError>;

    /// Put a dead-lettered job back in the queue with a fresh attempt budget.
    async fn requeue_dead_letter(
        &self,
        job_id: JobId,
        tenant_id: Option<TenantId>,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;

    /// Soft-delete a job that is not running.
    async fn soft_delete(
        &self,
        job_id: JobId,
        tenant_id: Option<TenantId>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Bounded snapshot size for the status stream.
pub(crate) const SNAPSHOT_LIMIT: usize = 500;

pub(crate) fn lease_expired_message(worker_id: Option<&str>) -> String {
    format!(
        "LeaseExpired: worker {} stopped renewing its lease",
        worker_id.unwrap_or("unknown")
    )
}
