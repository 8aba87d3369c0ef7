//! Core job types and policies.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use costwise_core::{DomainError, TenantId};

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

costwise_core::impl_uuid_newtype!(JobId, "JobId");

/// Marks one claim of a job.
///
/// A fresh token is minted every time a job moves to `running` and cleared
/// when it leaves. Attempt, heartbeat and finish writes must present the
/// current token, so a worker whose lease was reaped cannot touch the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClaimToken(Uuid);

costwise_core::impl_uuid_newtype!(ClaimToken, "ClaimToken");

/// Job kind used to route a job to its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Scan a tenant's cloud resources.
    ResourceScan,
    /// Import billing/cost data from a provider.
    CostIngestion,
    /// Deliver a notification (email, webhook, chat).
    NotificationDelivery,
    /// Render a scheduled report.
    ReportGeneration,
    /// System housekeeping.
    Maintenance,
}

impl JobType {
    pub const ALL: [JobType; 5] = [
        JobType::ResourceScan,
        JobType::CostIngestion,
        JobType::NotificationDelivery,
        JobType::ReportGeneration,
        JobType::Maintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ResourceScan => "resource_scan",
            JobType::CostIngestion => "cost_ingestion",
            JobType::NotificationDelivery => "notification_delivery",
            JobType::ReportGeneration => "report_generation",
            JobType::Maintenance => "maintenance",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job type '{s}'")))
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by a worker
    Running,
    /// Completed successfully
    Completed,
    /// Terminal failure recorded outside the executor. Attempts always end
    /// in completed, pending or dead-letter; this value stays in the status
    /// set for reporting and the status stream.
    Failed,
    /// Exhausted retries
    DeadLetter,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::DeadLetter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::DeadLetter => "dead_letter",
        }
    }

    /// Pending or running.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status '{s}'")))
    }
}

/// Retry timing.
///
/// Failed attempts are rescheduled at `base_delay * 2^(attempt - 1)`, capped at
/// `max_delay`. Cancellations use the flat `cancellation_delay` instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub cancellation_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(24 * 60 * 60),
            cancellation_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Calculate the delay after a failed attempt (1-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Convert a std duration into a chrono offset, saturating instead of failing.
pub fn chrono_offset(duration: Duration) -> chrono::Duration {
    let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX / 1_000);
    chrono::Duration::milliseconds(millis)
}

/// A persisted background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Owner; `None` for system-level jobs.
    pub tenant_id: Option<TenantId>,
    pub job_type: JobType,
    pub status: JobStatus,
    pub payload: serde_json::Value,
    /// Handler output (possibly replaced by a truncation summary).
    pub result: Option<serde_json::Value>,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Higher is claimed first.
    pub priority: i32,
    /// Earliest eligible claim time.
    pub scheduled_for: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Full failure detail; never sent to clients untruncated.
    pub error_message: Option<String>,
    pub deduplication_key: Option<String>,
    pub worker_id: Option<String>,
    /// Set while running; see [`ClaimToken`].
    #[serde(skip)]
    pub claim_token: Option<ClaimToken>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
}

impl Job {
    /// Whether the claim predicate admits this job at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && self.scheduled_for <= now
            && self.attempts < self.max_attempts
            && !self.is_deleted
    }

    /// Change marker used by the status stream (`status:updated_at`).
    pub fn fingerprint(&self) -> String {
        format!("{}:{}", self.status, self.updated_at.timestamp_micros())
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            job_type: self.job_type,
            status: self.status,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            priority: self.priority,
            scheduled_for: self.scheduled_for,
            started_at: self.started_at,
            completed_at: self.completed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            error: self.error_message.as_deref().map(client_error_summary),
        }
    }
}

/// A job ready to be inserted (not yet persisted).
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub id: JobId,
    pub tenant_id: Option<TenantId>,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub scheduled_for: DateTime<Utc>,
    pub max_attempts: u32,
    pub deduplication_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewJob {
    /// The row as it looks right after insert.
    pub fn into_job(self) -> Job {
        Job {
            id: self.id,
            tenant_id: self.tenant_id,
            job_type: self.job_type,
            status: JobStatus::Pending,
            payload: self.payload,
            result: None,
            attempts: 0,
            max_attempts: self.max_attempts,
            priority: self.priority,
            scheduled_for: self.scheduled_for,
            started_at: None,
            completed_at: None,
            error_message: None,
            deduplication_key: self.deduplication_key,
            worker_id: None,
            claim_token: None,
            lease_expires_at: None,
            created_at: self.created_at,
            updated_at: self.created_at,
            is_deleted: false,
        }
    }
}

/// Client-facing view of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub priority: i32,
    pub scheduled_for: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

const CLIENT_ERROR_MAX_CHARS: usize = 120;

/// Reduce a stored error message to its failure class.
///
/// Everything from the first `:` or line break onwards is dropped, so clients
/// see `"Timeout"` or `"ExecutionError"` but never the internal detail.
pub fn client_error_summary(message: &str) -> String {
    let head = message
        .split(|c| c == ':' || c == '\n')
        .next()
        .unwrap_or_default()
        .trim();
    head.chars().take(CLIENT_ERROR_MAX_CHARS).collect()
}

/// Job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead_letter: u64,
    pub total: u64,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Running => self.running += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::DeadLetter => self.dead_letter += count,
        }
        self.total += count;
    }
}
