//! Execution outcomes and the state transitions they produce.
//!
//! Every handler invocation ends in exactly one [`Outcome`]. [`plan_transition`]
//! turns that outcome into the single [`Transition`] persisted for the job.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::error::JobError;
use super::result::{ResultLimits, cap_result};
use super::types::{Job, JobStatus, RetryPolicy, chrono_offset};

/// What happened when a handler ran.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    /// Transient failure (handler error, panic, infrastructure hiccup).
    Retryable(String),
    /// The handler judged the failure permanent. Still subject to the attempt
    /// budget; the class is kept for the error message.
    Fatal(String),
    /// Malformed job or missing handler. Sampled separately in batch reports.
    ConfigError(String),
    /// The handler exceeded its time budget.
    Timeout(Duration),
    /// Cooperative cancellation (worker shutdown).
    Cancelled(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Error classification reported in batch samples.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Outcome::Success(_) => None,
            Outcome::ConfigError(_) => Some(ErrorKind::Config),
            _ => Some(ErrorKind::Execution),
        }
    }
}

impl From<JobError> for Outcome {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Config(msg) => Outcome::ConfigError(msg),
            JobError::Execution(msg) => Outcome::Retryable(msg),
            JobError::Fatal(msg) => Outcome::Fatal(msg),
            // A handler that enforces its own deadline is treated like any
            // other transient failure.
            JobError::Timeout(msg) => Outcome::Retryable(format!("handler timeout: {msg}")),
            JobError::Cancelled(msg) => Outcome::Cancelled(msg),
        }
    }
}

/// Coarse error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Execution,
}

/// The single state change persisted after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Complete {
        result: Value,
        completed_at: DateTime<Utc>,
    },
    /// Back to pending. `refund_attempt` gives back the attempt consumed by
    /// the begin-attempt checkpoint.
    Retry {
        scheduled_for: DateTime<Utc>,
        error: String,
        refund_attempt: bool,
    },
    DeadLetter {
        error: String,
        completed_at: DateTime<Utc>,
    },
}

impl Transition {
    pub fn status(&self) -> JobStatus {
        match self {
            Transition::Complete { .. } => JobStatus::Completed,
            Transition::Retry { .. } => JobStatus::Pending,
            Transition::DeadLetter { .. } => JobStatus::DeadLetter,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Transition::Complete { .. } => None,
            Transition::Retry { error, .. } | Transition::DeadLetter { error, .. } => Some(error),
        }
    }
}

/// Decide the persisted transition for `job` (already carrying the attempt
/// count written by the begin-attempt checkpoint).
///
/// Every failure except cancellation goes through the same exhaustion check:
/// retry with backoff while budget remains, dead-letter on the last attempt.
pub fn plan_transition(
    job: &Job,
    outcome: Outcome,
    now: DateTime<Utc>,
    retry: &RetryPolicy,
    limits: &ResultLimits,
) -> Transition {
    let attempt = format!("attempt {}/{}", job.attempts, job.max_attempts);
    match outcome {
        Outcome::Success(value) => Transition::Complete {
            result: cap_result(value, limits),
            completed_at: now,
        },
        Outcome::Retryable(reason) => retry_or_dead_letter(
            job,
            now,
            retry,
            format!("ExecutionError: {reason} ({attempt})"),
        ),
        Outcome::Timeout(budget) => retry_or_dead_letter(
            job,
            now,
            retry,
            format!("Timeout: handler exceeded {budget:?} time budget ({attempt})"),
        ),
        Outcome::Cancelled(reason) => Transition::Retry {
            scheduled_for: now + chrono_offset(retry.cancellation_delay),
            error: format!("Cancelled: {reason}"),
            refund_attempt: true,
        },
        Outcome::ConfigError(reason) => retry_or_dead_letter(
            job,
            now,
            retry,
            format!("ConfigError: {reason} ({attempt})"),
        ),
        Outcome::Fatal(reason) => {
            retry_or_dead_letter(job, now, retry, format!("Fatal: {reason} ({attempt})"))
        }
    }
}

fn retry_or_dead_letter(
    job: &Job,
    now: DateTime<Utc>,
    retry: &RetryPolicy,
    error: String,
) -> Transition {
    if job.attempts >= job.max_attempts {
        Transition::DeadLetter {
            error,
            completed_at: now,
        }
    } else {
        Transition::Retry {
            scheduled_for: now + chrono_offset(retry.backoff_for_attempt(job.attempts)),
            error,
            refund_attempt: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{JobId, JobType, NewJob};
    use serde_json::json;

    fn job_at_attempt(attempts: u32, max_attempts: u32) -> Job {
        let mut job = NewJob {
            id: JobId::new(),
            tenant_id: None,
            job_type: JobType::CostIngestion,
            payload: json!({}),
            priority: 0,
            scheduled_for: Utc::now(),
            max_attempts,
            deduplication_key: None,
            created_at: Utc::now(),
        }
        .into_job();
        job.status = JobStatus::Running;
        job.attempts = attempts;
        job
    }

    fn plan(job: &Job, outcome: Outcome, now: DateTime<Utc>) -> Transition {
        plan_transition(job, outcome, now, &RetryPolicy::default(), &ResultLimits::default())
    }

    #[test]
    fn success_completes_with_result() {
        let now = Utc::now();
        let t = plan(&job_at_attempt(1, 3), Outcome::Success(json!({"ok": true})), now);
        assert_eq!(
            t,
            Transition::Complete {
                result: json!({"ok": true}),
                completed_at: now
            }
        );
    }

    #[test]
    fn retryable_failure_backs_off_exponentially() {
        let now = Utc::now();
        let t = plan(&job_at_attempt(2, 3), Outcome::Retryable("boom".into()), now);
        match t {
            Transition::Retry {
                scheduled_for,
                error,
                refund_attempt,
            } => {
                assert_eq!(scheduled_for, now + chrono::Duration::seconds(120));
                assert!(error.starts_with("ExecutionError: boom"));
                assert!(!refund_attempt);
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn final_attempt_failure_dead_letters() {
        let t = plan(&job_at_attempt(3, 3), Outcome::Retryable("boom".into()), Utc::now());
        assert_eq!(t.status(), JobStatus::DeadLetter);
    }

    #[test]
    fn timeout_is_retryable_until_exhausted() {
        let budget = Duration::from_secs(300);
        let retry = plan(&job_at_attempt(1, 3), Outcome::Timeout(budget), Utc::now());
        assert_eq!(retry.status(), JobStatus::Pending);
        assert!(retry.error().unwrap().starts_with("Timeout: handler exceeded 300s"));

        let dead = plan(&job_at_attempt(3, 3), Outcome::Timeout(budget), Utc::now());
        assert_eq!(dead.status(), JobStatus::DeadLetter);
    }

    #[test]
    fn cancellation_releases_without_consuming_an_attempt() {
        let now = Utc::now();
        let t = plan(&job_at_attempt(3, 3), Outcome::Cancelled("shutdown".into()), now);
        assert_eq!(
            t,
            Transition::Retry {
                scheduled_for: now + chrono::Duration::seconds(30),
                error: "Cancelled: shutdown".to_string(),
                refund_attempt: true,
            }
        );
    }

    #[test]
    fn config_and_fatal_errors_share_the_exhaustion_check() {
        let now = Utc::now();
        let config = plan(&job_at_attempt(1, 3), Outcome::ConfigError("bad".into()), now);
        assert_eq!(config.status(), JobStatus::Pending);
        assert_eq!(config.error(), Some("ConfigError: bad (attempt 1/3)"));

        let fatal = plan(&job_at_attempt(2, 3), Outcome::Fatal("gone".into()), now);
        match fatal {
            Transition::Retry { scheduled_for, .. } => {
                assert_eq!(scheduled_for, now + chrono::Duration::seconds(120));
            }
            other => panic!("expected retry, got {other:?}"),
        }

        for outcome in [Outcome::ConfigError("bad".into()), Outcome::Fatal("gone".into())] {
            let last = plan(&job_at_attempt(3, 3), outcome, now);
            assert_eq!(last.status(), JobStatus::DeadLetter);
        }
    }

    #[test]
    fn running_jobs_only_complete_retry_or_dead_letter() {
        let outcomes = || {
            vec![
                Outcome::Success(json!(null)),
                Outcome::Retryable("r".into()),
                Outcome::Fatal("f".into()),
                Outcome::ConfigError("c".into()),
                Outcome::Timeout(Duration::from_secs(1)),
                Outcome::Cancelled("x".into()),
            ]
        };
        for attempts in 1..=3 {
            for outcome in outcomes() {
                let status = plan(&job_at_attempt(attempts, 3), outcome, Utc::now()).status();
                assert!(matches!(
                    status,
                    JobStatus::Completed | JobStatus::Pending | JobStatus::DeadLetter
                ));
            }
        }
    }

    #[test]
    fn job_errors_map_onto_outcomes() {
        assert_eq!(
            Outcome::from(JobError::config("x")),
            Outcome::ConfigError("x".into())
        );
        assert_eq!(
            Outcome::from(JobError::execution("x")),
            Outcome::Retryable("x".into())
        );
        assert_eq!(Outcome::from(JobError::fatal("x")), Outcome::Fatal("x".into()));
        assert_eq!(
            Outcome::from(JobError::cancelled("x")),
            Outcome::Cancelled("x".into())
        );
        assert_eq!(
            Outcome::ConfigError("x".into()).error_kind(),
            Some(ErrorKind::Config)
        );
        assert_eq!(
            Outcome::Timeout(Duration::from_secs(1)).error_kind(),
            Some(ErrorKind::Execution)
        );
    }
}
