//! Batch orchestration: claim, then execute each job sequentially.

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use super::claimer::Claimer;
use super::executor::JobExecutor;
use super::outcome::ErrorKind;
use super::store::{ClaimFilter, JobStore};
use super::types::{JobId, client_error_summary};

/// One failed job in a batch. `error` holds only the failure class; the full
/// message stays in the job row and the logs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorSample {
    pub job_id: JobId,
    pub error: String,
    pub kind: ErrorKind,
}

/// Aggregate result of one batch run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub claimed: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Bounded; see `error_sample_limit`.
    pub errors: Vec<ErrorSample>,
    /// Set when the claim itself failed; nothing was processed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_error: Option<String>,
}

impl BatchReport {
    fn sample(&mut self, limit: usize, sample: ErrorSample) {
        if self.errors.len() < limit {
            self.errors.push(sample);
        }
    }
}

pub struct BatchRunner<S: JobStore> {
    claimer: Claimer<S>,
    executor: JobExecutor<S>,
    error_sample_limit: usize,
}

impl<S: JobStore> BatchRunner<S> {
    pub fn new(claimer: Claimer<S>, executor: JobExecutor<S>, error_sample_limit: usize) -> Self {
        Self {
            claimer,
            executor,
            error_sample_limit,
        }
    }

    /// Claim a batch and run every claimed job.
    ///
    /// Only job types with a registered handler are claimed; others stay
    /// pending. Never fails: per-job errors are counted and sampled, a claim
    /// failure is reported in `batch_error`.
    #[instrument(
        name = "job.batch",
        skip(self, cancel),
        fields(worker_id = %self.claimer.worker_id())
    )]
    pub async fn run(&self, filter: &ClaimFilter, cancel: &CancellationToken) -> BatchReport {
        let mut report = BatchReport::default();

        let filter = self.handled(filter);
        let jobs = match self.claimer.claim(&filter).await {
            Ok(jobs) => jobs,
            Err(err) => {
                error!(error = %err, "failed to claim job batch");
                report.batch_error = Some(err.to_string());
                return report;
            }
        };
        report.claimed = jobs.len();

        // Claimed jobs are all driven to a transition, even after cancellation:
        // the executor releases them as cancelled instead of leaving them running.
        for job in jobs {
            let job_id = job.id;
            report.processed += 1;
            match self.executor.execute(job, cancel).await {
                Ok(outcome) if outcome.succeeded() => report.succeeded += 1,
                Ok(outcome) => {
                    report.failed += 1;
                    report.sample(
                        self.error_sample_limit,
                        ErrorSample {
                            job_id,
                            error: client_error_summary(&outcome.error.unwrap_or_default()),
                            kind: outcome.error_kind.unwrap_or(ErrorKind::Execution),
                        },
                    );
                }
                Err(err) => {
                    error!(job.id = %job_id, error = %err, "job execution could not be persisted");
                    report.failed += 1;
                    report.sample(
                        self.error_sample_limit,
                        ErrorSample {
                            job_id,
                            error: client_error_summary(&err.to_string()),
                            kind: ErrorKind::Execution,
                        },
                    );
                }
            }
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                succeeded = report.succeeded,
                failed = report.failed,
                "job batch finished"
            );
        }
        report
    }

    /// Narrow `filter` to the job types this runner can execute.
    fn handled(&self, filter: &ClaimFilter) -> ClaimFilter {
        let handled = self.executor.handled_types();
        let admitted = match &filter.job_types {
            Some(requested) => handled.into_iter().filter(|t| requested.contains(t)).collect(),
            None => handled,
        };
        filter.clone().with_job_types(admitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobsConfig;
    use crate::jobs::error::JobError;
    use crate::jobs::registry::{HandlerRegistry, JobHandler};
    use crate::jobs::store::{InMemoryJobStore, InMemorySession};
    use crate::jobs::types::{Job, JobStatus, JobType, NewJob};
    use async_trait::async_trait;
    use chrono::Utc;
    use costwise_core::TenantId;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::time::Duration;

    struct FailsWhenFlagged;

    #[async_trait]
    impl JobHandler<InMemorySession> for FailsWhenFlagged {
        async fn execute(
            &self,
            job: &Job,
            _session: &mut InMemorySession,
        ) -> Result<Value, JobError> {
            match job.payload.get("mode").and_then(Value::as_str) {
                Some("fail") => Err(JobError::execution("upstream 10.0.3.7 unavailable")),
                Some("config") => Err(JobError::config("missing account_id")),
                Some("panic") => panic!("handler bug"),
                _ => Ok(json!({"ok": true})),
            }
        }
    }

    fn runner(
        store: &Arc<InMemoryJobStore>,
        sample_limit: usize,
    ) -> BatchRunner<InMemoryJobStore> {
        let config = JobsConfig::default()
            .with_worker_id("batch-test")
            .with_handler_timeout(Duration::from_secs(5));
        let mut registry = HandlerRegistry::new();
        registry.register(JobType::ResourceScan, || FailsWhenFlagged);
        let registry = Arc::new(registry);
        BatchRunner::new(
            Claimer::new(Arc::clone(store), config.worker_id.clone(), config.lease_duration),
            JobExecutor::new(Arc::clone(store), registry, &config),
            sample_limit,
        )
    }

    async fn enqueue(store: &InMemoryJobStore, mode: &str, priority: i32) -> JobId {
        store
            .insert(NewJob {
                id: JobId::new(),
                tenant_id: Some(TenantId::new()),
                job_type: JobType::ResourceScan,
                payload: json!({"mode": mode}),
                priority,
                scheduled_for: Utc::now(),
                max_attempts: 3,
                deduplication_key: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn one_failing_job_does_not_abort_the_batch() {
        let store = InMemoryJobStore::arc();
        enqueue(&store, "fail", 10).await;
        enqueue(&store, "panic", 9).await;
        let ok_a = enqueue(&store, "ok", 5).await;
        let config_err = enqueue(&store, "config", 1).await;
        let ok_b = enqueue(&store, "ok", 0).await;

        let report = runner(&store, 10)
            .run(&ClaimFilter::new(10), &CancellationToken::new())
            .await;

        assert_eq!(report.claimed, 5);
        assert_eq!(report.processed, 5);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 3);
        assert!(report.batch_error.is_none());

        let kinds: Vec<_> = report.errors.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![ErrorKind::Execution, ErrorKind::Execution, ErrorKind::Config]
        );
        assert_eq!(report.errors[2].job_id, config_err);
        let messages: Vec<_> = report.errors.iter().map(|e| e.error.as_str()).collect();
        assert_eq!(messages, vec!["ExecutionError", "ExecutionError", "ConfigError"]);

        for id in [ok_a, ok_b] {
            assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Completed);
        }
        assert_eq!(store.bound_tenant_sessions(), 0);
    }

    #[tokio::test]
    async fn error_samples_are_bounded() {
        let store = InMemoryJobStore::arc();
        for _ in 0..5 {
            enqueue(&store, "fail", 0).await;
        }

        let report = runner(&store, 2)
            .run(&ClaimFilter::new(10), &CancellationToken::new())
            .await;

        assert_eq!(report.failed, 5);
        assert_eq!(report.errors.len(), 2);
    }

    #[tokio::test]
    async fn claim_failure_is_a_single_batch_error() {
        let store = InMemoryJobStore::arc();
        enqueue(&store, "ok", 0).await;
        store.set_unavailable(true);

        let report = runner(&store, 10)
            .run(&ClaimFilter::new(10), &CancellationToken::new())
            .await;

        assert_eq!(report.processed, 0);
        assert!(report.batch_error.unwrap().contains("unavailable"));
    }

    #[tokio::test]
    async fn cancelled_batch_releases_claimed_jobs() {
        let store = InMemoryJobStore::arc();
        let a = enqueue(&store, "ok", 0).await;
        let b = enqueue(&store, "ok", 0).await;
        let token = CancellationToken::new();
        token.cancel();

        let report = runner(&store, 10).run(&ClaimFilter::new(10), &token).await;

        assert_eq!(report.claimed, 2);
        assert_eq!(report.succeeded, 0);
        for id in [a, b] {
            let job = store.get(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Pending);
            assert_eq!(job.attempts, 0);
        }
    }

    #[tokio::test]
    async fn error_samples_do_not_leak_handler_messages() {
        let store = InMemoryJobStore::arc();
        let failing = enqueue(&store, "fail", 0).await;

        let report = runner(&store, 10)
            .run(&ClaimFilter::new(10), &CancellationToken::new())
            .await;

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].error, "ExecutionError");
        let body = serde_json::to_string(&report).unwrap();
        assert!(!body.contains("10.0.3.7"));

        let stored = store.get(failing).await.unwrap().unwrap();
        assert!(stored.error_message.unwrap().contains("10.0.3.7"));
    }

    #[tokio::test]
    async fn jobs_without_a_handler_stay_pending() {
        let store = InMemoryJobStore::arc();
        let handled = enqueue(&store, "ok", 0).await;
        let orphan = store
            .insert(NewJob {
                id: JobId::new(),
                tenant_id: None,
                job_type: JobType::Maintenance,
                payload: json!({}),
                priority: 100,
                scheduled_for: Utc::now(),
                max_attempts: 3,
                deduplication_key: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap()
            .id;

        let report = runner(&store, 10)
            .run(&ClaimFilter::new(10), &CancellationToken::new())
            .await;

        assert_eq!(report.claimed, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(store.get(handled).await.unwrap().unwrap().status, JobStatus::Completed);
        let orphan = store.get(orphan).await.unwrap().unwrap();
        assert_eq!(orphan.status, JobStatus::Pending);
        assert_eq!(orphan.attempts, 0);
        assert!(orphan.error_message.is_none());
    }
}
