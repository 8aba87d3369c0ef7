//! Job subsystem wiring shared by the HTTP handlers and the worker loop.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::error;

use costwise_infra::config::JobsConfig;
use costwise_infra::jobs::{
    BatchReport, BatchRunner, ClaimFilter, Claimer, ConnectionLimiter, Enqueuer, HandlerRegistry,
    JobExecutor, JobStore, JobType, JobWorker, LeaseReaper, StatusFeed,
};

pub struct JobServices<S: JobStore> {
    pub store: Arc<S>,
    pub enqueuer: Enqueuer<S>,
    pub feed: StatusFeed<S>,
    pub config: JobsConfig,
    runner: Arc<BatchRunner<S>>,
    handled_types: Vec<JobType>,
    shutdown: CancellationToken,
}

impl<S: JobStore> JobServices<S> {
    pub fn new(
        store: Arc<S>,
        registry: HandlerRegistry<S::Session>,
        config: JobsConfig,
    ) -> Self {
        let handled_types = registry.job_types();
        let registry = Arc::new(registry);
        let runner = BatchRunner::new(
            Claimer::new(Arc::clone(&store), config.worker_id.clone(), config.lease_duration),
            JobExecutor::new(Arc::clone(&store), registry, &config),
            config.error_sample_limit,
        );
        let feed = StatusFeed::new(
            Arc::clone(&store),
            ConnectionLimiter::new(config.stream_max_connections_per_tenant),
            config.stream_interval,
        );

        Self {
            enqueuer: Enqueuer::new(Arc::clone(&store), config.default_max_attempts),
            store,
            feed,
            runner: Arc::new(runner),
            handled_types,
            shutdown: CancellationToken::new(),
            config,
        }
    }

    /// Run one batch on the request path. Cancelled by process shutdown.
    ///
    /// The batch runs on its own task, so a client that disconnects
    /// mid-request does not strand claimed jobs in `running`.
    pub async fn run_batch(&self, filter: ClaimFilter) -> BatchReport {
        let runner = Arc::clone(&self.runner);
        let cancel = self.shutdown.child_token();
        let batch = tokio::spawn(async move { runner.run(&filter, &cancel).await });
        match batch.await {
            Ok(report) => report,
            Err(err) => {
                error!(error = %err, "job batch task ended abnormally");
                BatchReport {
                    batch_error: Some("batch run aborted".to_string()),
                    ..BatchReport::default()
                }
            }
        }
    }

    /// Job types this process can execute.
    pub fn handled_types(&self) -> Vec<JobType> {
        self.handled_types.clone()
    }

    /// A background worker sharing this process's batch runner.
    pub fn worker(&self) -> JobWorker<S> {
        JobWorker::new(
            Arc::clone(&self.runner),
            LeaseReaper::new(Arc::clone(&self.store), self.config.retry.cancellation_delay),
            &self.config,
        )
    }

    /// Cancelling this token stops request-path batch runs.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
