//! Long-running worker loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::JobsConfig;

use super::batch::BatchRunner;
use super::reaper::LeaseReaper;
use super::store::{ClaimFilter, JobStore};

/// Polls the queue, runs batches and periodically reaps expired leases.
pub struct JobWorker<S: JobStore> {
    runner: Arc<BatchRunner<S>>,
    reaper: LeaseReaper<S>,
    filter: ClaimFilter,
    poll_interval: Duration,
    poll_jitter: Duration,
    reap_every_ticks: u32,
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct JobWorkerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl JobWorkerHandle {
    /// Request graceful shutdown and wait for the loop to exit.
    ///
    /// In-flight handlers are cancelled and their jobs released.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.join.await {
            error!(error = %err, "job worker task ended abnormally");
        }
    }
}

impl<S: JobStore> JobWorker<S> {
    pub fn new(runner: Arc<BatchRunner<S>>, reaper: LeaseReaper<S>, config: &JobsConfig) -> Self {
        Self {
            runner,
            reaper,
            filter: ClaimFilter::new(config.batch_size),
            poll_interval: config.poll_interval,
            poll_jitter: config.poll_jitter,
            reap_every_ticks: config.reap_every_ticks.max(1),
        }
    }

    pub fn spawn(self) -> JobWorkerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let join = tokio::spawn(async move { self.run(token).await });
        JobWorkerHandle { cancel, join }
    }

    /// Run until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(batch_size = self.filter.limit, "job worker started");
        let mut tick: u64 = 0;

        while !cancel.is_cancelled() {
            if tick % u64::from(self.reap_every_ticks) == 0 {
                if let Err(err) = self.reaper.reap(Utc::now()).await {
                    warn!(error = %err, "lease reaper failed");
                }
            }
            tick = tick.wrapping_add(1);

            let report = self.runner.run(&self.filter, &cancel).await;
            let full_batch = report.batch_error.is_none() && report.claimed >= self.filter.limit;
            if full_batch {
                debug!("batch was full; polling again immediately");
                continue;
            }

            let pause = self.sleep_duration_with_jitter();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("job worker stopped");
    }

    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.poll_jitter.is_zero() {
            return self.poll_interval;
        }
        let jitter_millis = u64::try_from(self.poll_jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }
}
