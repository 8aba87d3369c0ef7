//! Reclaims jobs whose worker stopped heartbeating.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{instrument, warn};

use super::error::StoreError;
use super::store::{JobStore, ReapedLeases};
use super::types::chrono_offset;

pub struct LeaseReaper<S> {
    store: Arc<S>,
    retry_delay: Duration,
}

impl<S: JobStore> LeaseReaper<S> {
    pub fn new(store: Arc<S>, retry_delay: Duration) -> Self {
        Self { store, retry_delay }
    }

    /// Requeue (or dead-letter, when exhausted) running jobs whose lease
    /// expired before `now`.
    #[instrument(name = "job.reap", skip(self), err)]
    pub async fn reap(&self, now: DateTime<Utc>) -> Result<ReapedLeases, StoreError> {
        let reaped = self
            .store
            .reap_expired(now, now + chrono_offset(self.retry_delay))
            .await?;
        if !reaped.is_empty() {
            warn!(
                requeued = reaped.requeued.len(),
                dead_lettered = reaped.dead_lettered.len(),
                "reclaimed jobs with expired leases"
            );
        }
        Ok(reaped)
    }
}
