//! Batch claim: pending to running, exclusive per job.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, instrument};

use super::error::StoreError;
use super::store::{ClaimFilter, ClaimStamp, JobStore};
use super::types::{Job, chrono_offset};

/// Claims jobs on behalf of one worker identity.
pub struct Claimer<S> {
    store: Arc<S>,
    worker_id: String,
    lease: Duration,
}

impl<S: JobStore> Claimer<S> {
    pub fn new(store: Arc<S>, worker_id: impl Into<String>, lease: Duration) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            lease,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim up to `filter.limit` eligible jobs, in claim order.
    ///
    /// Jobs held by a concurrent claimer are skipped, never waited on; an
    /// empty result just means nothing was free.
    #[instrument(skip(self), fields(worker_id = %self.worker_id), err)]
    pub async fn claim(&self, filter: &ClaimFilter) -> Result<Vec<Job>, StoreError> {
        let now = Utc::now();
        let stamp = ClaimStamp {
            worker_id: self.worker_id.clone(),
            now,
            lease_expires_at: now + chrono_offset(self.lease),
        };

        let jobs = self.store.claim(filter, &stamp).await?;
        debug!(claimed = jobs.len(), "claimed batch");
        Ok(jobs)
    }
}
