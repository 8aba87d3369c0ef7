//! Per-tenant live job status feed.
//!
//! A [`StatusFeed`] polls a tenant's recent jobs on an interval, diffs them
//! against what the connection has already seen, and pushes only what
//! changed. Connection counts are process-local.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, debug, info_span, warn};

use costwise_core::TenantId;

use super::store::JobStore;
use super::types::{Job, JobId, JobSummary};

/// Finished jobs stay in the feed this many seconds after their last update.
const FINISHED_WINDOW_SECS: i64 = 60;
const CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("tenant {tenant_id} already has {limit} open status streams")]
    TooManyConnections { tenant_id: TenantId, limit: usize },
}

#[derive(Debug)]
struct LimiterState {
    max_per_tenant: usize,
    counts: Mutex<HashMap<TenantId, usize>>,
}

/// Caps concurrent stream connections per tenant.
#[derive(Debug, Clone)]
pub struct ConnectionLimiter {
    state: Arc<LimiterState>,
}

impl ConnectionLimiter {
    pub fn new(max_per_tenant: usize) -> Self {
        Self {
            state: Arc::new(LimiterState {
                max_per_tenant,
                counts: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Take a slot, or fail if the tenant is at its cap.
    pub fn try_acquire(&self, tenant_id: TenantId) -> Result<ConnectionPermit, StreamError> {
        let mut counts = self
            .state
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(tenant_id).or_insert(0);
        if *count >= self.state.max_per_tenant {
            return Err(StreamError::TooManyConnections {
                tenant_id,
                limit: self.state.max_per_tenant,
            });
        }
        *count += 1;
        Ok(ConnectionPermit {
            tenant_id,
            state: Arc::clone(&self.state),
        })
    }

    pub fn active(&self, tenant_id: TenantId) -> usize {
        self.state
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&tenant_id)
            .copied()
            .unwrap_or(0)
    }
}

/// One occupied connection slot; released on drop.
#[derive(Debug)]
pub struct ConnectionPermit {
    tenant_id: TenantId,
    state: Arc<LimiterState>,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        let mut counts = self
            .state
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = counts.get_mut(&self.tenant_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&self.tenant_id);
            }
        }
    }
}

/// Remembers the last fingerprint sent per job on one connection.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    seen: HashMap<JobId, String>,
}

impl DeltaTracker {
    /// Jobs whose fingerprint differs from the last one sent. Jobs absent
    /// from `snapshot` are forgotten.
    pub fn diff(&mut self, snapshot: &[Job]) -> Vec<JobSummary> {
        let mut changed = Vec::new();
        let mut next = HashMap::with_capacity(snapshot.len());
        for job in snapshot {
            let fingerprint = job.fingerprint();
            if self.seen.get(&job.id) != Some(&fingerprint) {
                changed.push(job.summary());
            }
            next.insert(job.id, fingerprint);
        }
        self.seen = next;
        changed
    }
}

/// Events pushed to a status stream client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    Jobs { jobs: Vec<JobSummary> },
    Heartbeat { at: DateTime<Utc> },
    Error { message: String },
}

impl StatusEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            StatusEvent::Jobs { .. } => "jobs",
            StatusEvent::Heartbeat { .. } => "heartbeat",
            StatusEvent::Error { .. } => "error",
        }
    }
}

/// Opens per-tenant status streams over a store.
pub struct StatusFeed<S> {
    store: Arc<S>,
    limiter: ConnectionLimiter,
    interval: Duration,
}

impl<S> Clone for StatusFeed<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            limiter: self.limiter.clone(),
            interval: self.interval,
        }
    }
}

impl<S: JobStore> StatusFeed<S> {
    pub fn new(store: Arc<S>, limiter: ConnectionLimiter, interval: Duration) -> Self {
        Self {
            store,
            limiter,
            interval,
        }
    }

    pub fn limiter(&self) -> &ConnectionLimiter {
        &self.limiter
    }

    /// Open a stream for `tenant_id`, or fail if the tenant is at its cap.
    ///
    /// The slot is held until the returned stream is dropped.
    pub fn open(&self, tenant_id: TenantId) -> Result<StatusStream, StreamError> {
        let permit = self.limiter.try_acquire(tenant_id)?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let span = info_span!("job.status_stream", tenant_id = %tenant_id);
        let task = tokio::spawn(
            poll_loop(Arc::clone(&self.store), tenant_id, self.interval, tx).instrument(span),
        );
        Ok(StatusStream {
            rx: ReceiverStream::new(rx),
            task,
            _permit: permit,
        })
    }
}

async fn poll_loop<S: JobStore>(
    store: Arc<S>,
    tenant_id: TenantId,
    interval: Duration,
    tx: mpsc::Sender<StatusEvent>,
) {
    let mut tracker = DeltaTracker::default();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let now = Utc::now();

        let since = now - chrono::Duration::seconds(FINISHED_WINDOW_SECS);
        match store.status_snapshot(tenant_id, since).await {
            Ok(snapshot) => {
                let jobs = tracker.diff(&snapshot);
                if !jobs.is_empty() && tx.send(StatusEvent::Jobs { jobs }).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(error = %err, "status snapshot failed");
                let event = StatusEvent::Error {
                    message: "failed to load job status".to_string(),
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        }

        if tx.send(StatusEvent::Heartbeat { at: now }).await.is_err() {
            break;
        }
    }
    debug!("status stream closed");
}

/// Stream of status events for one connection; owns its connection slot.
#[derive(Debug)]
pub struct StatusStream {
    rx: ReceiverStream<StatusEvent>,
    task: JoinHandle<()>,
    _permit: ConnectionPermit,
}

impl Stream for StatusStream {
    type Item = StatusEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().rx).poll_next(cx)
    }
}

impl Drop for StatusStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}
