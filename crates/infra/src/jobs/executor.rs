//! Runs one claimed job to a persisted outcome.
//!
//! Per job:
//!
//! 1. `begin_attempt` commits the attempt count before anything runs. Every
//!    write for the attempt presents the job's claim token, so a worker that
//!    lost its lease cannot overwrite the next claim.
//! 2. A session opens a nested scope and binds the job's tenant.
//! 3. The handler runs under a timeout, a cancellation token and a panic
//!    guard, while a heartbeat task keeps the lease alive.
//! 4. The scope is released (success) or rolled back (failure) and the
//!    tenant binding cleared. Dropping the session backs this up when a
//!    clean release is impossible.
//! 5. The planned [`Transition`] commits together with the handler's writes,
//!    falling back to a detached write if the session cannot commit.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, instrument, warn};

use crate::config::JobsConfig;

use super::error::StoreError;
use super::outcome::{ErrorKind, Outcome, Transition, plan_transition};
use super::registry::HandlerRegistry;
use super::result::ResultLimits;
use super::store::{JobSession, JobStore};
use super::types::{ClaimToken, Job, JobId, JobStatus, JobType, RetryPolicy, chrono_offset};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    /// The job carried no claim token, or was no longer running under it
    /// with budget left when the attempt started (reaped, deleted or
    /// finished elsewhere).
    #[error("job {0} is not claimed for execution")]
    NotClaimed(JobId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What one execution persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub job_id: JobId,
    pub status: JobStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

#[derive(Debug, Clone)]
struct ExecutorSettings {
    handler_timeout: Duration,
    heartbeat_interval: Duration,
    lease_duration: Duration,
    retry: RetryPolicy,
    result_limits: ResultLimits,
}

/// Executes claimed jobs against registered handlers.
pub struct JobExecutor<S: JobStore> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry<S::Session>>,
    settings: ExecutorSettings,
}

impl<S: JobStore> JobExecutor<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<HandlerRegistry<S::Session>>,
        config: &JobsConfig,
    ) -> Self {
        Self {
            store,
            registry,
            settings: ExecutorSettings {
                handler_timeout: config.handler_timeout,
                heartbeat_interval: config.heartbeat_interval,
                lease_duration: config.lease_duration,
                retry: config.retry.clone(),
                result_limits: config.result_limits,
            },
        }
    }

    /// Job types with a registered handler.
    pub fn handled_types(&self) -> Vec<JobType> {
        self.registry.job_types()
    }

    /// Execute one claimed job and persist its outcome.
    ///
    /// Handler failures of any kind become job transitions; only store
    /// failures are returned as errors.
    #[instrument(
        name = "job.execute",
        skip_all,
        fields(job.id = %job.id, job.type = %job.job_type, tenant_id = ?job.tenant_id)
    )]
    pub async fn execute(
        &self,
        job: Job,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport, ExecutorError> {
        let token = job.claim_token.ok_or(ExecutorError::NotClaimed(job.id))?;
        let job = self
            .store
            .begin_attempt(job.id, token, Utc::now())
            .await?
            .ok_or(ExecutorError::NotClaimed(job.id))?;
        debug!(attempt = job.attempts, max_attempts = job.max_attempts, "attempt started");

        let heartbeat = self.spawn_heartbeat(job.id, token);
        let (outcome, session) = self.run_attempt(&job, cancel).await;
        drop(heartbeat);

        let error_kind = outcome.error_kind();
        let now = Utc::now();
        let transition = plan_transition(
            &job,
            outcome,
            now,
            &self.settings.retry,
            &self.settings.result_limits,
        );

        self.persist(&job, token, session, &transition).await?;

        let report = ExecutionReport {
            job_id: job.id,
            status: transition.status(),
            attempts: match &transition {
                Transition::Retry {
                    refund_attempt: true,
                    ..
                } => job.attempts.saturating_sub(1),
                _ => job.attempts,
            },
            error: transition.error().map(str::to_owned),
            error_kind,
        };
        match &report.error {
            None => info!(status = %report.status, "job completed"),
            Some(error) => warn!(status = %report.status, error = %error, "job attempt failed"),
        }
        Ok(report)
    }

    /// Steps 2 through 4. The session is handed back only if it is still
    /// usable for the final commit.
    async fn run_attempt(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> (Outcome, Option<S::Session>) {
        let retryable = |what: &str, err: StoreError| {
            (Outcome::Retryable(format!("failed to {what}: {err}")), None)
        };
        let mut session = match self.store.open_session().await {
            Ok(session) => session,
            Err(err) => return retryable("open session", err),
        };
        if let Err(err) = session.begin_scope().await {
            return retryable("open handler scope", err);
        }
        if let Some(tenant_id) = job.tenant_id {
            if let Err(err) = session.bind_tenant(tenant_id).await {
                return retryable("bind tenant context", err);
            }
        }

        let outcome = self.invoke(job, &mut session, cancel).await;

        match close_scope(&mut session, outcome.is_success()).await {
            Ok(()) => (outcome, Some(session)),
            Err(err) => {
                warn!(error = %err, "handler scope did not close cleanly; discarding session");
                let outcome = if outcome.is_success() {
                    Outcome::Retryable(format!("failed to keep handler writes: {err}"))
                } else {
                    outcome
                };
                (outcome, None)
            }
        }
    }

    async fn invoke(
        &self,
        job: &Job,
        session: &mut S::Session,
        cancel: &CancellationToken,
    ) -> Outcome {
        let Some(handler) = self.registry.resolve(job.job_type) else {
            return Outcome::ConfigError(format!(
                "no handler registered for job type '{}'",
                job.job_type
            ));
        };

        let budget = self.settings.handler_timeout;
        let run = AssertUnwindSafe(handler.execute(job, session)).catch_unwind();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Cancelled("worker shutting down".to_string()),
            res = tokio::time::timeout(budget, run) => match res {
                Err(_) => Outcome::Timeout(budget),
                Ok(Err(panic)) => {
                    Outcome::Retryable(format!("handler panicked: {}", panic_message(&*panic)))
                }
                Ok(Ok(Ok(value))) => Outcome::Success(value),
                Ok(Ok(Err(err))) => Outcome::from(err),
            },
        }
    }

    async fn persist(
        &self,
        job: &Job,
        token: ClaimToken,
        session: Option<S::Session>,
        transition: &Transition,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        if let Some(mut session) = session {
            let committed = match self
                .store
                .finish_in(&mut session, job.id, token, transition, now)
                .await
            {
                Ok(()) => session.commit().await,
                Err(err) => Err(err),
            };
            match committed {
                Ok(()) => return Ok(()),
                // The claim moved on; a detached write would fail the same way.
                Err(err @ StoreError::InvalidState(_)) => return Err(err),
                Err(err) => {
                    warn!(error = %err, "session commit failed; persisting outcome detached")
                }
            }
        }
        self.store.finish(job.id, token, transition, now).await
    }

    fn spawn_heartbeat(&self, job_id: JobId, token: ClaimToken) -> Heartbeat {
        let store = Arc::clone(&self.store);
        let interval = self.settings.heartbeat_interval;
        let lease = self.settings.lease_duration;

        let task = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let until = Utc::now() + chrono_offset(lease);
                    match store.extend_lease(job_id, token, until).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!("lease lost to another claim; heartbeat stopped");
                            break;
                        }
                        Err(err) => warn!(error = %err, "lease heartbeat failed"),
                    }
                }
            }
            .in_current_span(),
        );
        Heartbeat(task)
    }
}

/// Release the nested scope and the tenant binding.
async fn close_scope<T: JobSession>(session: &mut T, keep_writes: bool) -> Result<(), StoreError> {
    let bound = session.current_tenant().is_some();
    if keep_writes {
        if bound {
            session.clear_tenant().await?;
        }
        session.release_scope().await
    } else {
        session.rollback_scope().await?;
        if bound {
            session.clear_tenant().await?;
        }
        Ok(())
    }
}

/// Aborts the heartbeat task when dropped, on every exit path.
struct Heartbeat(JoinHandle<()>);

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
