//! Durable background jobs for tenant cost work.
//!
//! A job is submitted once through [`Enqueuer`] (deduplication keys make
//! resubmission idempotent) and waits as `pending` until a [`Claimer`] locks
//! it for one worker. Claiming stamps a lease and a [`ClaimToken`]; the
//! [`JobExecutor`] checkpoints the attempt, runs the registered handler inside
//! the job's tenant session and persists the resulting [`Transition`] only
//! while that token is still current. Failed attempts go back to `pending`
//! with exponential backoff until the attempt budget runs out, then the job is
//! dead-lettered for an operator to requeue.
//!
//! [`BatchRunner`] drives one claim-and-execute round and is shared by the
//! HTTP trigger and the [`JobWorker`] polling loop. [`LeaseReaper`] returns
//! jobs whose worker stopped heartbeating, and [`StatusFeed`] streams
//! per-tenant status deltas.

pub mod batch;
pub mod claimer;
pub mod enqueue;
pub mod error;
pub mod executor;
pub mod outcome;
pub mod reaper;
pub mod registry;
pub mod result;
pub mod store;
pub mod stream;
pub mod types;
pub mod worker;

pub use batch::{BatchReport, BatchRunner, ErrorSample};
pub use claimer::Claimer;
pub use enqueue::{EnqueueError, EnqueueRequest, Enqueued, Enqueuer};
pub use error::{JobError, StoreError};
pub use executor::{ExecutionReport, ExecutorError, JobExecutor};
pub use outcome::{ErrorKind, Outcome, Transition, plan_transition};
pub use reaper::LeaseReaper;
pub use registry::{HandlerRegistry, JobHandler};
pub use result::{ResultLimits, cap_result};
pub use store::{
    ClaimFilter, ClaimStamp, InMemoryJobStore, InMemorySession, JobListQuery, JobSession,
    JobSort, JobStore, PgJobSession, PostgresJobStore, ReapedLeases,
};
pub use stream::{
    ConnectionLimiter, ConnectionPermit, DeltaTracker, StatusEvent, StatusFeed, StatusStream,
    StreamError,
};
pub use types::{
    ClaimToken, Job, JobId, JobStats, JobStatus, JobSummary, JobType, NewJob, RetryPolicy,
    client_error_summary,
};
pub use worker::{JobWorker, JobWorkerHandle};
