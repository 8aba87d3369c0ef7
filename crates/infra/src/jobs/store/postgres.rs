//! Postgres-backed job store.
//!
//! ## Claiming
//!
//! Claims run in a transaction that selects eligible rows with
//! `FOR UPDATE SKIP LOCKED` and flips them to `running` before commit. Rows
//! locked by a concurrent claimer are skipped rather than waited on, so two
//! workers never receive the same job.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `UniqueViolation` |
//! | Database (check constraint violation) | `23514` | `InvalidState` |
//! | Database (other) | Any other | `Database` |
//! | PoolClosed / PoolTimedOut / Io | N/A | `Unavailable` |
//! | Other | N/A | `Database` |

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use costwise_core::TenantId;

use super::{
    ClaimFilter, ClaimStamp, JobListQuery, JobSession, JobSort, JobStore, ReapedLeases,
    SNAPSHOT_LIMIT,
};
use crate::jobs::error::StoreError;
use crate::jobs::outcome::Transition;
use crate::jobs::types::{ClaimToken, Job, JobId, JobStats, JobStatus, JobType, NewJob};

const MIGRATION: &str = include_str!("../../../migrations/0001_create_jobs.sql");
const SAVEPOINT: &str = "job_handler";

macro_rules! job_columns {
    () => {
        "id, tenant_id, job_type, status, payload, result, attempts, max_attempts, priority, \
         scheduled_for, started_at, completed_at, error_message, deduplication_key, worker_id, \
         claim_token, lease_expires_at, created_at, updated_at, is_deleted"
    };
}

/// Postgres job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect with a small default pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `jobs` table and its indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn fetch_job(
        &self,
        job_id: JobId,
        tenant_id: Option<TenantId>,
    ) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM jobs WHERE id = $1 AND NOT is_deleted AND ($2::uuid IS NULL OR tenant_id = $2)"
        ))
        .bind(Uuid::from(job_id))
        .bind(tenant_id.map(Uuid::from))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_job", e))?;
        row.as_ref().map(decode_job).transpose()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    type Session = PgJobSession;

    #[instrument(
        skip(self, job),
        fields(job_id = %job.id, job_type = %job.job_type, tenant_id = ?job.tenant_id),
        err
    )]
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError> {
        let row = sqlx::query(concat!(
            "INSERT INTO jobs (id, tenant_id, job_type, status, payload, attempts, max_attempts, \
             priority, scheduled_for, deduplication_key, created_at, updated_at) \
             VALUES ($1, $2, $3, 'pending', $4, 0, $5, $6, $7, $8, $9, $9) RETURNING ",
            job_columns!()
        ))
        .bind(Uuid::from(job.id))
        .bind(job.tenant_id.map(Uuid::from))
        .bind(job.job_type.as_str())
        .bind(&job.payload)
        .bind(to_i32("max_attempts", job.max_attempts)?)
        .bind(job.priority)
        .bind(job.scheduled_for)
        .bind(job.deduplication_key.as_deref())
        .bind(job.created_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;
        decode_job(&row)
    }

    #[instrument(skip(self), err)]
    async fn find_by_deduplication_key(&self, key: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM jobs WHERE deduplication_key = $1 AND NOT is_deleted"
        ))
        .bind(key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_deduplication_key", e))?;
        row.as_ref().map(decode_job).transpose()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        self.fetch_job(job_id, None).await
    }

    #[instrument(
        skip(self, stamp),
        fields(limit = filter.limit, worker_id = %stamp.worker_id, claimed = tracing::field::Empty),
        err
    )]
    async fn claim(
        &self,
        filter: &ClaimFilter,
        stamp: &ClaimStamp,
    ) -> Result<Vec<Job>, StoreError> {
        if filter.limit == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(filter.limit).unwrap_or(i64::MAX);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("claim.begin", e))?;

        let ids: Vec<Uuid> = sqlx::query(
            r#"
            SELECT id
            FROM jobs
            WHERE status = 'pending'
              AND scheduled_for <= $1
              AND attempts < max_attempts
              AND NOT is_deleted
              AND ($2::uuid IS NULL OR tenant_id = $2)
              AND ($3::text IS NULL OR job_type = $3)
              AND ($4::text[] IS NULL OR job_type = ANY($4))
            ORDER BY priority DESC, scheduled_for ASC
            LIMIT $5
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(stamp.now)
        .bind(filter.tenant_id.map(Uuid::from))
        .bind(filter.job_type.map(|t| t.as_str()))
        .bind(
            filter
                .job_types
                .as_ref()
                .map(|types| types.iter().map(|t| t.as_str()).collect::<Vec<_>>()),
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim.select", e))?
        .iter()
        .map(|row| row.try_get::<Uuid, _>("id"))
        .collect::<Result<_, _>>()
        .map_err(|e| StoreError::Decode(e.to_string()))?;

        if ids.is_empty() {
            tx.commit().await.map_err(|e| map_sqlx_error("claim.commit", e))?;
            return Ok(Vec::new());
        }

        // Each claimed row gets its own token.
        let rows = sqlx::query(concat!(
            "UPDATE jobs SET status = 'running', started_at = $2, worker_id = $3, \
             claim_token = gen_random_uuid(), lease_expires_at = $4, updated_at = $2 \
             WHERE id = ANY($1) RETURNING ",
            job_columns!()
        ))
        .bind(&ids)
        .bind(stamp.now)
        .bind(&stamp.worker_id)
        .bind(stamp.lease_expires_at)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim.update", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("claim.commit", e))?;

        // UPDATE ... RETURNING does not preserve the SELECT order.
        let mut jobs = rows.iter().map(decode_job).collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.scheduled_for.cmp(&b.scheduled_for))
        });

        Span::current().record("claimed", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self, token), fields(job_id = %job_id), err)]
    async fn begin_attempt(
        &self,
        job_id: JobId,
        token: ClaimToken,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(concat!(
            "UPDATE jobs SET attempts = attempts + 1, started_at = $2, updated_at = $2 \
             WHERE id = $1 AND status = 'running' AND claim_token = $3 \
             AND attempts < max_attempts AND NOT is_deleted \
             RETURNING ",
            job_columns!()
        ))
        .bind(Uuid::from(job_id))
        .bind(now)
        .bind(Uuid::from(token))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("begin_attempt", e))?;
        row.as_ref().map(decode_job).transpose()
    }

    async fn extend_lease(
        &self,
        job_id: JobId,
        token: ClaimToken,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET lease_expires_at = $2 \
             WHERE id = $1 AND status = 'running' AND claim_token = $3",
        )
        .bind(Uuid::from(job_id))
        .bind(lease_expires_at)
        .bind(Uuid::from(token))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("extend_lease", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn open_session(&self) -> Result<Self::Session, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("open_session", e))?;
        Ok(PgJobSession { tx, tenant: None })
    }

    #[instrument(
        skip(self, session, token, transition),
        fields(job_id = %job_id, status = %transition.status()),
        err
    )]
    async fn finish_in(
        &self,
        session: &mut Self::Session,
        job_id: JobId,
        token: ClaimToken,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = transition_query(job_id, token, transition, now)
            .execute(session.connection())
            .await
            .map_err(|e| map_sqlx_error("finish_in", e))?;
        ensure_transitioned(job_id, result.rows_affected())
    }

    #[instrument(
        skip(self, token, transition),
        fields(job_id = %job_id, status = %transition.status()),
        err
    )]
    async fn finish(
        &self,
        job_id: JobId,
        token: ClaimToken,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = transition_query(job_id, token, transition, now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("finish", e))?;
        ensure_transitioned(job_id, result.rows_affected())
    }

    #[instrument(
        skip(self),
        fields(requeued = tracing::field::Empty, dead_lettered = tracing::field::Empty),
        err
    )]
    async fn reap_expired(
        &self,
        now: DateTime<Utc>,
        retry_at: DateTime<Utc>,
    ) -> Result<ReapedLeases, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE jobs
            SET status = CASE WHEN attempts < max_attempts THEN 'pending' ELSE 'dead_letter' END,
                scheduled_for = CASE WHEN attempts < max_attempts THEN $2 ELSE scheduled_for END,
                completed_at = CASE WHEN attempts < max_attempts THEN NULL ELSE $1 END,
                error_message = 'LeaseExpired: worker ' || COALESCE(worker_id, 'unknown')
                                || ' stopped renewing its lease',
                worker_id = NULL,
                claim_token = NULL,
                lease_expires_at = NULL,
                updated_at = $1
            WHERE id IN (
                SELECT id FROM jobs
                WHERE status = 'running' AND lease_expires_at < $1 AND NOT is_deleted
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, status
            "#,
        )
        .bind(now)
        .bind(retry_at)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reap_expired", e))?;

        let mut reaped = ReapedLeases::default();
        for row in rows {
            let id: Uuid = row.try_get("id").map_err(|e| StoreError::Decode(e.to_string()))?;
            let status: String = row
                .try_get("status")
                .map_err(|e| StoreError::Decode(e.to_string()))?;
            match parse_status(&status)? {
                JobStatus::DeadLetter => reaped.dead_lettered.push(JobId::from_uuid(id)),
                _ => reaped.requeued.push(JobId::from_uuid(id)),
            }
        }

        let span = Span::current();
        span.record("requeued", reaped.requeued.len());
        span.record("dead_lettered", reaped.dead_lettered.len());
        Ok(reaped)
    }

    #[instrument(skip(self), err)]
    async fn stats(&self, tenant_id: Option<TenantId>) -> Result<JobStats, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*)::bigint AS count
            FROM jobs
            WHERE NOT is_deleted AND ($1::uuid IS NULL OR tenant_id = $1)
            GROUP BY status
            "#,
        )
        .bind(tenant_id.map(Uuid::from))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| StoreError::Decode(e.to_string()))?;
            let count: i64 = row.try_get("count").map_err(|e| StoreError::Decode(e.to_string()))?;
            stats.record(parse_status(&status)?, u64::try_from(count).unwrap_or(0));
        }
        Ok(stats)
    }

    #[instrument(skip(self), err)]
    async fn list(&self, query: &JobListQuery) -> Result<Vec<Job>, StoreError> {
        let sql = match query.sort {
            JobSort::CreatedDesc => concat!(
                "SELECT ",
                job_columns!(),
                " FROM jobs WHERE NOT is_deleted AND ($1::uuid IS NULL OR tenant_id = $1) \
                 AND ($2::text IS NULL OR status = $2) AND ($3::text IS NULL OR job_type = $3) \
                 ORDER BY created_at DESC LIMIT $4"
            ),
            JobSort::CreatedAsc => concat!(
                "SELECT ",
                job_columns!(),
                " FROM jobs WHERE NOT is_deleted AND ($1::uuid IS NULL OR tenant_id = $1) \
                 AND ($2::text IS NULL OR status = $2) AND ($3::text IS NULL OR job_type = $3) \
                 ORDER BY created_at ASC LIMIT $4"
            ),
            JobSort::Priority => concat!(
                "SELECT ",
                job_columns!(),
                " FROM jobs WHERE NOT is_deleted AND ($1::uuid IS NULL OR tenant_id = $1) \
                 AND ($2::text IS NULL OR status = $2) AND ($3::text IS NULL OR job_type = $3) \
                 ORDER BY priority DESC, scheduled_for ASC LIMIT $4"
            ),
        };

        let rows = sqlx::query(sql)
            .bind(query.tenant_id.map(Uuid::from))
            .bind(query.status.map(|s| s.as_str()))
            .bind(query.job_type.map(|t| t.as_str()))
            .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;
        rows.iter().map(decode_job).collect()
    }

    async fn status_snapshot(
        &self,
        tenant_id: TenantId,
        finished_since: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM jobs WHERE tenant_id = $1 AND NOT is_deleted \
             AND (status IN ('pending', 'running') \
                  OR (status IN ('completed', 'failed') AND updated_at >= $2)) \
             ORDER BY updated_at DESC LIMIT $3"
        ))
        .bind(Uuid::from(tenant_id))
        .bind(finished_since)
        .bind(SNAPSHOT_LIMIT as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("status_snapshot", e))?;
        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn requeue_dead_letter(
        &self,
        job_id: JobId,
        tenant_id: Option<TenantId>,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let row = sqlx::query(concat!(
            "UPDATE jobs SET status = 'pending', attempts = 0, scheduled_for = $2, \
             started_at = NULL, completed_at = NULL, updated_at = $2 \
             WHERE id = $1 AND status = 'dead_letter' AND NOT is_deleted \
             AND ($3::uuid IS NULL OR tenant_id = $3) RETURNING ",
            job_columns!()
        ))
        .bind(Uuid::from(job_id))
        .bind(now)
        .bind(tenant_id.map(Uuid::from))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_dead_letter", e))?;

        match row {
            Some(row) => decode_job(&row),
            None => match self.fetch_job(job_id, tenant_id).await? {
                Some(job) => Err(StoreError::InvalidState(format!(
                    "job {job_id} is {}, only dead-lettered jobs can be retried",
                    job.status
                ))),
                None => Err(StoreError::NotFound(job_id)),
            },
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn soft_delete(
        &self,
        job_id: JobId,
        tenant_id: Option<TenantId>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET is_deleted = TRUE, updated_at = $2
            WHERE id = $1 AND NOT is_deleted AND status <> 'running'
              AND ($3::uuid IS NULL OR tenant_id = $3)
            "#,
        )
        .bind(Uuid::from(job_id))
        .bind(now)
        .bind(tenant_id.map(Uuid::from))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("soft_delete", e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        match self.fetch_job(job_id, tenant_id).await? {
            Some(_) => Err(StoreError::InvalidState(format!(
                "job {job_id} is running and cannot be deleted"
            ))),
            None => Err(StoreError::NotFound(job_id)),
        }
    }
}

/// Transaction-backed session.
///
/// Dropping the session without committing rolls the transaction back, which
/// also discards the transaction-local tenant setting.
#[derive(Debug)]
pub struct PgJobSession {
    tx: Transaction<'static, Postgres>,
    tenant: Option<TenantId>,
}

impl PgJobSession {
    /// Connection for handler queries; runs inside the session transaction.
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    async fn run(&mut self, operation: &str, sql: &str) -> Result<(), StoreError> {
        sqlx::Executor::execute(&mut *self.tx, sqlx::raw_sql(sql))
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(())
    }
}

#[async_trait]
impl JobSession for PgJobSession {
    async fn bind_tenant(&mut self, tenant_id: TenantId) -> Result<(), StoreError> {
        sqlx::query("SELECT set_config('app.current_tenant', $1, true)")
            .bind(tenant_id.to_string())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("bind_tenant", e))?;
        self.tenant = Some(tenant_id);
        Ok(())
    }

    async fn clear_tenant(&mut self) -> Result<(), StoreError> {
        sqlx::query("SELECT set_config('app.current_tenant', '', true)")
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("clear_tenant", e))?;
        self.tenant = None;
        Ok(())
    }

    fn current_tenant(&self) -> Option<TenantId> {
        self.tenant
    }

    async fn begin_scope(&mut self) -> Result<(), StoreError> {
        self.run("begin_scope", &format!("SAVEPOINT {SAVEPOINT}")).await
    }

    async fn release_scope(&mut self) -> Result<(), StoreError> {
        self.run("release_scope", &format!("RELEASE SAVEPOINT {SAVEPOINT}"))
            .await
    }

    async fn rollback_scope(&mut self) -> Result<(), StoreError> {
        self.run("rollback_scope", &format!("ROLLBACK TO SAVEPOINT {SAVEPOINT}"))
            .await
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }
}

fn transition_query(
    job_id: JobId,
    token: ClaimToken,
    transition: &Transition,
    now: DateTime<Utc>,
) -> Query<'static, Postgres, PgArguments> {
    // $1 job, $2 claim token, $3 updated_at; the rest depend on the transition.
    match transition {
        Transition::Complete {
            result,
            completed_at,
        } => sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', result = $4, error_message = NULL, completed_at = $5,
                worker_id = NULL, claim_token = NULL, lease_expires_at = NULL, updated_at = $3
            WHERE id = $1 AND claim_token = $2 AND status = 'running' AND NOT is_deleted
            "#,
        )
        .bind(Uuid::from(job_id))
        .bind(Uuid::from(token))
        .bind(now)
        .bind(result.clone())
        .bind(*completed_at),
        Transition::Retry {
            scheduled_for,
            error,
            refund_attempt,
        } => sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', scheduled_for = $4, error_message = $5,
                attempts = CASE WHEN $6 THEN GREATEST(attempts - 1, 0) ELSE attempts END,
                worker_id = NULL, claim_token = NULL, lease_expires_at = NULL, updated_at = $3
            WHERE id = $1 AND claim_token = $2 AND status = 'running' AND NOT is_deleted
            "#,
        )
        .bind(Uuid::from(job_id))
        .bind(Uuid::from(token))
        .bind(now)
        .bind(*scheduled_for)
        .bind(error.clone())
        .bind(*refund_attempt),
        Transition::DeadLetter {
            error,
            completed_at,
        } => sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'dead_letter', error_message = $4, completed_at = $5,
                worker_id = NULL, claim_token = NULL, lease_expires_at = NULL, updated_at = $3
            WHERE id = $1 AND claim_token = $2 AND status = 'running' AND NOT is_deleted
            "#,
        )
        .bind(Uuid::from(job_id))
        .bind(Uuid::from(token))
        .bind(now)
        .bind(error.clone())
        .bind(*completed_at),
    }
}

fn ensure_transitioned(job_id: JobId, rows_affected: u64) -> Result<(), StoreError> {
    if rows_affected == 0 {
        return Err(StoreError::InvalidState(format!(
            "job {job_id} is no longer running under this claim"
        )));
    }
    Ok(())
}

fn to_i32(field: &str, value: u32) -> Result<i32, StoreError> {
    i32::try_from(value)
        .map_err(|_| StoreError::InvalidState(format!("{field} out of range: {value}")))
}

fn parse_status(value: &str) -> Result<JobStatus, StoreError> {
    JobStatus::from_str(value).map_err(|e| StoreError::Decode(e.to_string()))
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::UniqueViolation(msg),
                Some("23514") => StoreError::InvalidState(msg),
                _ => StoreError::Database(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::Io(io) => StoreError::Unavailable(format!("io error in {operation}: {io}")),
        _ => StoreError::Database(format!("sqlx error in {operation}: {err}")),
    }
}

struct JobRow {
    id: Uuid,
    tenant_id: Option<Uuid>,
    job_type: String,
    status: String,
    payload: serde_json::Value,
    result: Option<serde_json::Value>,
    attempts: i32,
    max_attempts: i32,
    priority: i32,
    scheduled_for: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    deduplication_key: Option<String>,
    worker_id: Option<String>,
    claim_token: Option<Uuid>,
    lease_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    is_deleted: bool,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            job_type: row.try_get("job_type")?,
            status: row.try_get("status")?,
            payload: row.try_get("payload")?,
            result: row.try_get("result")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            priority: row.try_get("priority")?,
            scheduled_for: row.try_get("scheduled_for")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error_message: row.try_get("error_message")?,
            deduplication_key: row.try_get("deduplication_key")?,
            worker_id: row.try_get("worker_id")?,
            claim_token: row.try_get("claim_token")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            is_deleted: row.try_get("is_deleted")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let counter = |field: &str, v: i32| {
            u32::try_from(v).map_err(|_| StoreError::Decode(format!("negative {field}: {v}")))
        };
        Ok(Job {
            id: JobId::from_uuid(row.id),
            tenant_id: row.tenant_id.map(TenantId::from_uuid),
            job_type: JobType::from_str(&row.job_type)
                .map_err(|e| StoreError::Decode(e.to_string()))?,
            status: parse_status(&row.status)?,
            payload: row.payload,
            result: row.result,
            attempts: counter("attempts", row.attempts)?,
            max_attempts: counter("max_attempts", row.max_attempts)?,
            priority: row.priority,
            scheduled_for: row.scheduled_for,
            started_at: row.started_at,
            completed_at: row.completed_at,
            error_message: row.error_message,
            deduplication_key: row.deduplication_key,
            worker_id: row.worker_id,
            claim_token: row.claim_token.map(ClaimToken::from_uuid),
            lease_expires_at: row.lease_expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            is_deleted: row.is_deleted,
        })
    }
}

fn decode_job(row: &PgRow) -> Result<Job, StoreError> {
    let row = JobRow::from_row(row)
        .map_err(|e| StoreError::Decode(format!("failed to deserialize job row: {e}")))?;
    Job::try_from(row)
}
