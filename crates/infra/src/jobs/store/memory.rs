//! In-memory job store (for testing and single-process development).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use costwise_core::TenantId;

use super::{
    ClaimFilter, ClaimStamp, JobListQuery, JobSession, JobSort, JobStore, ReapedLeases,
    SNAPSHOT_LIMIT, lease_expired_message,
};
use crate::jobs::error::StoreError;
use crate::jobs::outcome::Transition;
use crate::jobs::types::{ClaimToken, Job, JobId, JobStats, JobStatus, NewJob};

/// In-memory job store.
///
/// A single lock serializes claims, so concurrent claimers never see the same
/// job. Sessions are not transactional; writes made through them apply
/// immediately.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    bound_sessions: Arc<AtomicUsize>,
    unavailable: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of sessions currently holding a tenant binding.
    pub fn bound_tenant_sessions(&self) -> usize {
        self.bound_sessions.load(Ordering::SeqCst)
    }

    /// Make every operation fail with `Unavailable` (outage simulation).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Overwrite a stored row. Test fixture for crafting states such as
    /// expired leases.
    pub fn put(&self, job: Job) -> Result<(), StoreError> {
        self.write()?.insert(job.id, job);
        Ok(())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".into()));
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, StoreError> {
        self.check_available()?;
        self.jobs
            .read()
            .map_err(|_| StoreError::Unavailable("job map lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, StoreError> {
        self.check_available()?;
        self.jobs
            .write()
            .map_err(|_| StoreError::Unavailable("job map lock poisoned".into()))
    }

    fn apply(
        &self,
        job_id: JobId,
        token: ClaimToken,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.write()?;
        let job = jobs
            .get_mut(&job_id)
            .filter(|j| !j.is_deleted)
            .ok_or(StoreError::NotFound(job_id))?;
        if job.status != JobStatus::Running {
            return Err(StoreError::InvalidState(format!(
                "job {job_id} is {}, not running",
                job.status
            )));
        }
        if job.claim_token != Some(token) {
            return Err(StoreError::InvalidState(format!(
                "job {job_id} was re-claimed by another worker"
            )));
        }

        match transition {
            Transition::Complete {
                result,
                completed_at,
            } => {
                job.result = Some(result.clone());
                job.error_message = None;
                job.completed_at = Some(*completed_at);
            }
            Transition::Retry {
                scheduled_for,
                error,
                refund_attempt,
            } => {
                job.scheduled_for = *scheduled_for;
                job.error_message = Some(error.clone());
                if *refund_attempt {
                    job.attempts = job.attempts.saturating_sub(1);
                }
            }
            Transition::DeadLetter {
                error,
                completed_at,
            } => {
                job.error_message = Some(error.clone());
                job.completed_at = Some(*completed_at);
            }
        }
        job.status = transition.status();
        job.worker_id = None;
        job.claim_token = None;
        job.lease_expires_at = None;
        job.updated_at = now;
        Ok(())
    }
}

fn sort_jobs(jobs: &mut [Job], sort: JobSort) {
    match sort {
        JobSort::CreatedDesc => jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
        JobSort::CreatedAsc => jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
        JobSort::Priority => jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.scheduled_for.cmp(&b.scheduled_for))
                .then(a.created_at.cmp(&b.created_at))
        }),
    }
}

fn tenant_matches(job: &Job, tenant_id: Option<TenantId>) -> bool {
    tenant_id.is_none_or(|t| job.tenant_id == Some(t))
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    type Session = InMemorySession;

    async fn insert(&self, new_job: NewJob) -> Result<Job, StoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&new_job.id) {
            return Err(StoreError::UniqueViolation(format!("job id {}", new_job.id)));
        }
        if let Some(key) = &new_job.deduplication_key {
            let taken = jobs
                .values()
                .any(|j| !j.is_deleted && j.deduplication_key.as_ref() == Some(key));
            if taken {
                return Err(StoreError::UniqueViolation(format!("deduplication key '{key}'")));
            }
        }

        let job = new_job.into_job();
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn find_by_deduplication_key(&self, key: &str) -> Result<Option<Job>, StoreError> {
        let jobs = self.read()?;
        Ok(jobs
            .values()
            .find(|j| !j.is_deleted && j.deduplication_key.as_deref() == Some(key))
            .cloned())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let jobs = self.read()?;
        Ok(jobs.get(&job_id).filter(|j| !j.is_deleted).cloned())
    }

    async fn claim(
        &self,
        filter: &ClaimFilter,
        stamp: &ClaimStamp,
    ) -> Result<Vec<Job>, StoreError> {
        if filter.limit == 0 {
            return Ok(Vec::new());
        }

        let mut jobs = self.write()?;
        let mut eligible: Vec<Job> = jobs
            .values()
            .filter(|j| j.is_claimable(stamp.now))
            .filter(|j| tenant_matches(j, filter.tenant_id))
            .filter(|j| filter.admits(j.job_type))
            .cloned()
            .collect();
        sort_jobs(&mut eligible, JobSort::Priority);
        eligible.truncate(filter.limit);

        let mut claimed = Vec::with_capacity(eligible.len());
        for candidate in eligible {
            if let Some(job) = jobs.get_mut(&candidate.id) {
                job.status = JobStatus::Running;
                job.started_at = Some(stamp.now);
                job.worker_id = Some(stamp.worker_id.clone());
                job.claim_token = Some(ClaimToken::new());
                job.lease_expires_at = Some(stamp.lease_expires_at);
                job.updated_at = stamp.now;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn begin_attempt(
        &self,
        job_id: JobId,
        token: ClaimToken,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.write()?;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        let owned = job.status == JobStatus::Running && job.claim_token == Some(token);
        if job.is_deleted || !owned || job.attempts >= job.max_attempts {
            return Ok(None);
        }
        job.attempts += 1;
        job.started_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn extend_lease(
        &self,
        job_id: JobId,
        token: ClaimToken,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.write()?;
        match jobs
            .get_mut(&job_id)
            .filter(|j| j.status == JobStatus::Running && j.claim_token == Some(token))
        {
            Some(job) => {
                job.lease_expires_at = Some(lease_expires_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn open_session(&self) -> Result<Self::Session, StoreError> {
        self.check_available()?;
        Ok(InMemorySession {
            tenant: None,
            depth: 0,
            bound_sessions: Arc::clone(&self.bound_sessions),
        })
    }

    async fn finish_in(
        &self,
        _session: &mut Self::Session,
        job_id: JobId,
        token: ClaimToken,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.apply(job_id, token, transition, now)
    }

    async fn finish(
        &self,
        job_id: JobId,
        token: ClaimToken,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.apply(job_id, token, transition, now)
    }

    async fn reap_expired(
        &self,
        now: DateTime<Utc>,
        retry_at: DateTime<Utc>,
    ) -> Result<ReapedLeases, StoreError> {
        let mut jobs = self.write()?;
        let mut reaped = ReapedLeases::default();
        for job in jobs.values_mut() {
            let expired = !job.is_deleted
                && job.status == JobStatus::Running
                && job.lease_expires_at.is_some_and(|lease| lease < now);
            if !expired {
                continue;
            }

            job.error_message = Some(lease_expired_message(job.worker_id.as_deref()));
            if job.attempts < job.max_attempts {
                job.status = JobStatus::Pending;
                job.scheduled_for = retry_at;
                reaped.requeued.push(job.id);
            } else {
                job.status = JobStatus::DeadLetter;
                job.completed_at = Some(now);
                reaped.dead_lettered.push(job.id);
            }
            job.worker_id = None;
            job.claim_token = None;
            job.lease_expires_at = None;
            job.updated_at = now;
        }
        Ok(reaped)
    }

    async fn stats(&self, tenant_id: Option<TenantId>) -> Result<JobStats, StoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        for job in jobs
            .values()
            .filter(|j| !j.is_deleted && tenant_matches(j, tenant_id))
        {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }

    async fn list(&self, query: &JobListQuery) -> Result<Vec<Job>, StoreError> {
        let jobs = self.read()?;
        let mut out: Vec<Job> = jobs
            .values()
            .filter(|j| !j.is_deleted && tenant_matches(j, query.tenant_id))
            .filter(|j| query.status.is_none_or(|s| j.status == s))
            .filter(|j| query.job_type.is_none_or(|t| j.job_type == t))
            .cloned()
            .collect();
        sort_jobs(&mut out, query.sort);
        out.truncate(query.limit);
        Ok(out)
    }

    async fn status_snapshot(
        &self,
        tenant_id: TenantId,
        finished_since: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self.read()?;
        let mut out: Vec<Job> = jobs
            .values()
            .filter(|j| !j.is_deleted && j.tenant_id == Some(tenant_id))
            .filter(|j| {
                j.status.is_active()
                    || (matches!(j.status, JobStatus::Completed | JobStatus::Failed)
                        && j.updated_at >= finished_since)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out.truncate(SNAPSHOT_LIMIT);
        Ok(out)
    }

    async fn requeue_dead_letter(
        &self,
        job_id: JobId,
        tenant_id: Option<TenantId>,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut jobs = self.write()?;
        let job = jobs
            .get_mut(&job_id)
            .filter(|j| !j.is_deleted && tenant_matches(j, tenant_id))
            .ok_or(StoreError::NotFound(job_id))?;
        if job.status != JobStatus::DeadLetter {
            return Err(StoreError::InvalidState(format!(
                "job {job_id} is {}, only dead-lettered jobs can be retried",
                job.status
            )));
        }

        job.status = JobStatus::Pending;
        job.attempts = 0;
        job.scheduled_for = now;
        job.started_at = None;
        job.completed_at = None;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn soft_delete(
        &self,
        job_id: JobId,
        tenant_id: Option<TenantId>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.write()?;
        let job = jobs
            .get_mut(&job_id)
            .filter(|j| !j.is_deleted && tenant_matches(j, tenant_id))
            .ok_or(StoreError::NotFound(job_id))?;
        if job.status == JobStatus::Running {
            return Err(StoreError::InvalidState(format!(
                "job {job_id} is running and cannot be deleted"
            )));
        }
        job.is_deleted = true;
        job.updated_at = now;
        Ok(())
    }
}

/// Session handed to handlers running against [`InMemoryJobStore`].
///
/// Dropping a session that still holds a tenant binding releases it.
#[derive(Debug)]
pub struct InMemorySession {
    tenant: Option<TenantId>,
    depth: usize,
    bound_sessions: Arc<AtomicUsize>,
}

impl InMemorySession {
    /// Open nested scopes.
    pub fn scope_depth(&self) -> usize {
        self.depth
    }

    fn unbind(&mut self) {
        if self.tenant.take().is_some() {
            self.bound_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl JobSession for InMemorySession {
    async fn bind_tenant(&mut self, tenant_id: TenantId) -> Result<(), StoreError> {
        if self.tenant.replace(tenant_id).is_none() {
            self.bound_sessions.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn clear_tenant(&mut self) -> Result<(), StoreError> {
        self.unbind();
        Ok(())
    }

    fn current_tenant(&self) -> Option<TenantId> {
        self.tenant
    }

    async fn begin_scope(&mut self) -> Result<(), StoreError> {
        self.depth += 1;
        Ok(())
    }

    async fn release_scope(&mut self) -> Result<(), StoreError> {
        self.close_scope()
    }

    async fn rollback_scope(&mut self) -> Result<(), StoreError> {
        self.close_scope()
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        self.unbind();
        Ok(())
    }
}

impl InMemorySession {
    fn close_scope(&mut self) -> Result<(), StoreError> {
        self.depth = self
            .depth
            .checked_sub(1)
            .ok_or_else(|| StoreError::InvalidState("no open scope".into()))?;
        Ok(())
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        self.unbind();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobType;
    use serde_json::json;

    fn new_job(tenant: TenantId, priority: i32, scheduled_for: DateTime<Utc>) -> NewJob {
        NewJob {
            id: JobId::new(),
            tenant_id: Some(tenant),
            job_type: JobType::ResourceScan,
            payload: json!({}),
            priority,
            scheduled_for,
            max_attempts: 3,
            deduplication_key: None,
            created_at: Utc::now(),
        }
    }

    fn stamp(now: DateTime<Utc>) -> ClaimStamp {
        ClaimStamp {
            worker_id: "worker-a".into(),
            now,
            lease_expires_at: now + chrono::Duration::minutes(10),
        }
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_schedule() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let now = Utc::now();
        let early = now - chrono::Duration::minutes(5);

        let low = store.insert(new_job(tenant, 0, early)).await.unwrap();
        let high_late = store.insert(new_job(tenant, 5, now)).await.unwrap();
        let high_early = store.insert(new_job(tenant, 5, early)).await.unwrap();

        let claimed = store.claim(&ClaimFilter::new(10), &stamp(now)).await.unwrap();
        let ids: Vec<_> = claimed.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![high_early.id, high_late.id, low.id]);
        assert!(claimed.iter().all(|j| j.status == JobStatus::Running));
        assert!(claimed.iter().all(|j| j.worker_id.as_deref() == Some("worker-a")));
    }

    #[tokio::test]
    async fn claim_skips_future_and_respects_limit_and_filters() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let other = TenantId::new();
        let now = Utc::now();

        store
            .insert(new_job(tenant, 0, now + chrono::Duration::hours(1)))
            .await
            .unwrap();
        store.insert(new_job(tenant, 0, now)).await.unwrap();
        store.insert(new_job(tenant, 0, now)).await.unwrap();
        store.insert(new_job(other, 0, now)).await.unwrap();

        let none = store.claim(&ClaimFilter::new(0), &stamp(now)).await.unwrap();
        assert!(none.is_empty());

        let one = store
            .claim(&ClaimFilter::new(1).with_tenant(tenant), &stamp(now))
            .await
            .unwrap();
        assert_eq!(one.len(), 1);

        let rest = store
            .claim(&ClaimFilter::new(10).with_tenant(tenant), &stamp(now))
            .await
            .unwrap();
        assert_eq!(rest.len(), 1, "future job must not be claimed");

        let other_type = store
            .claim(
                &ClaimFilter::new(10).with_job_type(JobType::Maintenance),
                &stamp(now),
            )
            .await
            .unwrap();
        assert!(other_type.is_empty());
    }

    #[tokio::test]
    async fn concurrent_claims_never_overlap() {
        let store = InMemoryJobStore::arc();
        let tenant = TenantId::new();
        let now = Utc::now();
        for _ in 0..40 {
            store.insert(new_job(tenant, 0, now)).await.unwrap();
        }

        let mut tasks = Vec::new();
        for i in 0..4 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                let stamp = ClaimStamp {
                    worker_id: format!("worker-{i}"),
                    ..stamp(now)
                };
                store.claim(&ClaimFilter::new(15), &stamp).await.unwrap()
            }));
        }

        let mut seen = std::collections::HashSet::new();
        for task in tasks {
            for job in task.await.unwrap() {
                assert!(seen.insert(job.id), "job {} claimed twice", job.id);
            }
        }
        assert_eq!(seen.len(), 40);
    }

    #[tokio::test]
    async fn deduplication_key_is_unique_among_live_rows() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let mut first = new_job(tenant, 0, Utc::now());
        first.deduplication_key = Some("daily-scan".into());
        let first = store.insert(first).await.unwrap();

        let mut dup = new_job(tenant, 0, Utc::now());
        dup.deduplication_key = Some("daily-scan".into());
        let err = store.insert(dup.clone()).await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));

        store.soft_delete(first.id, None, Utc::now()).await.unwrap();
        store.insert(dup).await.unwrap();
    }

    #[tokio::test]
    async fn begin_attempt_requires_running_with_budget() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = store.insert(new_job(TenantId::new(), 0, now)).await.unwrap();

        assert!(store.begin_attempt(job.id, ClaimToken::new(), now).await.unwrap().is_none());

        let claimed = store.claim(&ClaimFilter::new(1), &stamp(now)).await.unwrap().remove(0);
        let token = claimed.claim_token.unwrap();
        assert!(store.begin_attempt(job.id, ClaimToken::new(), now).await.unwrap().is_none());
        let started = store.begin_attempt(job.id, token, now).await.unwrap().unwrap();
        assert_eq!(started.attempts, 1);
    }

    #[tokio::test]
    async fn reaped_claim_cannot_write_over_the_next_claim() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = store.insert(new_job(TenantId::new(), 0, now)).await.unwrap();

        let first = store.claim(&ClaimFilter::new(1), &stamp(now)).await.unwrap().remove(0);
        let stale = first.claim_token.unwrap();
        store.begin_attempt(job.id, stale, now).await.unwrap().unwrap();

        let mut expired = store.get(job.id).await.unwrap().unwrap();
        expired.lease_expires_at = Some(now - chrono::Duration::seconds(1));
        store.put(expired).unwrap();
        store.reap_expired(now, now).await.unwrap();

        let second_stamp = ClaimStamp {
            worker_id: "worker-b".into(),
            ..stamp(now)
        };
        let second = store.claim(&ClaimFilter::new(1), &second_stamp).await.unwrap().remove(0);
        let live = second.claim_token.unwrap();
        assert_ne!(live, stale);
        store.begin_attempt(job.id, live, now).await.unwrap().unwrap();

        let stale_result = Transition::Complete {
            result: json!({"by": "worker-a"}),
            completed_at: now,
        };
        let err = store.finish(job.id, stale, &stale_result, now).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidState(_)));
        assert!(!store.extend_lease(job.id, stale, now).await.unwrap());

        let row = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Running);
        assert_eq!(row.worker_id.as_deref(), Some("worker-b"));
        assert!(row.result.is_none());

        let live_result = Transition::Complete {
            result: json!({"by": "worker-b"}),
            completed_at: now,
        };
        store.finish(job.id, live, &live_result, now).await.unwrap();
        let row = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(row.result, Some(json!({"by": "worker-b"})));
        assert!(row.claim_token.is_none());
    }

    #[tokio::test]
    async fn claim_is_limited_to_the_admitted_types() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let scan = store.insert(new_job(TenantId::new(), 0, now)).await.unwrap();
        let mut report = new_job(TenantId::new(), 9, now);
        report.job_type = JobType::ReportGeneration;
        store.insert(report).await.unwrap();

        let filter = ClaimFilter::new(10).with_job_types(vec![JobType::ResourceScan]);
        let claimed = store.claim(&filter, &stamp(now)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, scan.id);

        let nothing = ClaimFilter::new(10).with_job_types(Vec::new());
        assert!(store.claim(&nothing, &stamp(now)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finish_only_applies_to_running_jobs() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = store.insert(new_job(TenantId::new(), 0, now)).await.unwrap();
        let done = Transition::Complete {
            result: json!({}),
            completed_at: now,
        };

        let err = store.finish(job.id, ClaimToken::new(), &done, now).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidState(_)));
    }

    #[tokio::test]
    async fn reaper_requeues_or_dead_letters_expired_leases() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let now = Utc::now();
        let a = store.insert(new_job(tenant, 0, now)).await.unwrap();
        let b = store.insert(new_job(tenant, 0, now)).await.unwrap();
        let fresh = store.insert(new_job(tenant, 0, now)).await.unwrap();
        store.claim(&ClaimFilter::new(3), &stamp(now)).await.unwrap();

        let mut expired = store.get(a.id).await.unwrap().unwrap();
        expired.lease_expires_at = Some(now - chrono::Duration::seconds(1));
        expired.attempts = 1;
        store.put(expired).unwrap();

        let mut exhausted = store.get(b.id).await.unwrap().unwrap();
        exhausted.lease_expires_at = Some(now - chrono::Duration::seconds(1));
        exhausted.attempts = 3;
        store.put(exhausted).unwrap();

        let retry_at = now + chrono::Duration::seconds(60);
        let reaped = store.reap_expired(now, retry_at).await.unwrap();
        assert_eq!(reaped.requeued, vec![a.id]);
        assert_eq!(reaped.dead_lettered, vec![b.id]);

        let a = store.get(a.id).await.unwrap().unwrap();
        assert_eq!(a.status, JobStatus::Pending);
        assert_eq!(a.scheduled_for, retry_at);
        assert!(a.error_message.unwrap().starts_with("LeaseExpired"));

        let b = store.get(b.id).await.unwrap().unwrap();
        assert_eq!(b.status, JobStatus::DeadLetter);

        let fresh = store.get(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn requeue_and_delete_respect_state_and_tenant() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let now = Utc::now();
        let job = store.insert(new_job(tenant, 0, now)).await.unwrap();

        let err = store.requeue_dead_letter(job.id, Some(tenant), now).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidState(_)));

        let mut dead = store.get(job.id).await.unwrap().unwrap();
        dead.status = JobStatus::DeadLetter;
        dead.attempts = 3;
        store.put(dead).unwrap();

        let err = store
            .requeue_dead_letter(job.id, Some(TenantId::new()), now)
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound(job.id));

        let requeued = store.requeue_dead_letter(job.id, Some(tenant), now).await.unwrap();
        assert_eq!(requeued.status, JobStatus::Pending);
        assert_eq!(requeued.attempts, 0);

        store.claim(&ClaimFilter::new(1), &stamp(now)).await.unwrap();
        let err = store.soft_delete(job.id, Some(tenant), now).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidState(_)));
    }

    #[tokio::test]
    async fn stats_and_snapshot_are_tenant_scoped() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let now = Utc::now();
        store.insert(new_job(tenant, 0, now)).await.unwrap();
        store.insert(new_job(TenantId::new(), 0, now)).await.unwrap();

        let stats = store.stats(Some(tenant)).await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.total, 1);
        assert_eq!(store.stats(None).await.unwrap().total, 2);

        let snapshot = store
            .status_snapshot(tenant, now - chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test]
    async fn dropping_a_bound_session_releases_the_binding() {
        let store = InMemoryJobStore::new();
        let mut session = store.open_session().await.unwrap();
        session.bind_tenant(TenantId::new()).await.unwrap();
        assert_eq!(store.bound_tenant_sessions(), 1);
        drop(session);
        assert_eq!(store.bound_tenant_sessions(), 0);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_operation() {
        let store = InMemoryJobStore::new();
        store.set_unavailable(true);
        let err = store.stats(None).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(store.open_session().await.is_err());
    }
}
