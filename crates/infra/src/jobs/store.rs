//! Job record storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use bulkjobs_core::{DomainError, Job, JobId, JobStatus, JobSummary, JobType, UserId};

/// Default page size for listings.
pub const DEFAULT_PAGE_LIMIT: u32 = 10;

/// Hard cap on the page size for listings.
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Job record store abstraction.
///
/// Status and progress writes are conditional: the store re-checks the
/// current row before applying them, so concurrent writers (a worker and a
/// cancel request) cannot move a job backwards.
pub trait JobStore: Send + Sync {
    /// Persist a new job. Fails with `DuplicateIdempotencyKey` when the
    /// submitter already owns a job under the same key.
    fn insert(&self, job: Job) -> Result<Job, JobStoreError>;

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    fn find_by_idempotency_key(&self, submitter: UserId, key: &str) -> Result<Option<Job>, JobStoreError>;

    /// Newest first.
    fn list(&self, filter: &JobFilter) -> Result<JobPage, JobStoreError>;

    /// Move the job to `to` if its current status allows it.
    ///
    /// `error` is stored only for `failed`.
    fn transition(&self, job_id: JobId, to: JobStatus, error: Option<String>) -> Result<Job, JobStoreError>;

    /// Raise `processed_items` (and the derived percentage) to `processed`.
    ///
    /// A value below the stored count leaves the record unchanged; a value
    /// above `total_items` is rejected.
    fn update_progress(&self, job_id: JobId, processed: u32) -> Result<Job, JobStoreError>;

    /// Delete a job that never left `queued`, releasing its idempotency key.
    ///
    /// Returns `false` when the job is gone or has moved on.
    fn discard(&self, job_id: JobId) -> Result<bool, JobStoreError>;
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
        (**self).insert(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn find_by_idempotency_key(&self, submitter: UserId, key: &str) -> Result<Option<Job>, JobStoreError> {
        (**self).find_by_idempotency_key(submitter, key)
    }

    fn list(&self, filter: &JobFilter) -> Result<JobPage, JobStoreError> {
        (**self).list(filter)
    }

    fn transition(&self, job_id: JobId, to: JobStatus, error: Option<String>) -> Result<Job, JobStoreError> {
        (**self).transition(job_id, to, error)
    }

    fn update_progress(&self, job_id: JobId, processed: u32) -> Result<Job, JobStoreError> {
        (**self).update_progress(job_id, processed)
    }

    fn discard(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        (**self).discard(job_id)
    }
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("idempotency key already used by submitter {submitter}: {key}")]
    DuplicateIdempotencyKey { submitter: UserId, key: String },
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("invalid progress update: {0}")]
    InvalidProgress(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for JobStoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidTransition { from, to } => JobStoreError::InvalidTransition { from, to },
            DomainError::InvariantViolation(msg) => JobStoreError::InvalidProgress(msg),
            other => JobStoreError::Storage(other.to_string()),
        }
    }
}

/// Listing criteria.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub job_type: Option<JobType>,
    pub status: Option<JobStatus>,
    /// Restrict to one submitter's jobs.
    pub submitter: Option<UserId>,
    /// 1-based; 0 is treated as 1.
    pub page: u32,
    /// 0 means the default; values above the cap are clamped.
    pub limit: u32,
}

impl JobFilter {
    pub fn page(&self) -> u32 {
        self.page.max(1)
    }

    pub fn limit(&self) -> u32 {
        match self.limit {
            0 => DEFAULT_PAGE_LIMIT,
            n => n.min(MAX_PAGE_LIMIT),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page() - 1) * u64::from(self.limit())
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.job_type.is_none_or(|t| t == job.job_type)
            && self.status.is_none_or(|s| s == job.status)
            && self.submitter.is_none_or(|u| u == job.submitter)
    }
}

/// One page of job summaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPage {
    pub jobs: Vec<JobSummary>,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u64,
}

impl JobPage {
    pub fn new(jobs: Vec<JobSummary>, filter: &JobFilter, total: u64) -> Self {
        let limit = filter.limit();
        Self {
            jobs,
            page: filter.page(),
            limit,
            total,
            total_pages: total.div_ceil(u64::from(limit)),
        }
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    idempotency: RwLock<HashMap<(UserId, String), JobId>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn poisoned() -> JobStoreError {
        JobStoreError::Storage("job store lock poisoned".to_string())
    }

    fn modify<F>(&self, job_id: JobId, f: F) -> Result<Job, JobStoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), JobStoreError>,
    {
        let mut jobs = self.jobs.write().map_err(|_| Self::poisoned())?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        // Work on a copy so a rejected update leaves the stored row untouched.
        let mut updated = job.clone();
        f(&mut updated)?;
        *job = updated.clone();
        Ok(updated)
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| Self::poisoned())?;
        let mut keys = self.idempotency.write().map_err(|_| Self::poisoned())?;

        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        if let Some(key) = &job.idempotency_key {
            let index = (job.submitter, key.clone());
            if keys.contains_key(&index) {
                return Err(JobStoreError::DuplicateIdempotencyKey {
                    submitter: job.submitter,
                    key: key.clone(),
                });
            }
            keys.insert(index, job.id);
        }

        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| Self::poisoned())?;
        Ok(jobs.get(&job_id).cloned())
    }

    fn find_by_idempotency_key(&self, submitter: UserId, key: &str) -> Result<Option<Job>, JobStoreError> {
        let id = {
            let keys = self.idempotency.read().map_err(|_| Self::poisoned())?;
            keys.get(&(submitter, key.to_string())).copied()
        };
        match id {
            Some(id) => self.get(id),
            None => Ok(None),
        }
    }

    fn list(&self, filter: &JobFilter) -> Result<JobPage, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| Self::poisoned())?;

        let mut matching: Vec<&Job> = jobs.values().filter(|j| filter.matches(j)).collect();
        // v7 ids order by creation time, which breaks ties within one millisecond.
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .skip(filter.offset() as usize)
            .take(filter.limit() as usize)
            .map(Job::summary)
            .collect();

        Ok(JobPage::new(page, filter, total))
    }

    fn transition(&self, job_id: JobId, to: JobStatus, error: Option<String>) -> Result<Job, JobStoreError> {
        self.modify(job_id, |job| {
            let now = Utc::now();
            match to {
                JobStatus::Failed => job.mark_failed(error.unwrap_or_default(), now)?,
                other => job.transition_to(other, now)?,
            }
            Ok(())
        })
    }

    fn update_progress(&self, job_id: JobId, processed: u32) -> Result<Job, JobStoreError> {
        self.modify(job_id, |job| {
            if processed <= job.processed_items {
                return Ok(());
            }
            job.record_progress(processed, Utc::now())?;
            Ok(())
        })
    }

    fn discard(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| Self::poisoned())?;
        let mut keys = self.idempotency.write().map_err(|_| Self::poisoned())?;

        if !matches!(jobs.get(&job_id), Some(job) if job.status == JobStatus::Queued) {
            return Ok(false);
        }
        if let Some(job) = jobs.remove(&job_id) {
            if let Some(key) = job.idempotency_key {
                keys.remove(&(job.submitter, key));
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulkjobs_core::{JobPayload, TicketId};

    fn job(submitter: UserId, ids: &[i64], key: Option<&str>) -> Job {
        let payload = JobPayload::bulk_delete(ids.iter().copied().map(TicketId::new).collect()).unwrap();
        Job::new(submitter, payload, key.map(str::to_string)).unwrap()
    }

    #[test]
    fn idempotency_key_is_unique_per_submitter() {
        let store = InMemoryJobStore::new();
        let alice = UserId::new();
        let bob = UserId::new();

        let first = store.insert(job(alice, &[1], Some("k"))).unwrap();
        let dup = store.insert(job(alice, &[2], Some("k")));
        assert!(matches!(dup, Err(JobStoreError::DuplicateIdempotencyKey { .. })));

        store.insert(job(bob, &[3], Some("k"))).unwrap();

        let found = store.find_by_idempotency_key(alice, "k").unwrap().unwrap();
        assert_eq!(found.id, first.id);
        assert!(store.find_by_idempotency_key(alice, "other").unwrap().is_none());
    }

    #[test]
    fn jobs_without_key_never_collide() {
        let store = InMemoryJobStore::new();
        let alice = UserId::new();
        store.insert(job(alice, &[1], None)).unwrap();
        store.insert(job(alice, &[1], None)).unwrap();
        assert_eq!(store.list(&JobFilter::default()).unwrap().total, 2);
    }

    #[test]
    fn transition_is_conditional_on_current_status() {
        let store = InMemoryJobStore::new();
        let created = store.insert(job(UserId::new(), &[1, 2], None)).unwrap();

        let canceled = store.transition(created.id, JobStatus::Canceled, None).unwrap();
        assert_eq!(canceled.status, JobStatus::Canceled);
        assert!(canceled.completed_at.is_some());

        let err = store.transition(created.id, JobStatus::Running, None).unwrap_err();
        assert_eq!(
            err,
            JobStoreError::InvalidTransition {
                from: JobStatus::Canceled,
                to: JobStatus::Running
            }
        );
        assert_eq!(store.get(created.id).unwrap().unwrap().status, JobStatus::Canceled);
    }

    #[test]
    fn failed_transition_stores_error() {
        let store = InMemoryJobStore::new();
        let created = store.insert(job(UserId::new(), &[1], None)).unwrap();
        store.transition(created.id, JobStatus::Running, None).unwrap();

        let failed = store
            .transition(created.id, JobStatus::Failed, Some("db down".into()))
            .unwrap();
        assert_eq!(failed.error.as_deref(), Some("db down"));
    }

    #[test]
    fn progress_never_moves_backwards_or_past_total() {
        let store = InMemoryJobStore::new();
        let created = store.insert(job(UserId::new(), &[1, 2, 3], None)).unwrap();
        store.transition(created.id, JobStatus::Running, None).unwrap();

        let updated = store.update_progress(created.id, 2).unwrap();
        assert_eq!((updated.processed_items, updated.progress), (2, 67));

        let unchanged = store.update_progress(created.id, 1).unwrap();
        assert_eq!(unchanged.processed_items, 2);

        let err = store.update_progress(created.id, 4).unwrap_err();
        assert!(matches!(err, JobStoreError::InvalidProgress(_)));
    }

    #[test]
    fn unknown_job_is_not_found() {
        let store = InMemoryJobStore::new();
        let id = JobId::new();
        assert_eq!(
            store.transition(id, JobStatus::Canceled, None).unwrap_err(),
            JobStoreError::NotFound(id)
        );
        assert!(store.get(id).unwrap().is_none());
    }

    #[test]
    fn discard_removes_only_queued_jobs_and_frees_the_key() {
        let store = InMemoryJobStore::new();
        let submitter = UserId::new();
        let queued = store.insert(job(submitter, &[1], Some("k"))).unwrap();
        let running = store.insert(job(submitter, &[2], Some("other"))).unwrap();
        store.transition(running.id, JobStatus::Running, None).unwrap();

        assert!(store.discard(queued.id).unwrap());
        assert!(store.get(queued.id).unwrap().is_none());
        assert!(store.find_by_idempotency_key(submitter, "k").unwrap().is_none());
        store.insert(job(submitter, &[1], Some("k"))).unwrap();

        assert!(!store.discard(running.id).unwrap());
        assert!(!store.discard(JobId::new()).unwrap());
        assert_eq!(store.get(running.id).unwrap().unwrap().status, JobStatus::Running);
    }

    #[test]
    fn list_filters_sorts_and_paginates() {
        let store = InMemoryJobStore::new();
        let alice = UserId::new();
        let bob = UserId::new();

        let mut alice_ids = Vec::new();
        for n in 0..12 {
            alice_ids.push(store.insert(job(alice, &[n + 1], None)).unwrap().id);
        }
        store.insert(job(bob, &[99], None)).unwrap();

        let filter = JobFilter {
            submitter: Some(alice),
            page: 2,
            limit: 5,
            ..Default::default()
        };
        let page = store.list(&filter).unwrap();

        assert_eq!(page.total, 12);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.page, 2);
        assert_eq!(page.jobs.len(), 5);
        // Newest first: the second page starts at the 6th newest.
        alice_ids.reverse();
        let listed: Vec<JobId> = page.jobs.iter().map(|j| j.id).collect();
        assert_eq!(listed, alice_ids[5..10].to_vec());
    }

    #[test]
    fn list_defaults_and_caps_limit() {
        let filter = JobFilter::default();
        assert_eq!((filter.page(), filter.limit(), filter.offset()), (1, 10, 0));

        let capped = JobFilter {
            limit: 1_000,
            ..Default::default()
        };
        assert_eq!(capped.limit(), MAX_PAGE_LIMIT);
    }

    #[test]
    fn list_filters_by_status() {
        let store = InMemoryJobStore::new();
        let a = store.insert(job(UserId::new(), &[1], None)).unwrap();
        store.insert(job(UserId::new(), &[2], None)).unwrap();
        store.transition(a.id, JobStatus::Canceled, None).unwrap();

        let filter = JobFilter {
            status: Some(JobStatus::Canceled),
            ..Default::default()
        };
        let page = store.list(&filter).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.jobs[0].id, a.id);
    }
}
