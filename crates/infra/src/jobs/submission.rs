//! Job submission, query and cancel.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use bulkjobs_core::{ItemOutcome, Job, JobId, JobPayload, JobStatus, TicketId, UserId};
use bulkjobs_events::{EventSink, JobEvent};

use super::idempotency::IdempotencyResolver;
use super::outcomes::OutcomeLog;
use super::queue::JobQueue;
use super::store::{JobFilter, JobPage, JobStore, JobStoreError};
use super::types::WorkUnit;
use crate::error::JobError;

/// Rejection message for cancel requests on settled jobs.
pub const CANNOT_CANCEL: &str = "Job cannot be canceled";

/// Result of a submission: the job and whether this call created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub job: Job,
    pub created: bool,
}

/// A job together with every item outcome recorded so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: Job,
    pub items: Vec<ItemOutcome>,
}

#[derive(Clone)]
pub struct SubmissionService {
    jobs: Arc<dyn JobStore>,
    outcomes: Arc<dyn OutcomeLog>,
    queue: Arc<dyn JobQueue>,
    events: Arc<dyn EventSink>,
    resolver: IdempotencyResolver,
}

impl SubmissionService {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        outcomes: Arc<dyn OutcomeLog>,
        queue: Arc<dyn JobQueue>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let resolver = IdempotencyResolver::new(jobs.clone());
        Self {
            jobs,
            outcomes,
            queue,
            events,
            resolver,
        }
    }

    /// Create (or return the existing) bulk-delete job.
    ///
    /// A new job is persisted `queued`, handed to the queue and announced
    /// with a `created` event. A repeated `(submitter, key)` returns the first
    /// job untouched.
    #[instrument(skip(self, ticket_ids), fields(submitter = %submitter, items = ticket_ids.len()))]
    pub fn submit(
        &self,
        submitter: UserId,
        ticket_ids: Vec<TicketId>,
        idempotency_key: Option<String>,
    ) -> Result<Submission, JobError> {
        let payload = JobPayload::bulk_delete(ticket_ids)?;

        if let Some(job) = self.resolver.resolve(submitter, idempotency_key.as_deref())? {
            info!(job_id = %job.id, "idempotent re-submission; returning existing job");
            return Ok(Submission { job, created: false });
        }

        let job = Job::new(submitter, payload.clone(), idempotency_key)?;
        let job = match self.jobs.insert(job) {
            Ok(job) => job,
            Err(JobStoreError::DuplicateIdempotencyKey { submitter, key }) => {
                // Lost a race against a concurrent submit with the same key.
                return match self.jobs.find_by_idempotency_key(submitter, &key)? {
                    Some(job) => Ok(Submission { job, created: false }),
                    None => Err(JobError::Conflict(format!("idempotency key in use: {key}"))),
                };
            }
            Err(err) => return Err(err.into()),
        };

        if let Err(err) = self.queue.enqueue(WorkUnit::new(job.id, payload)) {
            error!(job_id = %job.id, error = %err, "failed to enqueue job");
            // Nothing will ever process the record; drop it so the key can be reused.
            match self.jobs.discard(job.id) {
                Ok(true) => debug!(job_id = %job.id, "discarded unqueued job"),
                Ok(false) => warn!(job_id = %job.id, "unqueued job was already gone"),
                Err(discard_err) => {
                    error!(job_id = %job.id, error = %discard_err, "failed to discard unqueued job")
                }
            }
            return Err(JobError::Storage(format!("failed to enqueue job {}: {err}", job.id)));
        }

        info!(job_id = %job.id, total_items = job.total_items, "job queued");
        self.events.emit(JobEvent::Created {
            job_id: job.id,
            job: job.summary(),
        });

        Ok(Submission { job, created: true })
    }

    pub fn job(&self, job_id: JobId) -> Result<Job, JobError> {
        self.jobs.get(job_id)?.ok_or(JobError::NotFound(job_id))
    }

    /// The job with its item outcomes, oldest first.
    pub fn get(&self, job_id: JobId) -> Result<JobDetail, JobError> {
        let job = self.job(job_id)?;
        let items = self.outcomes.list_for_job(job_id)?;
        Ok(JobDetail { job, items })
    }

    pub fn list(&self, filter: &JobFilter) -> Result<JobPage, JobError> {
        Ok(self.jobs.list(filter)?)
    }

    /// Request cooperative cancellation. Only `queued` and `running` jobs can
    /// be canceled; a running job stops at its next chunk boundary.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub fn cancel(&self, job_id: JobId) -> Result<Job, JobError> {
        match self.jobs.transition(job_id, JobStatus::Canceled, None) {
            Ok(job) => {
                info!("job canceled");
                Ok(job)
            }
            Err(JobStoreError::InvalidTransition { from, .. }) => {
                warn!(status = %from, "cancel rejected");
                Err(JobError::Conflict(CANNOT_CANCEL.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}
