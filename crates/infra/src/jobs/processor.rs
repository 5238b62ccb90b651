//! Chunked execution of a bulk-delete work unit.
//!
//! Per unit:
//! - load the job; skip it if it is no longer waiting or running
//! - walk the ids in fixed-size chunks, polling for cancellation before each
//! - record one outcome per item and persist progress after each chunk
//! - finish `succeeded` even when individual items failed
//!
//! An error escaping chunk containment is handed back so the queue's retry
//! policy applies. Only the final attempt marks the job `failed`; earlier
//! attempts leave it `running` for the retry to resume.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use bulkjobs_core::{ItemOutcome, Job, JobId, JobStatus, TicketId, progress_percent};
use bulkjobs_events::{EventSink, JobEvent};

use super::outcomes::{OutcomeLog, OutcomeLogError, RecordResult};
use super::store::{JobStore, JobStoreError};
use super::types::WorkUnit;
use crate::tickets::TicketStore;

pub const DEFAULT_CHUNK_SIZE: usize = 5;

/// How a unit ended when no error escaped.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Succeeded,
    /// Stopped at a chunk boundary after observing a cancel.
    Canceled,
    /// Nothing to do: the job was already canceled or settled.
    Skipped,
    /// Stopped at a chunk boundary because another worker took over the delivery.
    Released,
}

/// What the worker knows about the delivery being processed.
pub struct Attempt<'a> {
    /// No retry follows if this attempt fails.
    pub is_final: bool,
    /// Renews the delivery lease at chunk boundaries; `false` means the
    /// delivery now belongs to another worker.
    pub keep_lease: Option<&'a dyn Fn() -> bool>,
}

impl Attempt<'_> {
    /// A standalone run: failures are final and there is no lease to renew.
    pub fn last() -> Self {
        Self {
            is_final: true,
            keep_lease: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
    #[error(transparent)]
    Outcomes(#[from] OutcomeLogError),
}

pub struct BulkProcessor {
    jobs: Arc<dyn JobStore>,
    outcomes: Arc<dyn OutcomeLog>,
    tickets: Arc<dyn TicketStore>,
    events: Arc<dyn EventSink>,
    chunk_size: usize,
}

impl BulkProcessor {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        outcomes: Arc<dyn OutcomeLog>,
        tickets: Arc<dyn TicketStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            jobs,
            outcomes,
            tickets,
            events,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Run `unit` as a final attempt.
    pub fn process(&self, unit: &WorkUnit) -> Result<ProcessOutcome, ProcessorError> {
        self.process_attempt(unit, &Attempt::last())
    }

    #[instrument(skip(self, unit, attempt), fields(job_id = %unit.job_id, attempt = unit.attempt, is_final = attempt.is_final))]
    pub fn process_attempt(&self, unit: &WorkUnit, attempt: &Attempt<'_>) -> Result<ProcessOutcome, ProcessorError> {
        match self.run(unit, attempt) {
            Ok(outcome) => Ok(outcome),
            Err(err) if attempt.is_final => {
                self.fail(unit.job_id, &err);
                Err(err)
            }
            Err(err) => {
                warn!(job_id = %unit.job_id, attempt = unit.attempt, error = %err, "attempt failed; job left for retry");
                Err(err)
            }
        }
    }

    fn run(&self, unit: &WorkUnit, attempt: &Attempt<'_>) -> Result<ProcessOutcome, ProcessorError> {
        let job_id = unit.job_id;
        let Some(job) = self.start(job_id)? else {
            return Ok(ProcessOutcome::Skipped);
        };

        let items = unit.payload.items();
        let total = job.total_items;

        // Items settled by an earlier delivery keep their outcome.
        let recorded = self.outcomes.recorded_items(job_id)?;
        let mut processed = count_u32(items.iter().filter(|id| recorded.contains(id)).count());
        if processed > job.processed_items {
            self.jobs.update_progress(job_id, processed)?;
        }
        self.emit_progress(job_id, processed, total);

        for (index, chunk) in items.chunks(self.chunk_size).enumerate() {
            let pending: Vec<TicketId> = chunk.iter().copied().filter(|id| !recorded.contains(id)).collect();
            if pending.is_empty() {
                continue;
            }

            if let Some(keep_lease) = attempt.keep_lease {
                if !keep_lease() {
                    warn!(job_id = %job_id, chunk = index, processed, "delivery lease lost; stopping");
                    return Ok(ProcessOutcome::Released);
                }
            }

            let current = self.jobs.get(job_id)?.ok_or(ProcessorError::JobNotFound(job_id))?;
            match current.status {
                JobStatus::Running => {}
                JobStatus::Canceled => {
                    info!(job_id = %job_id, chunk = index, processed, "job canceled; stopping at chunk boundary");
                    self.emit_progress(job_id, processed, total);
                    return Ok(ProcessOutcome::Canceled);
                }
                status => {
                    warn!(job_id = %job_id, %status, "job settled by another writer; stopping");
                    return Ok(ProcessOutcome::Skipped);
                }
            }

            for outcome in self.run_chunk(job_id, &pending) {
                self.record(outcome)?;
                processed += 1;
            }

            self.jobs.update_progress(job_id, processed)?;
            debug!(job_id = %job_id, chunk = index, processed, total, "chunk done");
            self.emit_progress(job_id, processed, total);
        }

        match self.jobs.transition(job_id, JobStatus::Succeeded, None) {
            Ok(job) => {
                info!(job_id = %job_id, processed, total, "job succeeded");
                self.events.emit(JobEvent::Completed {
                    job_id,
                    job: job.summary(),
                });
                Ok(ProcessOutcome::Succeeded)
            }
            Err(JobStoreError::InvalidTransition {
                from: JobStatus::Canceled,
                ..
            }) => {
                info!(job_id = %job_id, processed, "job canceled after its last chunk");
                self.emit_progress(job_id, processed, total);
                Ok(ProcessOutcome::Canceled)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Load the job and move it to `running`. `None` means there is nothing to do.
    fn start(&self, job_id: JobId) -> Result<Option<Job>, ProcessorError> {
        let job = self.jobs.get(job_id)?.ok_or(ProcessorError::JobNotFound(job_id))?;

        match job.status {
            JobStatus::Queued => match self.jobs.transition(job_id, JobStatus::Running, None) {
                Ok(job) => Ok(Some(job)),
                Err(JobStoreError::InvalidTransition { from, .. }) => {
                    info!(job_id = %job_id, status = %from, "job left the queue before pickup");
                    Ok(None)
                }
                Err(err) => Err(err.into()),
            },
            JobStatus::Running => {
                info!(job_id = %job_id, "resuming job after redelivery");
                Ok(Some(job))
            }
            status => {
                info!(job_id = %job_id, %status, "job already settled; skipping");
                Ok(None)
            }
        }
    }

    /// Soft-delete one chunk and describe what happened to each id.
    ///
    /// Succeeded ids come first, then failed ids, each in input order. A
    /// failing mutation fails the whole chunk instead of the job.
    fn run_chunk(&self, job_id: JobId, chunk: &[TicketId]) -> Vec<ItemOutcome> {
        let changed = match self.tickets.bulk_soft_delete(chunk) {
            Ok(changed) => changed.into_iter().collect::<HashSet<_>>(),
            Err(err) => {
                warn!(job_id = %job_id, error = %err, items = chunk.len(), "chunk mutation failed");
                let message = err.to_string();
                return chunk
                    .iter()
                    .map(|id| ItemOutcome::failed(job_id, *id, message.clone()))
                    .collect();
            }
        };

        let (succeeded, unchanged): (Vec<TicketId>, Vec<TicketId>) =
            chunk.iter().copied().partition(|id| changed.contains(id));

        let mut outcomes: Vec<ItemOutcome> = succeeded
            .into_iter()
            .map(|id| ItemOutcome::succeeded(job_id, id))
            .collect();

        for id in unchanged {
            let reason = match self.tickets.lookup(id) {
                Ok(state) => state.failure_reason().to_string(),
                Err(err) => err.to_string(),
            };
            outcomes.push(ItemOutcome::failed(job_id, id, reason));
        }

        outcomes
    }

    fn record(&self, outcome: ItemOutcome) -> Result<(), ProcessorError> {
        let event = JobEvent::Item {
            job_id: outcome.job_id,
            item_id: outcome.item_id,
            status: outcome.outcome,
            error: outcome.error.clone(),
        };

        match self.outcomes.record(outcome)? {
            RecordResult::Inserted => self.events.emit(event),
            RecordResult::Duplicate => {
                debug!(job_id = %event.job_id(), "item outcome already recorded by an earlier delivery");
            }
        }
        Ok(())
    }

    fn emit_progress(&self, job_id: JobId, processed: u32, total: u32) {
        self.events.emit(JobEvent::Progress {
            job_id,
            progress: progress_percent(processed, total),
            processed_items: processed,
        });
    }

    fn fail(&self, job_id: JobId, err: &ProcessorError) {
        let message = err.to_string();
        error!(job_id = %job_id, error = %message, "job processing failed");

        match self.jobs.transition(job_id, JobStatus::Failed, Some(message.clone())) {
            Ok(_) | Err(JobStoreError::NotFound(_)) => {
                self.events.emit(JobEvent::Failed { job_id, error: message });
            }
            Err(mark_err) => {
                warn!(job_id = %job_id, error = %mark_err, "could not mark job failed");
            }
        }
    }
}

fn count_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use bulkjobs_core::{ItemResult, JobPayload, UserId};
    use bulkjobs_events::RecordingSink;

    use crate::jobs::outcomes::InMemoryOutcomeLog;
    use crate::jobs::store::InMemoryJobStore;
    use crate::tickets::{InMemoryTicketStore, TicketState, TicketStoreError};

    struct Fixture {
        jobs: Arc<InMemoryJobStore>,
        outcomes: Arc<InMemoryOutcomeLog>,
        events: Arc<RecordingSink>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                jobs: Arc::new(InMemoryJobStore::new()),
                outcomes: Arc::new(InMemoryOutcomeLog::new()),
                events: Arc::new(RecordingSink::new()),
            }
        }

        fn processor(&self, tickets: Arc<dyn TicketStore>, chunk: usize) -> BulkProcessor {
            BulkProcessor::new(self.jobs.clone(), self.outcomes.clone(), tickets, self.events.clone())
                .with_chunk_size(chunk)
        }

        fn queued(&self, ids: &[i64]) -> WorkUnit {
            let payload = JobPayload::bulk_delete(ids.iter().copied().map(TicketId::new).collect()).unwrap();
            let job = self
                .jobs
                .insert(Job::new(UserId::new(), payload.clone(), None).unwrap())
                .unwrap();
            WorkUnit::new(job.id, payload)
        }

        fn job(&self, id: JobId) -> Job {
            self.jobs.get(id).unwrap().unwrap()
        }
    }

    /// Fails every mutation; lookups report nothing.
    struct BrokenTickets;

    impl TicketStore for BrokenTickets {
        fn bulk_soft_delete(&self, _ids: &[TicketId]) -> Result<Vec<TicketId>, TicketStoreError> {
            Err(TicketStoreError::Storage("connection reset".into()))
        }

        fn lookup(&self, _id: TicketId) -> Result<TicketState, TicketStoreError> {
            Ok(TicketState::Missing)
        }
    }

    /// Cancels the job right after the first chunk mutates.
    struct CancelAfterFirstChunk {
        inner: InMemoryTicketStore,
        jobs: Arc<InMemoryJobStore>,
        job_id: Mutex<Option<JobId>>,
    }

    impl TicketStore for CancelAfterFirstChunk {
        fn bulk_soft_delete(&self, ids: &[TicketId]) -> Result<Vec<TicketId>, TicketStoreError> {
            let changed = self.inner.bulk_soft_delete(ids)?;
            if let Some(id) = self.job_id.lock().unwrap().take() {
                self.jobs.transition(id, JobStatus::Canceled, None).unwrap();
            }
            Ok(changed)
        }

        fn lookup(&self, id: TicketId) -> Result<TicketState, TicketStoreError> {
            self.inner.lookup(id)
        }
    }

    #[test]
    fn mutation_error_fails_items_not_job() {
        let fx = Fixture::new();
        let unit = fx.queued(&[1, 2, 3]);

        let outcome = fx.processor(Arc::new(BrokenTickets), 2).process(&unit).unwrap();

        assert_eq!(outcome, ProcessOutcome::Succeeded);
        let job = fx.job(unit.job_id);
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.processed_items, 3);

        let rows = fx.outcomes.list_for_job(unit.job_id).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.outcome == ItemResult::Failed));
        assert!(rows[0].error.as_deref().unwrap().contains("connection reset"));
    }

    #[test]
    fn canceled_before_pickup_never_runs() {
        let fx = Fixture::new();
        let unit = fx.queued(&[1, 2]);
        fx.jobs.transition(unit.job_id, JobStatus::Canceled, None).unwrap();
        let tickets = Arc::new(InMemoryTicketStore::seeded([1, 2]));

        let outcome = fx.processor(tickets.clone(), 5).process(&unit).unwrap();

        assert_eq!(outcome, ProcessOutcome::Skipped);
        assert_eq!(fx.job(unit.job_id).status, JobStatus::Canceled);
        assert!(!tickets.is_deleted(TicketId::new(1)));
        assert!(fx.events.events().is_empty());
    }

    #[test]
    fn cancel_mid_run_stops_at_next_chunk_boundary() {
        let fx = Fixture::new();
        let unit = fx.queued(&[1, 2, 3, 4, 5]);
        let tickets = Arc::new(CancelAfterFirstChunk {
            inner: InMemoryTicketStore::seeded(1..=5),
            jobs: fx.jobs.clone(),
            job_id: Mutex::new(Some(unit.job_id)),
        });

        let outcome = fx.processor(tickets.clone(), 2).process(&unit).unwrap();

        assert_eq!(outcome, ProcessOutcome::Canceled);
        let job = fx.job(unit.job_id);
        assert_eq!(job.status, JobStatus::Canceled);
        assert_eq!(job.processed_items, 2);
        assert_eq!(job.progress, 40);
        assert!(!tickets.inner.is_deleted(TicketId::new(3)));

        let topics = fx.events.topics();
        assert_eq!(topics.last(), Some(&"jobs:progress"));
        assert!(!topics.contains(&"jobs:completed"));
    }

    #[test]
    fn redelivery_resumes_without_duplicate_outcomes() {
        let fx = Fixture::new();
        let unit = fx.queued(&[1, 2, 3, 4]);
        let tickets = Arc::new(InMemoryTicketStore::seeded(1..=4));

        // An earlier delivery got through the first chunk and then died.
        fx.jobs.transition(unit.job_id, JobStatus::Running, None).unwrap();
        tickets.bulk_soft_delete(&[TicketId::new(1), TicketId::new(2)]).unwrap();
        for id in [1, 2] {
            fx.outcomes
                .record(ItemOutcome::succeeded(unit.job_id, TicketId::new(id)))
                .unwrap();
        }

        let outcome = fx.processor(tickets, 2).process(&unit.next_attempt()).unwrap();

        assert_eq!(outcome, ProcessOutcome::Succeeded);
        let rows = fx.outcomes.list_for_job(unit.job_id).unwrap();
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.outcome == ItemResult::Succeeded));

        let job = fx.job(unit.job_id);
        assert_eq!((job.processed_items, job.progress), (4, 100));
        // Only the resumed chunk produced item events.
        let items = fx.events.topics().into_iter().filter(|t| *t == "jobs:item").count();
        assert_eq!(items, 2);
    }

    #[test]
    fn missing_job_is_a_processor_failure() {
        let fx = Fixture::new();
        let payload = JobPayload::bulk_delete(vec![TicketId::new(1)]).unwrap();
        let unit = WorkUnit::new(JobId::new(), payload);

        let err = fx
            .processor(Arc::new(InMemoryTicketStore::new()), 5)
            .process(&unit)
            .unwrap_err();

        assert_eq!(err, ProcessorError::JobNotFound(unit.job_id));
        assert_eq!(fx.events.topics(), vec!["jobs:failed"]);
    }

    #[test]
    fn settled_job_is_skipped() {
        let fx = Fixture::new();
        let unit = fx.queued(&[1]);
        let tickets = Arc::new(InMemoryTicketStore::seeded([1]));
        fx.processor(tickets.clone(), 5).process(&unit).unwrap();

        let again = fx.processor(tickets, 5).process(&unit.next_attempt()).unwrap();
        assert_eq!(again, ProcessOutcome::Skipped);
    }

    /// Outcome log whose first `recorded_items` call hits a dropped connection.
    struct FlakyOutcomes {
        inner: Arc<InMemoryOutcomeLog>,
        broken: std::sync::atomic::AtomicBool,
    }

    impl OutcomeLog for FlakyOutcomes {
        fn record(&self, outcome: ItemOutcome) -> Result<RecordResult, OutcomeLogError> {
            self.inner.record(outcome)
        }

        fn list_for_job(&self, job_id: JobId) -> Result<Vec<ItemOutcome>, OutcomeLogError> {
            self.inner.list_for_job(job_id)
        }

        fn recorded_items(&self, job_id: JobId) -> Result<HashSet<TicketId>, OutcomeLogError> {
            if self.broken.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(OutcomeLogError::Storage("connection dropped".into()));
            }
            self.inner.recorded_items(job_id)
        }
    }

    #[test]
    fn transient_error_leaves_job_running_for_the_next_attempt() {
        let fx = Fixture::new();
        let unit = fx.queued(&[1, 2, 3, 4]);
        let tickets = Arc::new(InMemoryTicketStore::seeded(1..=4));
        let processor = BulkProcessor::new(
            fx.jobs.clone(),
            Arc::new(FlakyOutcomes {
                inner: fx.outcomes.clone(),
                broken: std::sync::atomic::AtomicBool::new(true),
            }),
            tickets.clone(),
            fx.events.clone(),
        )
        .with_chunk_size(2);

        let first = Attempt {
            is_final: false,
            keep_lease: None,
        };
        assert!(processor.process_attempt(&unit, &first).is_err());
        assert_eq!(fx.job(unit.job_id).status, JobStatus::Running);
        assert!(!fx.events.topics().contains(&"jobs:failed"));

        let outcome = processor.process_attempt(&unit.next_attempt(), &Attempt::last()).unwrap();

        assert_eq!(outcome, ProcessOutcome::Succeeded);
        let job = fx.job(unit.job_id);
        assert_eq!((job.status, job.processed_items, job.progress), (JobStatus::Succeeded, 4, 100));
        let rows = fx.outcomes.list_for_job(unit.job_id).unwrap();
        assert!(rows.iter().all(|r| r.outcome == ItemResult::Succeeded));
        assert!((1..=4).all(|id| tickets.is_deleted(TicketId::new(id))));
    }

    #[test]
    fn final_attempt_failure_marks_job_failed() {
        let fx = Fixture::new();
        let unit = fx.queued(&[1]);
        let processor = BulkProcessor::new(
            fx.jobs.clone(),
            Arc::new(FlakyOutcomes {
                inner: fx.outcomes.clone(),
                broken: std::sync::atomic::AtomicBool::new(true),
            }),
            Arc::new(InMemoryTicketStore::seeded([1])),
            fx.events.clone(),
        );

        processor.process_attempt(&unit, &Attempt::last()).unwrap_err();

        let job = fx.job(unit.job_id);
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.as_deref().unwrap().contains("connection dropped"));
        assert_eq!(fx.events.topics().last(), Some(&"jobs:failed"));
    }

    #[test]
    fn lost_lease_stops_at_chunk_boundary_without_settling_the_job() {
        let fx = Fixture::new();
        let unit = fx.queued(&[1, 2, 3, 4]);
        let tickets = Arc::new(InMemoryTicketStore::seeded(1..=4));
        let renewals = std::sync::atomic::AtomicUsize::new(0);
        // The lease holds for the first chunk only.
        let keep_lease = || renewals.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0;
        let attempt = Attempt {
            is_final: true,
            keep_lease: Some(&keep_lease),
        };

        let outcome = fx.processor(tickets.clone(), 2).process_attempt(&unit, &attempt).unwrap();

        assert_eq!(outcome, ProcessOutcome::Released);
        let job = fx.job(unit.job_id);
        assert_eq!((job.status, job.processed_items), (JobStatus::Running, 2));
        assert!(!tickets.is_deleted(TicketId::new(3)));
    }

    #[test]
    fn chunk_size_is_at_least_one() {
        let fx = Fixture::new();
        let processor = fx.processor(Arc::new(InMemoryTicketStore::new()), 0);
        assert_eq!(processor.chunk_size(), 1);
    }
}
