//! Append-only per-item outcome log.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use bulkjobs_core::{ItemOutcome, JobId, TicketId};

/// Whether `record` stored a new row.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RecordResult {
    Inserted,
    /// An outcome for the same `(job_id, item_id)` already exists; nothing changed.
    Duplicate,
}

/// Durable log of item outcomes. Rows are never updated or deleted.
pub trait OutcomeLog: Send + Sync {
    /// Insert-if-absent, keyed by `(job_id, item_id)`.
    fn record(&self, outcome: ItemOutcome) -> Result<RecordResult, OutcomeLogError>;

    /// Outcomes of one job, oldest first.
    fn list_for_job(&self, job_id: JobId) -> Result<Vec<ItemOutcome>, OutcomeLogError>;

    /// Items of the job that already have an outcome.
    fn recorded_items(&self, job_id: JobId) -> Result<HashSet<TicketId>, OutcomeLogError> {
        Ok(self
            .list_for_job(job_id)?
            .into_iter()
            .map(|o| o.item_id)
            .collect())
    }
}

impl<L> OutcomeLog for Arc<L>
where
    L: OutcomeLog + ?Sized,
{
    fn record(&self, outcome: ItemOutcome) -> Result<RecordResult, OutcomeLogError> {
        (**self).record(outcome)
    }

    fn list_for_job(&self, job_id: JobId) -> Result<Vec<ItemOutcome>, OutcomeLogError> {
        (**self).list_for_job(job_id)
    }

    fn recorded_items(&self, job_id: JobId) -> Result<HashSet<TicketId>, OutcomeLogError> {
        (**self).recorded_items(job_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutcomeLogError {
    #[error("outcome log storage error: {0}")]
    Storage(String),
}

/// In-memory outcome log for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryOutcomeLog {
    by_job: RwLock<HashMap<JobId, Vec<ItemOutcome>>>,
}

impl InMemoryOutcomeLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> OutcomeLogError {
        OutcomeLogError::Storage("outcome log lock poisoned".to_string())
    }
}

impl OutcomeLog for InMemoryOutcomeLog {
    fn record(&self, outcome: ItemOutcome) -> Result<RecordResult, OutcomeLogError> {
        let mut by_job = self.by_job.write().map_err(|_| Self::poisoned())?;
        let rows = by_job.entry(outcome.job_id).or_default();
        if rows.iter().any(|o| o.item_id == outcome.item_id) {
            return Ok(RecordResult::Duplicate);
        }
        rows.push(outcome);
        Ok(RecordResult::Inserted)
    }

    fn list_for_job(&self, job_id: JobId) -> Result<Vec<ItemOutcome>, OutcomeLogError> {
        let by_job = self.by_job.read().map_err(|_| Self::poisoned())?;
        let mut rows = by_job.get(&job_id).cloned().unwrap_or_default();
        // Stable: rows recorded within the same instant keep insertion order.
        rows.sort_by_key(|o| o.recorded_at);
        Ok(rows)
    }
}
