//! Pipeline error taxonomy surfaced to callers of the submission service.
//!
//! Per-item failures are not errors here: they are recorded as outcomes.

use bulkjobs_core::{DomainError, JobId};

use crate::jobs::outcomes::OutcomeLogError;
use crate::jobs::processor::ProcessorError;
use crate::jobs::queue::QueueError;
use crate::jobs::store::JobStoreError;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Rejected before any state was touched.
    #[error("{0}")]
    InvalidRequest(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    /// Operation illegal in the job's current state.
    #[error("{0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("processing failed: {0}")]
    Processor(#[from] ProcessorError),
}

impl From<DomainError> for JobError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => JobError::InvalidRequest(msg),
            other => JobError::Conflict(other.to_string()),
        }
    }
}

impl From<JobStoreError> for JobError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => JobError::NotFound(id),
            JobStoreError::InvalidTransition { .. } => JobError::Conflict(err.to_string()),
            other => JobError::Storage(other.to_string()),
        }
    }
}

impl From<OutcomeLogError> for JobError {
    fn from(err: OutcomeLogError) -> Self {
        JobError::Storage(err.to_string())
    }
}

impl From<QueueError> for JobError {
    fn from(err: QueueError) -> Self {
        JobError::Storage(err.to_string())
    }
}
