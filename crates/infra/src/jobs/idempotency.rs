use std::sync::Arc;

use bulkjobs_core::{Job, UserId};

use super::store::{JobStore, JobStoreError};

/// Maps `(submitter, idempotency key)` to the job already created under it.
///
/// Pure lookup; uniqueness itself is enforced by the job store on insert.
#[derive(Clone)]
pub struct IdempotencyResolver {
    jobs: Arc<dyn JobStore>,
}

impl IdempotencyResolver {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        Self { jobs }
    }

    /// No key (or a blank one) never matches.
    pub fn resolve(&self, submitter: UserId, key: Option<&str>) -> Result<Option<Job>, JobStoreError> {
        match key.map(str::trim).filter(|k| !k.is_empty()) {
            Some(key) => self.jobs.find_by_idempotency_key(submitter, key),
            None => Ok(None),
        }
    }
}
