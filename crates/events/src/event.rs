//! Lifecycle facts a job produces while it moves through the pipeline.

use serde::{Deserialize, Serialize};

use bulkjobs_core::{ItemResult, JobId, JobSummary, TicketId};

/// A lifecycle fact about one job.
///
/// Serialized with a `kind` tag; field names are camelCase on the wire so
/// real-time clients see `jobId`, `processedItems`, `itemId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum JobEvent {
    /// A new job was accepted (never emitted for idempotent re-submissions).
    Created { job_id: JobId, job: JobSummary },
    /// Processed count advanced, or the job was found canceled mid-run.
    Progress {
        job_id: JobId,
        progress: u8,
        processed_items: u32,
    },
    /// One item finished.
    Item {
        job_id: JobId,
        item_id: TicketId,
        status: ItemResult,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Completed { job_id: JobId, job: JobSummary },
    Failed { job_id: JobId, error: String },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Created { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Item { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Failed { job_id, .. } => *job_id,
        }
    }

    /// Name real-time clients listen for.
    pub fn topic(&self) -> &'static str {
        match self {
            JobEvent::Created { .. } => "jobs:created",
            JobEvent::Progress { .. } => "jobs:progress",
            JobEvent::Item { .. } => "jobs:item",
            JobEvent::Completed { .. } => "jobs:completed",
            JobEvent::Failed { .. } => "jobs:failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Completed { .. } | JobEvent::Failed { .. })
    }
}
