//! Bulk job record and its lifecycle state machine.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, TicketId, UserId};

/// Job execution status.
///
/// ```text
/// queued ──► running ──► succeeded
///   │           ├──────► failed
///   │           └──────► canceled
///   └──────────────────► canceled
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker to pick it up
    Queued,
    /// A worker is processing chunks
    Running,
    /// Every item was attempted (individual items may still have failed)
    Succeeded,
    /// An unexpected error aborted the run
    Failed,
    /// Canceled before or during processing
    Canceled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Canceled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Whether an external cancel request may be honored in this status.
    pub fn is_cancelable(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    /// Legal forward moves of the state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Canceled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Canceled)
        )
    }

    /// Source statuses from which `next` is reachable.
    ///
    /// Storage adapters use this to build conditional updates.
    pub fn legal_sources(next: JobStatus) -> Vec<JobStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(next))
            .collect()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

/// Job kind. Only one kind of bulk mutation exists today.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    BulkDelete,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::BulkDelete => "bulk_delete",
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bulk_delete" => Ok(JobType::BulkDelete),
            other => Err(DomainError::validation(format!("unknown job type: {other}"))),
        }
    }
}

/// Immutable work description, tagged by job type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    /// Soft-delete the listed tickets, in order.
    BulkDelete { ticket_ids: Vec<TicketId> },
}

impl JobPayload {
    /// Build a bulk-delete payload. The id list must not be empty.
    ///
    /// Repeated ids collapse to their first occurrence, so every item maps to
    /// exactly one outcome.
    pub fn bulk_delete(ticket_ids: Vec<TicketId>) -> DomainResult<Self> {
        if ticket_ids.is_empty() {
            return Err(DomainError::validation("ticketIds must be a non-empty array"));
        }
        let mut seen = std::collections::HashSet::with_capacity(ticket_ids.len());
        let ticket_ids = ticket_ids.into_iter().filter(|id| seen.insert(*id)).collect();
        Ok(Self::BulkDelete { ticket_ids })
    }

    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::BulkDelete { .. } => JobType::BulkDelete,
        }
    }

    /// Ordered target items.
    pub fn items(&self) -> &[TicketId] {
        match self {
            JobPayload::BulkDelete { ticket_ids } => ticket_ids,
        }
    }

    pub fn item_count(&self) -> u32 {
        u32::try_from(self.items().len()).unwrap_or(u32::MAX)
    }
}

/// Percentage of `processed` over `total`, rounded half-up.
///
/// Integer arithmetic keeps the result exact: `floor((200p + t) / 2t)` equals
/// `round(p / t * 100)` for non-negative inputs.
pub fn progress_percent(processed: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    let processed = u64::from(processed.min(total));
    let total = u64::from(total);
    ((processed * 200 + total) / (2 * total)) as u8
}

/// A bulk job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    /// 0..=100
    pub progress: u8,
    pub total_items: u32,
    pub processed_items: u32,
    pub submitter: UserId,
    pub idempotency_key: Option<String>,
    pub payload: JobPayload,
    /// Set only when `status == Failed`
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set exactly once, on entering a terminal status
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new queued job.
    ///
    /// A blank idempotency key is treated as absent.
    pub fn new(submitter: UserId, payload: JobPayload, idempotency_key: Option<String>) -> DomainResult<Self> {
        if payload.items().is_empty() {
            return Err(DomainError::validation("ticketIds must be a non-empty array"));
        }

        let now = Utc::now();
        Ok(Self {
            id: JobId::new(),
            job_type: payload.job_type(),
            status: JobStatus::Queued,
            progress: 0,
            total_items: payload.item_count(),
            processed_items: 0,
            submitter,
            idempotency_key: normalize_key(idempotency_key),
            payload,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        })
    }

    /// Move to `next`, enforcing the state machine.
    ///
    /// Entering a terminal status stamps `completed_at`.
    pub fn transition_to(&mut self, next: JobStatus, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition_to(JobStatus::Running, now)
    }

    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition_to(JobStatus::Succeeded, now)
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition_to(JobStatus::Failed, now)?;
        self.error = Some(error.into());
        Ok(())
    }

    pub fn mark_canceled(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition_to(JobStatus::Canceled, now)
    }

    /// Persist a new processed count and recompute `progress`.
    ///
    /// The count may stay equal (a resumed run re-reporting) but never
    /// decreases and never exceeds `total_items`.
    pub fn record_progress(&mut self, processed_items: u32, now: DateTime<Utc>) -> DomainResult<()> {
        if processed_items > self.total_items {
            return Err(DomainError::invariant(format!(
                "processed_items {processed_items} exceeds total_items {}",
                self.total_items
            )));
        }
        if processed_items < self.processed_items {
            return Err(DomainError::invariant(format!(
                "processed_items may not decrease ({} -> {processed_items})",
                self.processed_items
            )));
        }
        self.processed_items = processed_items;
        self.progress = progress_percent(processed_items, self.total_items);
        self.updated_at = now;
        Ok(())
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary::from(self)
    }
}

fn normalize_key(key: Option<String>) -> Option<String> {
    key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty())
}

/// Job snapshot without the payload, used in listings and event bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: u8,
    pub total_items: u32,
    pub processed_items: u32,
    pub submitter: UserId,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type,
            status: job.status,
            progress: job.progress,
            total_items: job.total_items,
            processed_items: job.processed_items,
            submitter: job.submitter,
            error: job.error.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
        }
    }
}
