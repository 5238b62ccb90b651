//! Per-item outcomes recorded while a job runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{JobId, TicketId};

/// Failure reason for an id that does not exist in the ticket store.
pub const TICKET_NOT_FOUND: &str = "Ticket not found";

/// Failure reason for an id whose ticket was soft-deleted earlier.
pub const TICKET_ALREADY_DELETED: &str = "Ticket already deleted";

/// Result of attempting one item.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemResult {
    Succeeded,
    Failed,
}

impl ItemResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemResult::Succeeded => "succeeded",
            ItemResult::Failed => "failed",
        }
    }
}

impl core::fmt::Display for ItemResult {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ItemResult {
    type Err = crate::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(ItemResult::Succeeded),
            "failed" => Ok(ItemResult::Failed),
            other => Err(crate::DomainError::validation(format!(
                "unknown item outcome: {other}"
            ))),
        }
    }
}

/// Audit record for one item of one job. Never mutated once recorded.
///
/// `error` is present iff `outcome` is `Failed`; the constructors are the only
/// way to build one outside of storage adapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub job_id: JobId,
    pub item_id: TicketId,
    pub outcome: ItemResult,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ItemOutcome {
    pub fn succeeded(job_id: JobId, item_id: TicketId) -> Self {
        Self {
            job_id,
            item_id,
            outcome: ItemResult::Succeeded,
            error: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn failed(job_id: JobId, item_id: TicketId, error: impl Into<String>) -> Self {
        Self {
            job_id,
            item_id,
            outcome: ItemResult::Failed,
            error: Some(error.into()),
            recorded_at: Utc::now(),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.outcome == ItemResult::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_present_only_on_failure() {
        let job = JobId::new();
        let ok = ItemOutcome::succeeded(job, TicketId::new(5));
        assert!(ok.error.is_none());
        assert!(!ok.is_failure());

        let bad = ItemOutcome::failed(job, TicketId::new(6), TICKET_ALREADY_DELETED);
        assert_eq!(bad.error.as_deref(), Some("Ticket already deleted"));
        assert!(bad.is_failure());
    }

    #[test]
    fn outcome_round_trips_through_str() {
        for r in [ItemResult::Succeeded, ItemResult::Failed] {
            assert_eq!(r.as_str().parse::<ItemResult>().unwrap(), r);
        }
    }
}
