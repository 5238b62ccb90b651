//! Ticket soft-delete primitive used by the bulk processor.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use bulkjobs_core::{TICKET_ALREADY_DELETED, TICKET_NOT_FOUND, TicketId};

/// What a secondary lookup found for an id the mutation did not change.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TicketState {
    Missing,
    Active,
    Deleted,
}

impl TicketState {
    /// Failure reason recorded for an unchanged id in this state.
    pub fn failure_reason(&self) -> &'static str {
        match self {
            TicketState::Missing => TICKET_NOT_FOUND,
            TicketState::Deleted => TICKET_ALREADY_DELETED,
            // Present but untouched: only a concurrent restore can get here.
            TicketState::Active => "Ticket was not deleted",
        }
    }
}

pub trait TicketStore: Send + Sync {
    /// Soft-delete every listed ticket that is not already deleted.
    /// Returns the ids that actually changed.
    fn bulk_soft_delete(&self, ids: &[TicketId]) -> Result<Vec<TicketId>, TicketStoreError>;

    fn lookup(&self, id: TicketId) -> Result<TicketState, TicketStoreError>;
}

impl<T> TicketStore for Arc<T>
where
    T: TicketStore + ?Sized,
{
    fn bulk_soft_delete(&self, ids: &[TicketId]) -> Result<Vec<TicketId>, TicketStoreError> {
        (**self).bulk_soft_delete(ids)
    }

    fn lookup(&self, id: TicketId) -> Result<TicketState, TicketStoreError> {
        (**self).lookup(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TicketStoreError {
    #[error("ticket storage error: {0}")]
    Storage(String),
}

/// In-memory tickets keyed by id; `Some(ts)` marks a soft-deleted ticket.
#[derive(Debug, Default)]
pub struct InMemoryTicketStore {
    tickets: RwLock<HashMap<TicketId, Option<DateTime<Utc>>>>,
}

impl InMemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with active tickets.
    pub fn seeded(ids: impl IntoIterator<Item = i64>) -> Self {
        let store = Self::new();
        store.insert_active(ids);
        store
    }

    pub fn insert_active(&self, ids: impl IntoIterator<Item = i64>) {
        if let Ok(mut tickets) = self.tickets.write() {
            for id in ids {
                tickets.insert(TicketId::new(id), None);
            }
        }
    }

    pub fn insert_deleted(&self, ids: impl IntoIterator<Item = i64>) {
        if let Ok(mut tickets) = self.tickets.write() {
            for id in ids {
                tickets.insert(TicketId::new(id), Some(Utc::now()));
            }
        }
    }

    pub fn is_deleted(&self, id: TicketId) -> bool {
        matches!(self.lookup(id), Ok(TicketState::Deleted))
    }

    fn poisoned() -> TicketStoreError {
        TicketStoreError::Storage("ticket store lock poisoned".to_string())
    }
}

impl TicketStore for InMemoryTicketStore {
    fn bulk_soft_delete(&self, ids: &[TicketId]) -> Result<Vec<TicketId>, TicketStoreError> {
        let mut tickets = self.tickets.write().map_err(|_| Self::poisoned())?;
        let now = Utc::now();
        let mut changed = Vec::new();
        for id in ids {
            let Some(deleted_at) = tickets.get_mut(id) else {
                continue;
            };
            if deleted_at.is_none() {
                *deleted_at = Some(now);
                changed.push(*id);
            }
        }
        Ok(changed)
    }

    fn lookup(&self, id: TicketId) -> Result<TicketState, TicketStoreError> {
        let tickets = self.tickets.read().map_err(|_| Self::poisoned())?;
        Ok(match tickets.get(&id) {
            None => TicketState::Missing,
            Some(None) => TicketState::Active,
            Some(Some(_)) => TicketState::Deleted,
        })
    }
}
