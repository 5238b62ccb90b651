use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::runtime::Handle;
use tracing::instrument;

use bulkjobs_core::TicketId;

use super::{block_on, describe};
use crate::tickets::{TicketState, TicketStore, TicketStoreError};

#[derive(Debug, Clone)]
pub struct PostgresTicketStore {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresTicketStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    /// Insert an active ticket for database tests.
    #[cfg(test)]
    pub(crate) fn create(&self, title: &str) -> Result<TicketId, TicketStoreError> {
        block_on(&self.handle, async {
            let id: i64 = sqlx::query_scalar("INSERT INTO tickets (title) VALUES ($1) RETURNING id")
                .bind(title)
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| TicketStoreError::Storage(describe("create_ticket", &e)))?;
            Ok::<_, TicketStoreError>(TicketId::new(id))
        })
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    pub async fn soft_delete(&self, ids: &[TicketId]) -> Result<Vec<TicketId>, TicketStoreError> {
        let raw: Vec<i64> = ids.iter().copied().map(TicketId::get).collect();
        let changed: Vec<i64> = sqlx::query_scalar(
            r#"
            UPDATE tickets
            SET deleted_at = now()
            WHERE id = ANY($1) AND deleted_at IS NULL
            RETURNING id
            "#,
        )
        .bind(raw)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| TicketStoreError::Storage(describe("soft_delete", &e)))?;

        Ok(changed.into_iter().map(TicketId::new).collect())
    }

    #[instrument(skip(self), fields(ticket_id = %id), err)]
    pub async fn find_state(&self, id: TicketId) -> Result<TicketState, TicketStoreError> {
        let row: Option<Option<DateTime<Utc>>> = sqlx::query_scalar("SELECT deleted_at FROM tickets WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| TicketStoreError::Storage(describe("find_state", &e)))?;

        Ok(match row {
            None => TicketState::Missing,
            Some(None) => TicketState::Active,
            Some(Some(_)) => TicketState::Deleted,
        })
    }
}

impl TicketStore for PostgresTicketStore {
    fn bulk_soft_delete(&self, ids: &[TicketId]) -> Result<Vec<TicketId>, TicketStoreError> {
        block_on(&self.handle, self.soft_delete(ids))
    }

    fn lookup(&self, id: TicketId) -> Result<TicketState, TicketStoreError> {
        block_on(&self.handle, self.find_state(id))
    }
}
