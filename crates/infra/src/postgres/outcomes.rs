use std::collections::HashSet;
use std::sync::Arc;

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use bulkjobs_core::{ItemOutcome, JobId, TicketId};

use super::{block_on, describe};
use crate::jobs::outcomes::{OutcomeLog, OutcomeLogError, RecordResult};

/// Postgres-backed item outcome log.
///
/// The `(job_id, item_id)` primary key plus `ON CONFLICT DO NOTHING` makes
/// recording idempotent across redeliveries.
#[derive(Debug, Clone)]
pub struct PostgresOutcomeLog {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresOutcomeLog {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    #[instrument(skip(self, outcome), fields(job_id = %outcome.job_id, item_id = %outcome.item_id), err)]
    pub async fn insert_outcome(&self, outcome: ItemOutcome) -> Result<RecordResult, OutcomeLogError> {
        let result = sqlx::query(
            r#"
            INSERT INTO bulk_job_items (job_id, item_id, outcome, error, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (job_id, item_id) DO NOTHING
            "#,
        )
        .bind(outcome.job_id.as_uuid())
        .bind(outcome.item_id.get())
        .bind(outcome.outcome.as_str())
        .bind(outcome.error.as_deref())
        .bind(outcome.recorded_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| OutcomeLogError::Storage(describe("insert_outcome", &e)))?;

        Ok(if result.rows_affected() == 1 {
            RecordResult::Inserted
        } else {
            RecordResult::Duplicate
        })
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn load_outcomes(&self, job_id: JobId) -> Result<Vec<ItemOutcome>, OutcomeLogError> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, item_id, outcome, error, recorded_at
            FROM bulk_job_items
            WHERE job_id = $1
            ORDER BY recorded_at ASC, seq ASC
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| OutcomeLogError::Storage(describe("load_outcomes", &e)))?;

        rows.iter().map(outcome_from_row).collect()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn load_recorded_items(&self, job_id: JobId) -> Result<HashSet<TicketId>, OutcomeLogError> {
        let ids: Vec<i64> = sqlx::query_scalar("SELECT item_id FROM bulk_job_items WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| OutcomeLogError::Storage(describe("load_recorded_items", &e)))?;

        Ok(ids.into_iter().map(TicketId::new).collect())
    }
}

impl OutcomeLog for PostgresOutcomeLog {
    fn record(&self, outcome: ItemOutcome) -> Result<RecordResult, OutcomeLogError> {
        block_on(&self.handle, self.insert_outcome(outcome))
    }

    fn list_for_job(&self, job_id: JobId) -> Result<Vec<ItemOutcome>, OutcomeLogError> {
        block_on(&self.handle, self.load_outcomes(job_id))
    }

    fn recorded_items(&self, job_id: JobId) -> Result<HashSet<TicketId>, OutcomeLogError> {
        block_on(&self.handle, self.load_recorded_items(job_id))
    }
}

fn outcome_from_row(row: &PgRow) -> Result<ItemOutcome, OutcomeLogError> {
    let decode = |e: sqlx::Error| OutcomeLogError::Storage(format!("failed to decode outcome row: {e}"));
    let outcome: String = row.try_get("outcome").map_err(decode)?;

    Ok(ItemOutcome {
        job_id: JobId::from_uuid(row.try_get("job_id").map_err(decode)?),
        item_id: TicketId::new(row.try_get("item_id").map_err(decode)?),
        outcome: outcome
            .parse()
            .map_err(|e| OutcomeLogError::Storage(format!("{e}")))?,
        error: row.try_get("error").map_err(decode)?,
        recorded_at: row.try_get("recorded_at").map_err(decode)?,
    })
}
