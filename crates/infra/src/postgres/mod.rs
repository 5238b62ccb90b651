//! PostgreSQL adapters for the job record store, outcome log and tickets.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Code | Mapped to | Scenario |
//! |------------|-----------------|-----------|----------|
//! | Database (unique violation) | `23505` | `DuplicateIdempotencyKey` / `AlreadyExists` | concurrent submit with the same key |
//! | Database (check violation) | `23514` | `InvalidProgress` | progress outside `0..=total_items` |
//! | Database (other) | any | `Storage` | |
//! | PoolClosed / network / decode | n/a | `Storage` | |
//!
//! ## Sync traits over async sqlx
//!
//! The store traits are synchronous. Each adapter keeps a tokio runtime
//! handle and drives its queries through [`block_on`], which also works
//! from inside a multi-threaded runtime.

use std::future::Future;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::runtime::Handle;

mod jobs;
mod outcomes;
mod tickets;

pub use jobs::PostgresJobStore;
pub use outcomes::PostgresOutcomeLog;
pub use tickets::PostgresTicketStore;

const SCHEMA: &str = include_str!("../../migrations/0001_bulk_jobs.sql");

pub async fn connect(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

/// Apply the schema. Every statement is idempotent.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

/// Run `fut` to completion on `handle` from synchronous code.
pub(crate) fn block_on<F: Future>(handle: &Handle, fut: F) -> F::Output {
    if Handle::try_current().is_ok() {
        tokio::task::block_in_place(|| handle.block_on(fut))
    } else {
        handle.block_on(fut)
    }
}

pub(crate) fn db_code(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
        _ => None,
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    db_code(err).as_deref() == Some("23505")
}

pub(crate) fn describe(operation: &str, err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => format!("database error in {operation}: {}", db_err.message()),
        sqlx::Error::PoolClosed => format!("connection pool closed in {operation}"),
        other => format!("sqlx error in {operation}: {other}"),
    }
}
