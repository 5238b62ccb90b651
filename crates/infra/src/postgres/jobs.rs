use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use bulkjobs_core::{Job, JobId, JobPayload, JobStatus, UserId};

use super::{block_on, db_code, describe, is_unique_violation};
use crate::jobs::store::{JobFilter, JobPage, JobStore, JobStoreError};

const JOB_COLUMNS: &str = "id, job_type, status, progress, total_items, processed_items, submitter_id, \
     idempotency_key, payload, error, created_at, updated_at, completed_at";

/// Postgres-backed job record store.
///
/// Status changes are a single `UPDATE ... WHERE status = ANY(<legal sources>)`,
/// so a cancel request and a worker racing on the same row cannot both win.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, submitter = %job.submitter), err)]
    pub async fn insert_job(&self, job: Job) -> Result<Job, JobStoreError> {
        let payload = serde_json::to_value(&job.payload)
            .map_err(|e| JobStoreError::Storage(format!("failed to encode payload: {e}")))?;

        let result = sqlx::query(
            r#"
            INSERT INTO bulk_jobs (
                id, job_type, status, progress, total_items, processed_items, submitter_id,
                idempotency_key, payload, error, created_at, updated_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(i16::from(job.progress))
        .bind(to_i32(job.total_items))
        .bind(to_i32(job.processed_items))
        .bind(job.submitter.as_uuid())
        .bind(job.idempotency_key.as_deref())
        .bind(payload)
        .bind(job.error.as_deref())
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.completed_at)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(job),
            Err(err) if is_unique_violation(&err) => Err(unique_violation(&err, &job)),
            Err(err) => Err(map_sqlx_error("insert_job", err)),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn load_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM bulk_jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self, key), fields(submitter = %submitter), err)]
    pub async fn load_by_key(&self, submitter: UserId, key: &str) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM bulk_jobs WHERE submitter_id = $1 AND idempotency_key = $2"
        ))
        .bind(submitter.as_uuid())
        .bind(key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_by_key", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage, JobStoreError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) AS total FROM bulk_jobs WHERE TRUE");
        push_filters(&mut count, filter);
        let total: i64 = count
            .build()
            .fetch_one(&*self.pool)
            .await
            .and_then(|row| row.try_get("total"))
            .map_err(|e| map_sqlx_error("list_jobs.count", e))?;

        let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {JOB_COLUMNS} FROM bulk_jobs WHERE TRUE"));
        push_filters(&mut select, filter);
        select
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(filter.limit()))
            .push(" OFFSET ")
            .push_bind(i64::try_from(filter.offset()).unwrap_or(i64::MAX));

        let rows = select
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_jobs", e))?;

        let jobs = rows
            .iter()
            .map(|row| job_from_row(row).map(|job| job.summary()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(JobPage::new(jobs, filter, u64::try_from(total).unwrap_or(0)))
    }

    #[instrument(skip(self, error), fields(job_id = %job_id, to = %to), err)]
    pub async fn transition_job(
        &self,
        job_id: JobId,
        to: JobStatus,
        error: Option<String>,
    ) -> Result<Job, JobStoreError> {
        let sources: Vec<String> = JobStatus::legal_sources(to)
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let now = Utc::now();
        let completed_at: Option<DateTime<Utc>> = to.is_terminal().then_some(now);
        let error = if to == JobStatus::Failed { error } else { None };

        let row = sqlx::query(&format!(
            r#"
            UPDATE bulk_jobs
            SET status = $2,
                error = COALESCE($3, error),
                updated_at = $4,
                completed_at = COALESCE(completed_at, $5)
            WHERE id = $1 AND status = ANY($6)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .bind(to.as_str())
        .bind(error)
        .bind(now)
        .bind(completed_at)
        .bind(sources)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition_job", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => match self.load_job(job_id).await? {
                Some(current) => Err(JobStoreError::InvalidTransition {
                    from: current.status,
                    to,
                }),
                None => Err(JobStoreError::NotFound(job_id)),
            },
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn raise_progress(&self, job_id: JobId, processed: u32) -> Result<Job, JobStoreError> {
        // Same half-up integer rounding as `progress_percent`.
        let row = sqlx::query(&format!(
            r#"
            UPDATE bulk_jobs
            SET processed_items = $2,
                progress = (($2 * 200 + total_items) / (2 * total_items))::smallint,
                updated_at = $3
            WHERE id = $1 AND processed_items < $2 AND total_items >= $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .bind(to_i32(processed))
        .bind(Utc::now())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("raise_progress", e))?;

        if let Some(row) = row {
            return job_from_row(&row);
        }

        let current = self.load_job(job_id).await?.ok_or(JobStoreError::NotFound(job_id))?;
        if processed > current.total_items {
            return Err(JobStoreError::InvalidProgress(format!(
                "processed_items {processed} exceeds total_items {}",
                current.total_items
            )));
        }
        Ok(current)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn discard_queued(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        let result = sqlx::query("DELETE FROM bulk_jobs WHERE id = $1 AND status = 'queued'")
            .bind(job_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("discard_queued", e))?;
        Ok(result.rows_affected() == 1)
    }
}

impl JobStore for PostgresJobStore {
    fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
        block_on(&self.handle, self.insert_job(job))
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        block_on(&self.handle, self.load_job(job_id))
    }

    fn find_by_idempotency_key(&self, submitter: UserId, key: &str) -> Result<Option<Job>, JobStoreError> {
        block_on(&self.handle, self.load_by_key(submitter, key))
    }

    fn list(&self, filter: &JobFilter) -> Result<JobPage, JobStoreError> {
        block_on(&self.handle, self.list_jobs(filter))
    }

    fn transition(&self, job_id: JobId, to: JobStatus, error: Option<String>) -> Result<Job, JobStoreError> {
        block_on(&self.handle, self.transition_job(job_id, to, error))
    }

    fn update_progress(&self, job_id: JobId, processed: u32) -> Result<Job, JobStoreError> {
        block_on(&self.handle, self.raise_progress(job_id, processed))
    }

    fn discard(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        block_on(&self.handle, self.discard_queued(job_id))
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &JobFilter) {
    if let Some(job_type) = filter.job_type {
        qb.push(" AND job_type = ").push_bind(job_type.as_str());
    }
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(submitter) = filter.submitter {
        qb.push(" AND submitter_id = ").push_bind(*submitter.as_uuid());
    }
}

fn unique_violation(err: &sqlx::Error, job: &Job) -> JobStoreError {
    let constraint = match err {
        sqlx::Error::Database(db_err) => db_err.constraint().map(str::to_string),
        _ => None,
    };
    match (&job.idempotency_key, constraint.as_deref()) {
        (_, Some("bulk_jobs_pkey")) | (None, _) => JobStoreError::AlreadyExists(job.id),
        (Some(key), _) => JobStoreError::DuplicateIdempotencyKey {
            submitter: job.submitter,
            key: key.clone(),
        },
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    let msg = describe(operation, &err);
    match db_code(&err).as_deref() {
        Some("23514") => JobStoreError::InvalidProgress(msg),
        _ => JobStoreError::Storage(msg),
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let decode = |e: sqlx::Error| JobStoreError::Storage(format!("failed to decode job row: {e}"));

    let job_type: String = row.try_get("job_type").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let progress: i16 = row.try_get("progress").map_err(decode)?;
    let total_items: i32 = row.try_get("total_items").map_err(decode)?;
    let processed_items: i32 = row.try_get("processed_items").map_err(decode)?;
    let payload: serde_json::Value = row.try_get("payload").map_err(decode)?;
    let payload: JobPayload = serde_json::from_value(payload)
        .map_err(|e| JobStoreError::Storage(format!("failed to decode job payload: {e}")))?;

    Ok(Job {
        id: JobId::from_uuid(row.try_get("id").map_err(decode)?),
        job_type: job_type.parse()?,
        status: status.parse()?,
        progress: u8::try_from(progress).unwrap_or(0),
        total_items: u32::try_from(total_items).unwrap_or(0),
        processed_items: u32::try_from(processed_items).unwrap_or(0),
        submitter: UserId::from_uuid(row.try_get("submitter_id").map_err(decode)?),
        idempotency_key: row.try_get("idempotency_key").map_err(decode)?,
        payload,
        error: row.try_get("error").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
        completed_at: row.try_get("completed_at").map_err(decode)?,
    })
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}
