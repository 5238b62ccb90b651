//! Pipeline wiring for the two run modes.
//!
//! - **In-memory**: stores, queue and worker pool all live in this process.
//! - **Persistent**: Postgres stores and the Redis queue; a separate worker
//!   process drains the queue and relays its events to `/internal/jobs/*`.
//!
//! Either way the real-time side is the same: events are routed by submitter
//! onto an in-process bus that the SSE endpoint subscribes to.

use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tracing::{error, info};

use bulkjobs_core::TicketId;
use bulkjobs_events::{EventEnvelope, InMemoryEventBus, JobEvent};
use bulkjobs_infra::{
    PipelineConfig,
    jobs::{
        BulkProcessor, InMemoryJobQueue, InMemoryJobStore, InMemoryOutcomeLog, JobStore, OutcomeLog, PoolStats,
        QueueError, SubmissionService, WorkerPool, WorkerPoolError, WorkerPoolHandle,
    },
    postgres::{self, PostgresJobStore, PostgresOutcomeLog},
    realtime::SubmitterRouter,
    redis_queue::RedisJobQueue,
    tickets::InMemoryTicketStore,
};
use sqlx::PgPool;

/// In-process bus the SSE endpoint subscribes to.
pub type RealtimeBus = Arc<InMemoryEventBus<EventEnvelope<JobEvent>>>;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] bulkjobs_infra::ConfigError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Workers(#[from] WorkerPoolError),
}

pub enum Backend {
    InMemory {
        tickets: Arc<InMemoryTicketStore>,
        workers: Mutex<Option<WorkerPoolHandle>>,
    },
    Persistent {
        pool: PgPool,
    },
}

pub struct AppServices {
    submissions: SubmissionService,
    router: Arc<SubmitterRouter<RealtimeBus>>,
    backend: Backend,
}

impl AppServices {
    /// Everything in-process; the worker pool starts immediately.
    pub fn in_memory(config: &PipelineConfig) -> Result<Self, ServiceError> {
        let jobs: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let outcomes: Arc<dyn OutcomeLog> = Arc::new(InMemoryOutcomeLog::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let tickets = Arc::new(InMemoryTicketStore::new());

        let bus: RealtimeBus = Arc::new(InMemoryEventBus::new());
        let router = Arc::new(SubmitterRouter::new(jobs.clone(), bus));

        let processor = BulkProcessor::new(jobs.clone(), outcomes.clone(), tickets.clone(), router.clone())
            .with_chunk_size(config.chunk_size);
        let workers = WorkerPool::new(Arc::new(processor), queue.clone()).spawn(config.worker_pool("bulk-worker"))?;

        info!(chunk_size = config.chunk_size, workers = workers.workers(), "in-memory pipeline ready");
        Ok(Self {
            submissions: SubmissionService::new(jobs, outcomes, queue, router.clone()),
            router,
            backend: Backend::InMemory {
                tickets,
                workers: Mutex::new(Some(workers)),
            },
        })
    }

    /// Postgres stores plus the Redis queue. Processing happens in `bulkjobs-worker`.
    pub async fn persistent(config: &PipelineConfig) -> Result<Self, ServiceError> {
        let pool = postgres::connect(config.require_database_url()?).await?;
        postgres::migrate(&pool).await?;

        let handle = Handle::current();
        let jobs: Arc<dyn JobStore> = Arc::new(PostgresJobStore::new(pool.clone(), handle.clone()));
        let outcomes: Arc<dyn OutcomeLog> = Arc::new(PostgresOutcomeLog::new(pool.clone(), handle));

        let redis_url = config.redis_url.clone();
        let queue = tokio::task::spawn_blocking(move || {
            RedisJobQueue::new(redis_url, format!("api-{}", uuid::Uuid::now_v7()))
        })
        .await
        .map_err(|e| QueueError::Connection(e.to_string()))??;

        let bus: RealtimeBus = Arc::new(InMemoryEventBus::new());
        let router = Arc::new(SubmitterRouter::new(jobs.clone(), bus));

        info!(stream = queue.stream_key(), "persistent pipeline ready");
        Ok(Self {
            submissions: SubmissionService::new(jobs, outcomes, Arc::new(queue), router.clone()),
            router,
            backend: Backend::Persistent { pool },
        })
    }

    pub fn submissions(&self) -> &SubmissionService {
        &self.submissions
    }

    pub fn router(&self) -> &SubmitterRouter<RealtimeBus> {
        &self.router
    }

    pub fn realtime_bus(&self) -> &RealtimeBus {
        self.router.bus()
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self.backend, Backend::Persistent { .. })
    }

    /// Add active tickets to the in-memory ticket store. Returns `false` in
    /// persistent mode, where tickets live in the database.
    pub fn seed_tickets(&self, ids: impl IntoIterator<Item = i64>) -> bool {
        match &self.backend {
            Backend::InMemory { tickets, .. } => {
                tickets.insert_active(ids);
                true
            }
            Backend::Persistent { .. } => false,
        }
    }

    /// Whether the in-memory ticket store has soft-deleted `id`.
    pub fn ticket_deleted(&self, id: TicketId) -> Option<bool> {
        match &self.backend {
            Backend::InMemory { tickets, .. } => Some(tickets.is_deleted(id)),
            Backend::Persistent { .. } => None,
        }
    }

    pub fn pool_stats(&self) -> Option<PoolStats> {
        match &self.backend {
            Backend::InMemory { workers, .. } => workers
                .lock()
                .ok()
                .and_then(|guard| guard.as_ref().map(WorkerPoolHandle::stats)),
            Backend::Persistent { .. } => None,
        }
    }

    /// Stop the in-process workers (blocking) or close the database pool.
    pub async fn shutdown(self: Arc<Self>) {
        match &self.backend {
            Backend::InMemory { workers, .. } => {
                let handle = workers.lock().ok().and_then(|mut guard| guard.take());
                if let Some(handle) = handle {
                    if tokio::task::spawn_blocking(move || handle.shutdown()).await.is_err() {
                        error!("worker pool shutdown panicked");
                    }
                }
            }
            Backend::Persistent { pool } => pool.close().await,
        }
        info!("services stopped");
    }
}
