//! Standalone worker: drains the Redis job queue against the Postgres stores
//! and relays lifecycle events to the API's internal routes.

use std::sync::Arc;

use anyhow::Context;
use bulkjobs_infra::{
    PipelineConfig,
    jobs::{BulkProcessor, WorkerPool},
    postgres::{self, PostgresJobStore, PostgresOutcomeLog, PostgresTicketStore},
    redis_queue::RedisJobQueue,
    relay::HttpEventRelay,
};

fn main() -> anyhow::Result<()> {
    bulkjobs_observability::init("bulkjobs-worker");

    let config = PipelineConfig::from_env().context("invalid pipeline configuration")?;

    // Worker threads are plain OS threads; the runtime only drives sqlx.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("bulk-worker-io")
        .build()
        .context("failed to build tokio runtime")?;

    let database_url = config.require_database_url()?.to_string();
    let pool = rt
        .block_on(async {
            let pool = postgres::connect(&database_url).await?;
            postgres::migrate(&pool).await?;
            Ok::<_, anyhow::Error>(pool)
        })
        .context("failed to prepare database")?;

    let handle = rt.handle().clone();
    let jobs = Arc::new(PostgresJobStore::new(pool.clone(), handle.clone()));
    let outcomes = Arc::new(PostgresOutcomeLog::new(pool.clone(), handle.clone()));
    let tickets = Arc::new(PostgresTicketStore::new(pool.clone(), handle));

    let consumer = format!("worker-{}", uuid::Uuid::now_v7());
    let queue = RedisJobQueue::new(&config.redis_url, consumer.clone()).context("failed to connect to redis")?;
    let relay = HttpEventRelay::new(&config.api_url, config.internal_token.clone())
        .context("failed to build event relay")?;

    let processor = BulkProcessor::new(jobs, outcomes, tickets, Arc::new(relay)).with_chunk_size(config.chunk_size);
    let workers = WorkerPool::new(Arc::new(processor), Arc::new(queue))
        .spawn(config.worker_pool("bulk-worker"))
        .context("failed to start worker pool")?;

    tracing::info!(
        consumer = %consumer,
        workers = workers.workers(),
        chunk_size = config.chunk_size,
        api_url = %config.api_url,
        "worker started"
    );

    if let Err(e) = rt.block_on(tokio::signal::ctrl_c()) {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown requested");

    workers.shutdown();
    rt.block_on(pool.close());
    tracing::info!("worker stopped");
    Ok(())
}
