//! Fixed-size worker pool draining a [`JobQueue`] into the [`BulkProcessor`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::processor::{Attempt, BulkProcessor, ProcessOutcome};
use super::queue::{Delivery, JobQueue, QueueError};
use super::types::RetryPolicy;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker threads; each runs one unit at a time.
    pub workers: usize,
    /// How long one dequeue call blocks before re-checking for shutdown.
    pub poll_interval: Duration,
    /// Thread name prefix, also used in logs.
    pub name: String,
    pub retry: RetryPolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            poll_interval: Duration::from_millis(250),
            name: "bulk-worker".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub units_processed: u64,
    pub units_succeeded: u64,
    pub units_canceled: u64,
    pub units_skipped: u64,
    /// Abandoned mid-run after another worker took the delivery over.
    pub units_released: u64,
    pub units_failed: u64,
    pub units_retried: u64,
    pub units_dead_lettered: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: Arc<AtomicBool>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<PoolStats>>,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Stop taking new units and wait for in-flight ones to finish.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for join in self.joins {
            if join.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = lock_stats(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    pub fn workers(&self) -> usize {
        self.joins.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

pub struct WorkerPool {
    processor: Arc<BulkProcessor>,
    queue: Arc<dyn JobQueue>,
}

impl WorkerPool {
    pub fn new(processor: Arc<BulkProcessor>, queue: Arc<dyn JobQueue>) -> Self {
        Self { processor, queue }
    }

    /// Spawn the workers in background threads.
    pub fn spawn(self, config: WorkerPoolConfig) -> Result<WorkerPoolHandle, WorkerPoolError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(PoolStats::default()));
        let workers = config.workers.max(1);

        let mut joins = Vec::with_capacity(workers);
        for n in 0..workers {
            let worker = Worker {
                name: format!("{}-{n}", config.name),
                processor: self.processor.clone(),
                queue: self.queue.clone(),
                retry: config.retry.clone(),
                poll_interval: config.poll_interval,
                stats: stats.clone(),
            };
            let worker_shutdown = shutdown.clone();
            let join = thread::Builder::new()
                .name(worker.name.clone())
                .spawn(move || worker.run(&worker_shutdown));

            match join {
                Ok(join) => joins.push(join),
                Err(err) => {
                    // Wind down whatever already started before reporting.
                    shutdown.store(true, Ordering::SeqCst);
                    for join in joins {
                        let _ = join.join();
                    }
                    return Err(err.into());
                }
            }
        }

        info!(pool = %config.name, workers, "worker pool started");
        Ok(WorkerPoolHandle {
            shutdown,
            joins,
            stats,
            started: Instant::now(),
        })
    }
}

struct Worker {
    name: String,
    processor: Arc<BulkProcessor>,
    queue: Arc<dyn JobQueue>,
    retry: RetryPolicy,
    poll_interval: Duration,
    stats: Arc<Mutex<PoolStats>>,
}

impl Worker {
    fn run(&self, shutdown: &AtomicBool) {
        debug!(worker = %self.name, "worker started");

        while !shutdown.load(Ordering::SeqCst) {
            match self.queue.dequeue(self.poll_interval) {
                Ok(Some(delivery)) => self.handle(delivery),
                Ok(None) => {}
                Err(err) => {
                    error!(worker = %self.name, error = %err, "failed to dequeue");
                    thread::sleep(self.poll_interval);
                }
            }
        }

        debug!(worker = %self.name, "worker stopped");
    }

    fn handle(&self, delivery: Delivery) {
        let unit = &delivery.unit;
        debug!(worker = %self.name, job_id = %unit.job_id, attempt = unit.attempt, "picked up unit");
        lock_stats(&self.stats).current_running += 1;

        let keep_lease = || self.renew(&delivery);
        let attempt = Attempt {
            is_final: !self.retry.should_retry(unit.attempt),
            keep_lease: Some(&keep_lease),
        };
        let result = self.processor.process_attempt(unit, &attempt);

        let mut stats = lock_stats(&self.stats);
        stats.current_running = stats.current_running.saturating_sub(1);
        stats.units_processed += 1;

        let settled = match result {
            Ok(outcome) => {
                match outcome {
                    ProcessOutcome::Succeeded => stats.units_succeeded += 1,
                    ProcessOutcome::Canceled => stats.units_canceled += 1,
                    ProcessOutcome::Skipped => stats.units_skipped += 1,
                    ProcessOutcome::Released => {
                        // The new owner settles the delivery.
                        stats.units_released += 1;
                        return;
                    }
                }
                drop(stats);
                self.queue.ack(&delivery)
            }
            Err(err) => {
                stats.units_failed += 1;
                if self.retry.should_retry(unit.attempt) {
                    stats.units_retried += 1;
                    drop(stats);
                    let delay = self.retry.delay_for_attempt(unit.attempt);
                    warn!(
                        worker = %self.name,
                        job_id = %unit.job_id,
                        attempt = unit.attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "unit failed; scheduling retry"
                    );
                    self.queue.retry(&delivery, delay)
                } else {
                    stats.units_dead_lettered += 1;
                    drop(stats);
                    warn!(
                        worker = %self.name,
                        job_id = %unit.job_id,
                        attempts = unit.attempt,
                        error = %err,
                        "unit exhausted its attempts; dead-lettering"
                    );
                    self.queue.dead_letter(&delivery, &err.to_string())
                }
            }
        };

        if let Err(err) = settled {
            error!(worker = %self.name, job_id = %unit.job_id, error = %err, "failed to settle delivery");
        }
    }

    /// Renew the delivery lease. Only a lost lease stops the run; a failed
    /// renewal is retried at the next chunk boundary.
    fn renew(&self, delivery: &Delivery) -> bool {
        match self.queue.touch(delivery) {
            Ok(()) => true,
            Err(QueueError::LeaseLost(receipt)) => {
                warn!(worker = %self.name, job_id = %delivery.unit.job_id, %receipt, "delivery taken over by another worker");
                false
            }
            Err(err) => {
                warn!(worker = %self.name, job_id = %delivery.unit.job_id, error = %err, "failed to renew delivery lease");
                true
            }
        }
    }
}

fn lock_stats(stats: &Mutex<PoolStats>) -> MutexGuard<'_, PoolStats> {
    // Stats are plain counters; a panic mid-update leaves them usable.
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
