//! The asynchronous bulk job pipeline.
//!
//! ## Components
//!
//! - `JobStore`: job records with conditional status/progress writes
//! - `OutcomeLog`: append-only per-item outcomes
//! - `IdempotencyResolver`: `(submitter, key)` lookup
//! - `SubmissionService`: submit, query, cancel
//! - `JobQueue`: at-least-once hand-off to workers
//! - `BulkProcessor`: chunked execution with cooperative cancellation
//! - `WorkerPool`: threads draining the queue, retrying with backoff,
//!   dead-lettering exhausted units

pub mod idempotency;
pub mod outcomes;
pub mod pool;
pub mod processor;
pub mod queue;
pub mod store;
pub mod submission;
pub mod types;

pub use idempotency::IdempotencyResolver;
pub use outcomes::{InMemoryOutcomeLog, OutcomeLog, OutcomeLogError, RecordResult};
pub use pool::{PoolStats, WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolHandle};
pub use processor::{Attempt, BulkProcessor, DEFAULT_CHUNK_SIZE, ProcessOutcome, ProcessorError};
pub use queue::{Delivery, InMemoryJobQueue, JobQueue, QueueError};
pub use store::{InMemoryJobStore, JobFilter, JobPage, JobStore, JobStoreError};
pub use submission::{CANNOT_CANCEL, JobDetail, Submission, SubmissionService};
pub use types::{BackoffStrategy, DeadLetterEntry, RetryPolicy, WorkUnit};
