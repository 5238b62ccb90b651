//! Infrastructure layer: stores, queue, worker pool, event routing, config.

pub mod config;
pub mod error;
pub mod jobs;
pub mod postgres;
pub mod realtime;
pub mod relay;
pub mod tickets;

#[cfg(feature = "redis")]
pub mod redis_queue;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, PipelineConfig};
pub use error::JobError;
