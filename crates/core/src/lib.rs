//! `bulkjobs-core`: job domain building blocks.
//!
//! This crate contains **pure domain** types for the bulk job pipeline: the
//! job record and its state machine, per-item outcomes, identifiers and the
//! domain error model. No IO lives here.

pub mod error;
pub mod id;
pub mod job;
pub mod outcome;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, TicketId, UserId};
pub use job::{Job, JobPayload, JobStatus, JobSummary, JobType, progress_percent};
pub use outcome::{ItemOutcome, ItemResult, TICKET_ALREADY_DELETED, TICKET_NOT_FOUND};
