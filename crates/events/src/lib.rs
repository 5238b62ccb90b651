//! Job lifecycle events and their fan-out mechanics.
//!
//! - `event`: the lifecycle facts a job produces
//! - `channel` / `envelope`: where a fact is delivered
//! - `bus` / `in_memory_bus`: transport-agnostic pub/sub
//! - `sink`: the injected emitter the pipeline talks to

pub mod bus;
pub mod channel;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod sink;

pub use bus::{EventBus, Subscription};
pub use channel::{Channel, SubmitterScoped};
pub use envelope::EventEnvelope;
pub use event::JobEvent;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use sink::{EventSink, FanoutEmitter, RecordingSink};
