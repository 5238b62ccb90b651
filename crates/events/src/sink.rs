//! The emitter the pipeline is handed at construction time.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use uuid::Uuid;

use bulkjobs_core::UserId;

use crate::bus::EventBus;
use crate::channel::Channel;
use crate::envelope::EventEnvelope;
use crate::event::JobEvent;

/// Fire-and-forget delivery of lifecycle events.
///
/// Emission never fails from the caller's point of view: implementations log
/// delivery problems and return. Job state is already persisted by the time
/// an event is emitted.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: JobEvent);
}

impl<S> EventSink for Arc<S>
where
    S: EventSink + ?Sized,
{
    fn emit(&self, event: JobEvent) {
        (**self).emit(event)
    }
}

/// Publishes one event to the submitter's channel and to the broadcast channel.
#[derive(Debug, Clone)]
pub struct FanoutEmitter<B> {
    bus: B,
}

impl<B> FanoutEmitter<B>
where
    B: EventBus<EventEnvelope<JobEvent>>,
{
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn deliver(&self, submitter: UserId, event: JobEvent) {
        let event_id = Uuid::now_v7();
        let occurred_at = Utc::now();

        for channel in [Channel::Submitter(submitter), Channel::Broadcast] {
            let envelope = EventEnvelope::new(event_id, channel, occurred_at, event.clone());
            if let Err(err) = self.bus.publish(envelope) {
                tracing::warn!(
                    job_id = %event.job_id(),
                    topic = event.topic(),
                    room = %channel.room(),
                    error = ?err,
                    "failed to publish job event"
                );
            }
        }
    }
}

/// Sink that keeps every emitted event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<JobEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<&'static str> {
        self.events().iter().map(JobEvent::topic).collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: JobEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
