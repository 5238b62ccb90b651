use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::{Channel, SubmitterScoped};

/// Envelope for a lifecycle event, carrying its delivery channel.
///
/// This is the unit distributed over the event bus. One emitted event yields
/// one envelope per channel it is routed to.
///
/// Notes:
/// - `event_id` is shared by all copies of the same fact, so clients
///   subscribed to more than one channel can de-duplicate.
/// - `payload` is the job event itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    channel: Channel,
    occurred_at: DateTime<Utc>,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(event_id: Uuid, channel: Channel, occurred_at: DateTime<Utc>, payload: E) -> Self {
        Self {
            event_id,
            channel,
            occurred_at,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}

impl<E> SubmitterScoped for EventEnvelope<E> {
    fn channel(&self) -> Channel {
        self.channel
    }
}
