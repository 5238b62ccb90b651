//! Real-time job events over Server-Sent Events.
//!
//! Every caller receives its own submitter channel; admins also receive the
//! broadcast channel. An admin who submitted a job therefore sees each of its
//! events twice, once per channel, distinguishable by `channel`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::Extension,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
};
use bulkjobs_events::{EventBus, EventEnvelope, JobEvent};
use tokio::sync::mpsc::unbounded_channel;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::app::services::AppServices;
use crate::context::PrincipalContext;

/// GET /stream
///
/// Each SSE message is named after the event topic (`jobs:progress`, ...)
/// and carries:
/// - channel (`user:<id>` or `admin`)
/// - eventId, shared by the copies of one event on different channels
/// - occurredAt
/// - event, the lifecycle event itself
pub async fn stream_events(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    let viewer = principal.user_id();
    let privileged = principal.is_admin();

    // Subscribe before returning so nothing published after the handshake is missed.
    let subscription = services.realtime_bus().subscribe();
    let (tx, rx) = unbounded_channel::<Result<SseEvent, std::convert::Infallible>>();

    // The bus is synchronous; forward from a blocking task.
    tokio::task::spawn_blocking(move || {
        let mut last_heartbeat = std::time::Instant::now();

        loop {
            match subscription.recv_timeout(Duration::from_millis(1000)) {
                Ok(envelope) => {
                    if !envelope.channel().is_visible_to(viewer, privileged) {
                        continue;
                    }

                    let Some(sse_event) = to_sse(&envelope) else {
                        continue;
                    };
                    if tx.send(Ok(sse_event)).is_err() {
                        break; // Receiver dropped
                    }
                    last_heartbeat = std::time::Instant::now();
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    if tx.is_closed() {
                        break;
                    }
                    if last_heartbeat.elapsed() > Duration::from_secs(15) {
                        let heartbeat = SseEvent::default().event("heartbeat").data("{}");
                        if tx.send(Ok(heartbeat)).is_err() {
                            break;
                        }
                        last_heartbeat = std::time::Instant::now();
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    break; // Bus closed
                }
            }
        }
        debug!(user_id = %viewer, "event stream closed");
    });

    let stream = UnboundedReceiverStream::new(rx);
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

fn to_sse(envelope: &EventEnvelope<JobEvent>) -> Option<SseEvent> {
    let data = serde_json::json!({
        "channel": envelope.channel().room(),
        "eventId": envelope.event_id().to_string(),
        "occurredAt": envelope.occurred_at().to_rfc3339(),
        "event": envelope.payload(),
    });
    let json = serde_json::to_string(&data).ok()?;

    Some(
        SseEvent::default()
            .id(envelope.event_id().to_string())
            .event(envelope.payload().topic())
            .data(json),
    )
}
