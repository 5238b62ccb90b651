//! Worker-side event sink that forwards lifecycle events to the API process.
//!
//! The worker has no real-time transport of its own: it posts each event to
//! the API's internal routes, which resolve the submitter and push.

use std::time::Duration;

use tracing::{debug, warn};

use bulkjobs_events::{EventSink, JobEvent};

/// Header carrying the shared secret for internal routes.
pub const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("event {0} has no internal route")]
    Unroutable(&'static str),
    #[error("relay request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("relay rejected with status {0}")]
    Rejected(u16),
}

/// Internal route path for an event, if the worker relays it.
pub fn internal_path(event: &JobEvent) -> Option<&'static str> {
    match event {
        JobEvent::Progress { .. } => Some("/internal/jobs/progress"),
        JobEvent::Item { .. } => Some("/internal/jobs/item"),
        JobEvent::Completed { .. } => Some("/internal/jobs/completed"),
        JobEvent::Failed { .. } => Some("/internal/jobs/failed"),
        JobEvent::Created { .. } => None,
    }
}

/// Blocking HTTP relay; emit from worker threads, not from async tasks.
#[derive(Debug, Clone)]
pub struct HttpEventRelay {
    client: reqwest::blocking::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpEventRelay {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, RelayError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn send(&self, event: &JobEvent) -> Result<(), RelayError> {
        let path = internal_path(event).ok_or(RelayError::Unroutable(event.topic()))?;

        let mut request = self.client.post(format!("{}{path}", self.base_url)).json(event);
        if let Some(token) = &self.token {
            request = request.header(INTERNAL_TOKEN_HEADER, token);
        }

        let response = request.send()?;
        if !response.status().is_success() {
            return Err(RelayError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

impl EventSink for HttpEventRelay {
    fn emit(&self, event: JobEvent) {
        match self.send(&event) {
            Ok(()) => debug!(job_id = %event.job_id(), topic = event.topic(), "event relayed"),
            Err(RelayError::Unroutable(topic)) => debug!(topic, "event not relayed"),
            Err(err) => warn!(job_id = %event.job_id(), topic = event.topic(), error = %err, "event relay failed"),
        }
    }
}
