use axum::{routing::get, Router};

pub mod event_stream;
pub mod internal;
pub mod jobs;
pub mod system;

/// Router for all authenticated endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .route("/stream", get(event_stream::stream_events))
        .nest("/jobs", jobs::router())
}
