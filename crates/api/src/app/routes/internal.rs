//! Worker-to-API bridge: the worker posts lifecycle events keyed by job id;
//! the submitter is resolved here and the event fanned out to subscribers.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, OriginalUri},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};

use bulkjobs_events::JobEvent;
use bulkjobs_infra::relay::internal_path;

use super::jobs::blocking;
use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/jobs/progress", post(relay_event))
        .route("/jobs/item", post(relay_event))
        .route("/jobs/completed", post(relay_event))
        .route("/jobs/failed", post(relay_event))
}

/// POST /internal/jobs/{progress,item,completed,failed}
///
/// The body is the event itself; its kind must match the route.
pub async fn relay_event(
    Extension(services): Extension<Arc<AppServices>>,
    OriginalUri(uri): OriginalUri,
    body: Result<Json<JobEvent>, JsonRejection>,
) -> axum::response::Response {
    let Json(event) = match body {
        Ok(body) => body,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.body_text()),
    };

    if internal_path(&event) != Some(uri.path()) {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            format!("{} events are not accepted on {}", event.topic(), uri.path()),
        );
    }

    match blocking(move || services.router().route(event)).await {
        Ok(()) => Json(serde_json::json!({ "success": true })).into_response(),
        Err(resp) => resp,
    }
}
