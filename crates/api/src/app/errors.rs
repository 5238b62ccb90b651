use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use bulkjobs_auth::AuthzError;
use bulkjobs_infra::JobError;

pub fn job_error_to_response(err: JobError) -> axum::response::Response {
    match err {
        JobError::InvalidRequest(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        JobError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", "Job not found"),
        // Rejected state changes are client errors, not conflicts on the wire.
        JobError::Conflict(msg) => json_error(StatusCode::BAD_REQUEST, "conflict", msg),
        JobError::Storage(msg) => {
            error!(error = %msg, "storage failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", "Internal server error")
        }
        JobError::Processor(e) => {
            error!(error = %e, "processor failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "processor_error", "Internal server error")
        }
    }
}

pub fn authz_error_to_response(err: AuthzError) -> axum::response::Response {
    json_error(StatusCode::FORBIDDEN, "forbidden", err.to_string())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
