use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use bulkjobs_auth::{authorize_submit, authorize_view};
use bulkjobs_core::JobId;
use bulkjobs_infra::JobError;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_job).get(list_jobs))
        .route("/:id", get(get_job))
        .route("/:id/cancel", post(cancel_job))
}

/// POST /jobs
///
/// 201 with the new job, or 200 with the existing one when the idempotency
/// key was seen before for this submitter.
pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    body: Result<Json<dto::CreateJobRequest>, JsonRejection>,
) -> axum::response::Response {
    if let Err(e) = authorize_submit(principal.actor()) {
        return errors::authz_error_to_response(e);
    }

    let Json(body) = match body {
        Ok(body) => body,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.body_text()),
    };

    let submitter = principal.user_id();
    let submission = match blocking(move || {
        services
            .submissions()
            .submit(submitter, body.ticket_ids, body.idempotency_key)
    })
    .await
    {
        Ok(s) => s,
        Err(resp) => return resp,
    };

    let status = if submission.created { StatusCode::CREATED } else { StatusCode::OK };
    (status, Json(submission.job.summary())).into_response()
}

/// GET /jobs?type=&status=&page=&limit=
///
/// Non-admins only ever see their own jobs.
pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let scope = (!principal.is_admin()).then(|| principal.user_id());
    let filter = match query.into_filter(scope) {
        Ok(f) => f,
        Err(resp) => return resp,
    };

    match blocking(move || services.submissions().list(&filter)).await {
        Ok(page) => Json(dto::ListJobsResponse::from(page)).into_response(),
        Err(resp) => resp,
    }
}

/// GET /jobs/:id
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let detail = match blocking(move || services.submissions().get(job_id)).await {
        Ok(d) => d,
        Err(resp) => return resp,
    };

    if let Err(e) = authorize_view(principal.actor(), detail.job.submitter) {
        return errors::authz_error_to_response(e);
    }

    Json(detail).into_response()
}

/// POST /jobs/:id/cancel
pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let lookup = services.clone();
    let job = match blocking(move || lookup.submissions().job(job_id)).await {
        Ok(job) => job,
        Err(resp) => return resp,
    };

    if let Err(e) = authorize_view(principal.actor(), job.submitter) {
        return errors::authz_error_to_response(e);
    }

    match blocking(move || services.submissions().cancel(job_id)).await {
        Ok(job) => Json(job.summary()).into_response(),
        Err(resp) => resp,
    }
}

fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"))
}

/// Run a synchronous pipeline call off the async executor.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, axum::response::Response>
where
    F: FnOnce() -> Result<T, JobError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(errors::job_error_to_response(e)),
        Err(e) => {
            tracing::error!(error = %e, "blocking task failed");
            Err(errors::json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal server error",
            ))
        }
    }
}
