use serde::{Deserialize, Serialize};

use bulkjobs_core::{JobStatus, JobSummary, JobType, TicketId, UserId};
use bulkjobs_infra::jobs::{JobFilter, JobPage};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    #[serde(default)]
    pub ticket_ids: Vec<TicketId>,
    pub idempotency_key: Option<String>,
}

/// Query string for `GET /jobs`. Numbers that fail to parse fall back to defaults.
#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub status: Option<String>,
    pub page: Option<String>,
    pub limit: Option<String>,
}

impl ListJobsQuery {
    /// Build the store filter; `submitter` scopes non-admin callers.
    pub fn into_filter(self, submitter: Option<UserId>) -> Result<JobFilter, axum::response::Response> {
        let job_type = non_blank(self.job_type)
            .map(|raw| raw.parse::<JobType>())
            .transpose()
            .map_err(|e| errors::json_error(axum::http::StatusCode::BAD_REQUEST, "validation_error", e.to_string()))?;
        let status = non_blank(self.status)
            .map(|raw| raw.parse::<JobStatus>())
            .transpose()
            .map_err(|e| errors::json_error(axum::http::StatusCode::BAD_REQUEST, "validation_error", e.to_string()))?;

        Ok(JobFilter {
            job_type,
            status,
            submitter,
            page: positive(self.page),
            limit: positive(self.limit),
        })
    }
}

fn non_blank(raw: Option<String>) -> Option<String> {
    raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// 0 lets the filter apply its default.
fn positive(raw: Option<String>) -> u32 {
    raw.and_then(|s| s.trim().parse::<u32>().ok()).unwrap_or(0)
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<JobSummary>,
    pub pagination: Pagination,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u64,
}

impl From<JobPage> for ListJobsResponse {
    fn from(page: JobPage) -> Self {
        Self {
            jobs: page.jobs,
            pagination: Pagination {
                page: page.page,
                limit: page.limit,
                total: page.total,
                total_pages: page.total_pages,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_paging_falls_back_to_defaults() {
        let query = ListJobsQuery {
            page: Some("abc".into()),
            limit: Some("0".into()),
            ..Default::default()
        };
        let filter = query.into_filter(None).unwrap();
        assert_eq!((filter.page(), filter.limit()), (1, 10));
    }

    #[test]
    fn unknown_status_is_rejected() {
        let query = ListJobsQuery {
            status: Some("paused".into()),
            ..Default::default()
        };
        assert!(query.into_filter(None).is_err());
    }

    #[test]
    fn create_request_uses_camel_case() {
        let body: CreateJobRequest =
            serde_json::from_value(serde_json::json!({"ticketIds": [1, 2], "idempotencyKey": "k"})).unwrap();
        assert_eq!(body.ticket_ids, vec![TicketId::new(1), TicketId::new(2)]);
        assert_eq!(body.idempotency_key.as_deref(), Some("k"));
    }
}
