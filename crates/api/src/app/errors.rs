use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use secx_core::FilingRef;
use secx_infra::{CoordinatorError, JobStoreError};

pub fn coordinator_error_to_response(err: CoordinatorError) -> axum::response::Response {
    match err {
        CoordinatorError::DuplicateActiveJob { filing_ref, existing } => (
            StatusCode::CONFLICT,
            axum::Json(json!({
                "error": "duplicate_active_job",
                "message": format!("filing {filing_ref} already has an active job"),
                "existing_job_id": existing.map(|id| id.to_string()),
            })),
        )
            .into_response(),
        CoordinatorError::Store(JobStoreError::NotFound(job_id)) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {job_id} not found"))
        }
        CoordinatorError::Store(e) if e.is_transient() => {
            tracing::error!(error = %e, "job store unavailable");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", e.to_string())
        }
        CoordinatorError::Store(e) => {
            tracing::error!(error = %e, "job store error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
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

pub fn parse_filing_ref(raw: &str) -> Result<FilingRef, axum::response::Response> {
    FilingRef::new(raw).map_err(|e| json_error(StatusCode::UNPROCESSABLE_ENTITY, "invalid_filing_ref", e.to_string()))
}

pub fn not_found(message: impl Into<String>) -> axum::response::Response {
    json_error(StatusCode::NOT_FOUND, "not_found", message)
}
