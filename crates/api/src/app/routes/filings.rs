use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use secx_core::FilingRef;

use crate::app::services::{self, AppServices};
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/batch", post(submit_batch))
        .route("/:filing_ref/jobs", post(submit_job).get(job_history))
        .route("/:filing_ref/job", get(current_job))
        .route("/:filing_ref/result", get(filing_result))
}

pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(raw): Path<String>,
) -> axum::response::Response {
    let filing_ref = match errors::parse_filing_ref(&raw) {
        Ok(f) => f,
        Err(resp) => return resp,
    };

    match services::blocking(services, move |s| s.submit(&filing_ref)).await {
        Ok(job) => (StatusCode::CREATED, Json(job)).into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}

pub async fn submit_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::BatchSubmitRequest>,
) -> axum::response::Response {
    let mut filings = Vec::with_capacity(body.filing_refs.len());
    let mut invalid = Vec::new();
    for raw in body.filing_refs {
        match FilingRef::new(raw.as_str()) {
            Ok(f) => filings.push(f),
            Err(_) => invalid.push(raw),
        }
    }
    if !invalid.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({
                "error": "invalid_filing_ref",
                "message": "batch contains invalid filing references",
                "invalid": invalid,
            })),
        )
            .into_response();
    }

    match services::blocking(services, move |s| Ok(s.submit_batch(filings))).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}

pub async fn current_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(raw): Path<String>,
) -> axum::response::Response {
    let filing_ref = match errors::parse_filing_ref(&raw) {
        Ok(f) => f,
        Err(resp) => return resp,
    };

    let lookup = filing_ref.clone();
    match services::blocking(services, move |s| s.status(&lookup)).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => errors::not_found(format!("no job for filing {filing_ref}")),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}

pub async fn filing_result(
    Extension(services): Extension<Arc<AppServices>>,
    Path(raw): Path<String>,
) -> axum::response::Response {
    let filing_ref = match errors::parse_filing_ref(&raw) {
        Ok(f) => f,
        Err(resp) => return resp,
    };

    let lookup = filing_ref.clone();
    let found = services::blocking(services, move |s| {
        let result = s.result(&lookup)?;
        let job = match result {
            Some(_) => s.status(&lookup)?,
            None => None,
        };
        Ok(result.map(|result| (result, job)))
    })
    .await;

    match found {
        Ok(Some((result, job))) => Json(dto::FilingResultResponse {
            filing_ref,
            result,
            job,
        })
        .into_response(),
        Ok(None) => errors::not_found(format!("no result for filing {filing_ref}")),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}

pub async fn job_history(
    Extension(services): Extension<Arc<AppServices>>,
    Path(raw): Path<String>,
) -> axum::response::Response {
    let filing_ref = match errors::parse_filing_ref(&raw) {
        Ok(f) => f,
        Err(resp) => return resp,
    };

    let lookup = filing_ref.clone();
    match services::blocking(services, move |s| s.history(&lookup)).await {
        Ok(jobs) => Json(dto::JobHistoryResponse { filing_ref, jobs }).into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}
