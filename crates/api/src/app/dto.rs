use serde::{Deserialize, Serialize};

use secx_core::{ExtractionResult, FilingRef, Job};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct BatchSubmitRequest {
    pub filing_refs: Vec<String>,
}

// -------------------------
// Response DTOs
// -------------------------

/// Body of `GET /filings/:filing_ref/jobs`.
#[derive(Debug, Serialize)]
pub struct JobHistoryResponse {
    pub filing_ref: FilingRef,
    pub jobs: Vec<Job>,
}

/// Body of `GET /filings/:filing_ref/result`.
///
/// `job` is the filing's latest job; it may be newer than the job that
/// produced `result` while a rerun is in flight.
#[derive(Debug, Serialize)]
pub struct FilingResultResponse {
    pub filing_ref: FilingRef,
    pub result: ExtractionResult,
    pub job: Option<Job>,
}
