//! Durable output of a successful extraction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::filing::FilingRef;
use crate::id::JobId;

/// Structured extraction output owned by exactly one `DONE` job.
///
/// Immutable once written: a correction is a new job with a new result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub job_id: JobId,
    /// Denormalized from the owning job for lookups by filing.
    pub filing_ref: FilingRef,
    /// Extractor-defined payload; opaque to the pipeline.
    pub payload: JsonValue,
    /// Wall time the successful attempt spent in the extractor.
    pub duration_ms: u64,
    pub extracted_at: DateTime<Utc>,
}

impl ExtractionResult {
    pub fn new(job_id: JobId, filing_ref: FilingRef, payload: JsonValue, duration_ms: u64) -> Self {
        Self {
            job_id,
            filing_ref,
            payload,
            duration_ms,
            extracted_at: Utc::now(),
        }
    }
}
