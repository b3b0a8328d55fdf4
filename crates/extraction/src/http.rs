//! Extractor backed by an out-of-process parsing service.
//!
//! `POST {endpoint}` with `{"filing_ref": "...", "kind": "xbrl"}`; a 2xx JSON
//! body is the payload. Status codes map onto [`ExtractionError`]:
//!
//! | status | error |
//! |---|---|
//! | 400, 422 | `Parse` |
//! | 415, 501 | `Unsupported` |
//! | anything else | `Unavailable` |
//!
//! Transport timeouts map to `Timeout`; other transport errors to `Unavailable`.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use secx_core::{FilingKind, FilingRef};

use crate::error::ExtractionError;
use crate::extractor::Extractor;

/// Longest error body kept in an error message.
const MAX_ERROR_BODY: usize = 500;

#[derive(Debug, Serialize)]
struct ExtractRequest<'a> {
    filing_ref: &'a str,
    kind: FilingKind,
}

#[derive(Debug, Clone)]
pub struct HttpExtractor {
    client: reqwest::blocking::Client,
    endpoint: String,
    request_timeout: Duration,
}

impl HttpExtractor {
    /// Build a client for `endpoint`.
    ///
    /// Must not be called from inside an async runtime (the blocking client
    /// owns its own runtime).
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Result<Self, ExtractionError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ExtractionError::Unavailable(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            request_timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn transport_error(&self, err: reqwest::Error) -> ExtractionError {
        if err.is_timeout() {
            ExtractionError::Timeout(self.request_timeout)
        } else {
            ExtractionError::Unavailable(err.to_string())
        }
    }
}

impl Extractor for HttpExtractor {
    fn extract(&self, filing: &FilingRef) -> Result<JsonValue, ExtractionError> {
        let request = ExtractRequest {
            filing_ref: filing.as_str(),
            kind: filing.kind(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        debug!(filing_ref = %filing, status = status.as_u16(), "extractor responded");

        if status.is_success() {
            return response
                .json::<JsonValue>()
                .map_err(|e| ExtractionError::Parse(format!("invalid extractor response body: {e}")));
        }

        let body = response.text().unwrap_or_default();
        Err(classify_status(status.as_u16(), &body))
    }
}

/// Map a non-success status code to an extraction error.
pub fn classify_status(status: u16, body: &str) -> ExtractionError {
    let detail = if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{status}: {}…", &body[..end])
    } else if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };

    match status {
        400 | 422 => ExtractionError::Parse(detail),
        415 | 501 => ExtractionError::Unsupported(detail),
        _ => ExtractionError::Unavailable(detail),
    }
}
