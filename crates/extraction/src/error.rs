use std::time::Duration;

use thiserror::Error;

use secx_core::FailureKind;

/// Typed failure of an extraction attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("extractor unavailable: {0}")]
    Unavailable(String),

    #[error("extraction timed out after {0:?}")]
    Timeout(Duration),

    /// No extractor handles this filing; retrying cannot help.
    #[error("unsupported filing: {0}")]
    Unsupported(String),
}

impl ExtractionError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExtractionError::Unsupported(_))
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ExtractionError::Parse(_) => FailureKind::Parse,
            ExtractionError::Unavailable(_) => FailureKind::Unavailable,
            ExtractionError::Timeout(_) => FailureKind::Timeout,
            ExtractionError::Unsupported(_) => FailureKind::Unsupported,
        }
    }
}
