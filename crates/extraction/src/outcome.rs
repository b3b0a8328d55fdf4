use std::time::Duration;

use serde_json::Value as JsonValue;

use crate::error::ExtractionError;

/// How one extraction attempt ended.
///
/// Retry decisions are driven by this value, never by unwinding.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionOutcome {
    Success { payload: JsonValue, elapsed: Duration },
    /// Worth another attempt if the job has attempts left.
    RetryableFailure(ExtractionError),
    /// Another attempt would fail the same way.
    TerminalFailure(ExtractionError),
}

impl ExtractionOutcome {
    pub fn from_result(result: Result<JsonValue, ExtractionError>, elapsed: Duration) -> Self {
        match result {
            Ok(payload) => ExtractionOutcome::Success { payload, elapsed },
            Err(e) if e.is_retryable() => ExtractionOutcome::RetryableFailure(e),
            Err(e) => ExtractionOutcome::TerminalFailure(e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExtractionOutcome::Success { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors_by_retryability() {
        let elapsed = Duration::from_millis(5);

        assert!(ExtractionOutcome::from_result(Ok(serde_json::json!({})), elapsed).is_success());
        assert!(matches!(
            ExtractionOutcome::from_result(Err(ExtractionError::Parse("bad table".into())), elapsed),
            ExtractionOutcome::RetryableFailure(ExtractionError::Parse(_))
        ));
        assert!(matches!(
            ExtractionOutcome::from_result(Err(ExtractionError::Timeout(elapsed)), elapsed),
            ExtractionOutcome::RetryableFailure(_)
        ));
        assert!(matches!(
            ExtractionOutcome::from_result(Err(ExtractionError::Unsupported("pdf".into())), elapsed),
            ExtractionOutcome::TerminalFailure(_)
        ));
    }
}
