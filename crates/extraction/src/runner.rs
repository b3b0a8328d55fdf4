//! Bounded-time extractor invocation.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use secx_core::FilingRef;

use crate::error::ExtractionError;
use crate::extractor::Extractor;
use crate::outcome::ExtractionOutcome;

/// Default cap on extractor threads alive at once, abandoned ones included.
pub const DEFAULT_MAX_LIVE_CALLS: usize = 32;

/// Runs an extractor on its own thread and waits at most `timeout` for it.
///
/// A timed-out call is abandoned, not interrupted: its thread keeps running
/// until the extractor returns, and its result is dropped. At most
/// `max_live_calls` such threads exist at once; past that, calls fail fast
/// with [`ExtractionError::Unavailable`] until some of them finish.
pub struct ExtractionRunner {
    extractor: Arc<dyn Extractor>,
    timeout: Duration,
    max_live_calls: usize,
    live_calls: Arc<AtomicUsize>,
}

impl ExtractionRunner {
    pub fn new<E: Extractor>(extractor: E, timeout: Duration) -> Self {
        Self::from_arc(Arc::new(extractor), timeout)
    }

    pub fn from_arc(extractor: Arc<dyn Extractor>, timeout: Duration) -> Self {
        Self {
            extractor,
            timeout,
            max_live_calls: DEFAULT_MAX_LIVE_CALLS,
            live_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_max_live_calls(mut self, max_live_calls: usize) -> Self {
        self.max_live_calls = max_live_calls.max(1);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Extractor threads currently running, including abandoned ones.
    pub fn live_calls(&self) -> usize {
        self.live_calls.load(Ordering::Acquire)
    }

    pub fn run(&self, filing: &FilingRef) -> ExtractionOutcome {
        let started = Instant::now();
        let result = self.call(filing);
        ExtractionOutcome::from_result(result, started.elapsed())
    }

    fn call(&self, filing: &FilingRef) -> Result<serde_json::Value, ExtractionError> {
        let Some(slot) = LiveCall::acquire(&self.live_calls, self.max_live_calls) else {
            warn!(
                filing_ref = %filing,
                live_calls = self.max_live_calls,
                "extractor saturated by unfinished calls"
            );
            return Err(ExtractionError::Unavailable(format!(
                "{} extractor calls still running",
                self.max_live_calls
            )));
        };

        let (tx, rx) = mpsc::channel();
        let extractor = self.extractor.clone();
        let target = filing.clone();

        thread::Builder::new()
            .name("secx-extract".to_string())
            .spawn(move || {
                let _slot = slot;
                let result = panic::catch_unwind(AssertUnwindSafe(|| extractor.extract(&target)))
                    .unwrap_or_else(|cause| {
                        Err(ExtractionError::Parse(format!(
                            "extractor panicked: {}",
                            panic_message(cause.as_ref())
                        )))
                    });
                // The receiver is gone if the caller already timed out.
                let _ = tx.send(result);
            })
            .map_err(|e| ExtractionError::Unavailable(format!("failed to spawn extractor thread: {e}")))?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(filing_ref = %filing, timeout = ?self.timeout, "extraction timed out; abandoning call");
                Err(ExtractionError::Timeout(self.timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                debug!(filing_ref = %filing, "extractor thread exited without a result");
                Err(ExtractionError::Unavailable(
                    "extractor thread exited without a result".to_string(),
                ))
            }
        }
    }
}

/// One counted extractor thread; released when the thread ends.
struct LiveCall(Arc<AtomicUsize>);

impl LiveCall {
    fn acquire(counter: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| (live < max).then_some(live + 1))
            .ok()
            .map(|_| LiveCall(counter.clone()))
    }
}

impl Drop for LiveCall {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::extractor_fn;
    use serde_json::json;

    fn filing() -> FilingRef {
        FilingRef::new("10-K-001").unwrap()
    }

    #[test]
    fn successful_extraction_reports_payload() {
        let runner = ExtractionRunner::new(
            extractor_fn(|f| Ok(json!({ "filing": f.as_str(), "tables": 3 }))),
            Duration::from_secs(1),
        );

        match runner.run(&filing()) {
            ExtractionOutcome::Success { payload, .. } => {
                assert_eq!(payload["filing"], "10-K-001");
                assert_eq!(payload["tables"], 3);
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn slow_extractor_times_out_as_retryable() {
        let runner = ExtractionRunner::new(
            extractor_fn(|_| {
                thread::sleep(Duration::from_millis(500));
                Ok(json!({}))
            }),
            Duration::from_millis(30),
        );

        let started = Instant::now();
        let outcome = runner.run(&filing());

        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(matches!(
            outcome,
            ExtractionOutcome::RetryableFailure(ExtractionError::Timeout(_))
        ));
    }

    #[test]
    fn abandoned_calls_are_capped() {
        let released = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let started = Arc::new(AtomicUsize::new(0));
        let (gate, count) = (released.clone(), started.clone());
        let runner = ExtractionRunner::new(
            extractor_fn(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                while !gate.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(json!({ "ok": true }))
            }),
            Duration::from_millis(20),
        )
        .with_max_live_calls(2);

        for _ in 0..2 {
            assert!(matches!(
                runner.run(&filing()),
                ExtractionOutcome::RetryableFailure(ExtractionError::Timeout(_))
            ));
        }
        assert_eq!(runner.live_calls(), 2);

        // Saturated: no new thread, no extractor call.
        assert!(matches!(
            runner.run(&filing()),
            ExtractionOutcome::RetryableFailure(ExtractionError::Unavailable(_))
        ));
        assert_eq!(started.load(Ordering::SeqCst), 2);

        released.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(5);
        while runner.live_calls() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(runner.live_calls(), 0);

        assert!(matches!(runner.run(&filing()), ExtractionOutcome::Success { .. }));
    }

    #[test]
    fn panicking_extractor_is_captured_as_parse_error() {
        let runner = ExtractionRunner::new(
            extractor_fn(|_| panic!("malformed xbrl context")),
            Duration::from_secs(1),
        );

        match runner.run(&filing()) {
            ExtractionOutcome::RetryableFailure(ExtractionError::Parse(msg)) => {
                assert!(msg.contains("malformed xbrl context"));
            }
            other => panic!("expected parse failure, got {other:?}"),
        }
    }

    #[test]
    fn unsupported_is_terminal() {
        let runner = ExtractionRunner::new(
            extractor_fn(|_| Err(ExtractionError::Unsupported("pdf".into()))),
            Duration::from_secs(1),
        );

        assert!(matches!(
            runner.run(&filing()),
            ExtractionOutcome::TerminalFailure(ExtractionError::Unsupported(_))
        ));
    }
}
