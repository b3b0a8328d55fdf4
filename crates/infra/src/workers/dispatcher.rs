//! Per-message state machine: lease → claim → extract → settle.
//!
//! Decisions are taken from a fresh read of the job or from the outcome of a
//! compare-and-swap transition, so any number of dispatchers may share one
//! store and broker. The one piece of local state is the set of parked
//! settlements: outcomes of claimed attempts whose store write kept failing.
//! A redelivery of such a job settles the parked outcome instead of
//! discarding the message, so the attempt is neither lost nor counted twice.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use secx_broker::{Broker, BrokerError, Delivery};
use secx_core::{JobFailure, JobId, JobStatus, RetryPolicy};
use secx_extraction::{ExtractionOutcome, ExtractionRunner};

use crate::jobs::{JobStore, JobStoreError, TransitionFields};

const DEFAULT_INFRA_RETRY_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_SETTLE_ATTEMPTS: u32 = 4;
const MAX_SETTLE_BACKOFF: Duration = Duration::from_secs(10);
const MAX_PARKED_SETTLEMENTS: usize = 1024;

/// Why a delivery was acked without running anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// The message references a job the store does not know.
    UnknownJob,
    /// Duplicate delivery for a job that already finished.
    AlreadyTerminal(JobStatus),
    /// Another worker won the claim.
    ClaimedElsewhere(JobStatus),
    /// The job has no attempts left to claim.
    AttemptsExhausted,
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Result stored, job `DONE`, message acked.
    Completed,
    /// Attempt failed; job `RETRYING`, message nacked with backoff.
    Retrying { delay: Duration },
    /// Attempt failed for good; job `FAILED`, message acked.
    Failed,
    /// Message acked without running the extractor.
    Discarded(DiscardReason),
    /// Store failure; message nacked without settling the job.
    Requeued { delay: Duration },
}

/// Failure to obtain work from the broker.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("lease failed: {0}")]
    Lease(#[from] BrokerError),
}

/// Store write that ends a claimed attempt.
#[derive(Debug, Clone)]
enum Settlement {
    Complete { payload: JsonValue, duration_ms: u64 },
    Retry(JobFailure),
    Fail(JobFailure),
}

impl Settlement {
    fn step(&self) -> &'static str {
        match self {
            Settlement::Complete { .. } => "write result",
            Settlement::Retry(_) => "mark retrying",
            Settlement::Fail(_) => "mark failed",
        }
    }
}

#[derive(Debug)]
struct ParkedSettlement {
    attempt: u32,
    settlement: Settlement,
}

/// Runs leased messages through the job lifecycle.
pub struct Dispatcher<S, B> {
    store: S,
    broker: B,
    runner: ExtractionRunner,
    retry: RetryPolicy,
    infra_retry_delay: Duration,
    settle_attempts: u32,
    parked: Mutex<HashMap<JobId, ParkedSettlement>>,
}

impl<S, B> Dispatcher<S, B>
where
    S: JobStore,
    B: Broker,
{
    pub fn new(store: S, broker: B, runner: ExtractionRunner, retry: RetryPolicy) -> Self {
        Self {
            store,
            broker,
            runner,
            retry,
            infra_retry_delay: DEFAULT_INFRA_RETRY_DELAY,
            settle_attempts: DEFAULT_SETTLE_ATTEMPTS,
            parked: Mutex::new(HashMap::new()),
        }
    }

    /// Requeue delay used when the store or broker fails mid-settlement.
    ///
    /// Also the first pause between in-place settlement retries.
    pub fn with_infra_retry_delay(mut self, delay: Duration) -> Self {
        self.infra_retry_delay = delay;
        self
    }

    /// How many times a settlement write is tried before the message is
    /// requeued and the outcome parked.
    pub fn with_settle_attempts(mut self, attempts: u32) -> Self {
        self.settle_attempts = attempts.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Lease one message (waiting up to `lease_timeout`) and handle it.
    ///
    /// `Ok(None)` means nothing arrived in time.
    pub fn process_next(&self, lease_timeout: Duration) -> Result<Option<Disposition>, DispatchError> {
        match self.broker.lease(lease_timeout)? {
            Some(delivery) => Ok(Some(self.handle(&delivery))),
            None => Ok(None),
        }
    }

    /// Drive one delivery to a disposition.
    ///
    /// Never fails: extractor failures are recorded on the job, and store or
    /// broker failures end in a requeue (or, for ack/nack, in the broker's own
    /// redelivery).
    pub fn handle(&self, delivery: &Delivery) -> Disposition {
        let job_id = delivery.job_id;

        let job = match self.store.get(job_id) {
            Ok(job) => job,
            Err(JobStoreError::NotFound(_)) => {
                self.unpark(job_id);
                warn!(job_id = %job_id, message_id = %delivery.message_id, "message for unknown job; discarding");
                return self.discard(delivery, DiscardReason::UnknownJob);
            }
            Err(e) => return self.requeue(delivery, "load job", &e),
        };

        if let Some(parked) = self.unpark(job_id) {
            if job.status == JobStatus::Running && job.attempt_count == parked.attempt {
                info!(job_id = %job_id, attempt = parked.attempt, "resuming parked settlement");
                return self.settle(delivery, job_id, parked.attempt, parked.settlement);
            }
            debug!(
                job_id = %job_id,
                status = %job.status,
                parked_attempt = parked.attempt,
                attempt = job.attempt_count,
                "job moved on; dropping parked settlement"
            );
        }

        if job.is_terminal() {
            debug!(job_id = %job_id, status = %job.status, "duplicate delivery for finished job");
            return self.discard(delivery, DiscardReason::AlreadyTerminal(job.status));
        }

        let job = match self.store.transition(
            job_id,
            &JobStatus::CLAIMABLE,
            JobStatus::Running,
            TransitionFields::claim(),
        ) {
            Ok(job) => job,
            Err(JobStoreError::StaleTransition { actual, .. }) => {
                debug!(job_id = %job_id, status = %actual, "job claimed elsewhere");
                let reason = if actual.is_terminal() {
                    DiscardReason::AlreadyTerminal(actual)
                } else {
                    DiscardReason::ClaimedElsewhere(actual)
                };
                return self.discard(delivery, reason);
            }
            Err(JobStoreError::AttemptsExhausted { max_attempts, .. }) => {
                error!(job_id = %job_id, max_attempts, "claimable job has no attempts left");
                return self.discard(delivery, DiscardReason::AttemptsExhausted);
            }
            Err(JobStoreError::NotFound(_)) => return self.discard(delivery, DiscardReason::UnknownJob),
            Err(e) => return self.requeue(delivery, "claim job", &e),
        };

        let attempt = job.attempt_count;
        info!(
            job_id = %job_id,
            filing_ref = %job.filing_ref,
            attempt,
            max_attempts = job.max_attempts,
            "extraction started"
        );

        let settlement = match self.runner.run(&job.filing_ref) {
            ExtractionOutcome::Success { payload, elapsed } => Settlement::Complete {
                payload,
                duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            },
            ExtractionOutcome::RetryableFailure(err) if job.has_attempts_left() => {
                Settlement::Retry(JobFailure::new(err.failure_kind(), err.to_string(), attempt))
            }
            ExtractionOutcome::RetryableFailure(err) | ExtractionOutcome::TerminalFailure(err) => {
                Settlement::Fail(JobFailure::new(err.failure_kind(), err.to_string(), attempt))
            }
        };

        self.settle(delivery, job_id, attempt, settlement)
    }

    /// Write the outcome of a claimed attempt, retrying transient store
    /// failures in place. If the store stays down the outcome is parked and
    /// the message requeued; the redelivery picks the outcome back up.
    fn settle(&self, delivery: &Delivery, job_id: JobId, attempt: u32, settlement: Settlement) -> Disposition {
        let mut pause = self.infra_retry_delay;
        let mut tries = 1;
        loop {
            match self.apply(delivery, job_id, attempt, &settlement) {
                Ok(disposition) => return disposition,
                Err(e) if e.is_transient() && tries < self.settle_attempts => {
                    warn!(job_id = %job_id, step = settlement.step(), tries, error = %e, "settlement failed; retrying");
                    thread::sleep(pause);
                    pause = pause.saturating_mul(2).min(MAX_SETTLE_BACKOFF);
                    tries += 1;
                }
                Err(e) => {
                    let step = settlement.step();
                    if e.is_transient() {
                        self.park(job_id, attempt, settlement);
                    }
                    return self.requeue(delivery, step, &e);
                }
            }
        }
    }

    fn apply(
        &self,
        delivery: &Delivery,
        job_id: JobId,
        attempt: u32,
        settlement: &Settlement,
    ) -> Result<Disposition, JobStoreError> {
        let settled = match settlement {
            Settlement::Complete { payload, duration_ms } => {
                self.store.write_result(job_id, payload.clone(), *duration_ms).map(|(job, _)| {
                    info!(job_id = %job_id, filing_ref = %job.filing_ref, attempt, duration_ms, "extraction completed");
                    self.ack(delivery);
                    Disposition::Completed
                })
            }
            Settlement::Retry(failure) => self
                .store
                .transition(
                    job_id,
                    &[JobStatus::Running],
                    JobStatus::Retrying,
                    TransitionFields::failure(failure.clone()),
                )
                .map(|_| {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(job_id = %job_id, attempt, error = %failure.message, delay = ?delay, "extraction failed; retrying");
                    if let Err(e) = self.broker.nack(delivery, delay) {
                        error!(job_id = %job_id, error = %e, "nack failed; relying on redelivery");
                    }
                    Disposition::Retrying { delay }
                }),
            Settlement::Fail(failure) => self
                .store
                .transition(
                    job_id,
                    &[JobStatus::Running],
                    JobStatus::Failed,
                    TransitionFields::failure(failure.clone()),
                )
                .map(|_| {
                    error!(job_id = %job_id, attempt, error = %failure.message, "extraction failed permanently");
                    self.ack(delivery);
                    Disposition::Failed
                }),
        };

        match settled {
            Err(JobStoreError::StaleTransition { actual, .. }) => {
                warn!(job_id = %job_id, status = %actual, step = settlement.step(), "job moved on during extraction; dropping outcome");
                Ok(self.discard(delivery, DiscardReason::ClaimedElsewhere(actual)))
            }
            Err(JobStoreError::NotFound(_)) => Ok(self.discard(delivery, DiscardReason::UnknownJob)),
            other => other,
        }
    }

    fn parked(&self) -> MutexGuard<'_, HashMap<JobId, ParkedSettlement>> {
        self.parked.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn park(&self, job_id: JobId, attempt: u32, settlement: Settlement) {
        let mut parked = self.parked();
        if parked.len() >= MAX_PARKED_SETTLEMENTS && !parked.contains_key(&job_id) {
            error!(job_id = %job_id, attempt, "too many parked settlements; leaving job to the stall sweep");
            return;
        }
        parked.insert(job_id, ParkedSettlement { attempt, settlement });
    }

    fn unpark(&self, job_id: JobId) -> Option<ParkedSettlement> {
        self.parked().remove(&job_id)
    }

    fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.broker.ack(delivery) {
            error!(job_id = %delivery.job_id, message_id = %delivery.message_id, error = %e, "ack failed; message may be redelivered");
        }
    }

    fn discard(&self, delivery: &Delivery, reason: DiscardReason) -> Disposition {
        self.ack(delivery);
        Disposition::Discarded(reason)
    }

    /// Hand the message back without touching `attempt_count`; the redelivery
    /// re-reads the job and decides again.
    fn requeue(&self, delivery: &Delivery, step: &str, err: &JobStoreError) -> Disposition {
        let delay = self.infra_retry_delay;
        error!(job_id = %delivery.job_id, step, error = %err, delay = ?delay, "store failure; requeueing message");
        if let Err(e) = self.broker.nack(delivery, delay) {
            error!(job_id = %delivery.job_id, error = %e, "nack failed; relying on redelivery");
        }
        Disposition::Requeued { delay }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use secx_broker::InMemoryBroker;
    use chrono::{DateTime, Utc};
    use secx_core::{ExtractionResult, FailureKind, FilingRef, Job};
    use secx_extraction::{extractor_fn, ExtractionError};
    use serde_json::json;

    use crate::jobs::{InMemoryJobStore, JobStats};

    const LEASE: Duration = Duration::from_millis(50);

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(40))
    }

    fn dispatcher<F>(f: F) -> Dispatcher<Arc<InMemoryJobStore>, Arc<InMemoryBroker>>
    where
        F: Fn(&FilingRef) -> Result<serde_json::Value, ExtractionError> + Send + Sync + 'static,
    {
        Dispatcher::new(
            InMemoryJobStore::arc(),
            Arc::new(InMemoryBroker::new()),
            ExtractionRunner::new(extractor_fn(f), Duration::from_secs(2)),
            policy(),
        )
        .with_infra_retry_delay(Duration::ZERO)
    }

    /// Operations [`FlakyStore`] can be told to fail.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Op {
        Get,
        Claim,
        WriteResult,
        MarkRetrying,
        MarkFailed,
    }

    /// In-memory store whose chosen operations fail with a storage error a
    /// set number of times before going through.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryJobStore,
        faults: std::sync::Mutex<std::collections::HashMap<Op, u32>>,
    }

    impl FlakyStore {
        fn fail(&self, op: Op, times: u32) {
            self.faults.lock().unwrap().insert(op, times);
        }

        fn check(&self, op: Op) -> Result<(), JobStoreError> {
            let mut faults = self.faults.lock().unwrap();
            match faults.get_mut(&op) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    Err(JobStoreError::Storage(format!("{op:?}: connection reset")))
                }
                _ => Ok(()),
            }
        }
    }

    impl JobStore for FlakyStore {
        fn create(&self, filing_ref: &FilingRef, max_attempts: u32) -> Result<Job, JobStoreError> {
            self.inner.create(filing_ref, max_attempts)
        }

        fn get(&self, job_id: JobId) -> Result<Job, JobStoreError> {
            self.check(Op::Get)?;
            self.inner.get(job_id)
        }

        fn get_by_filing(&self, filing_ref: &FilingRef) -> Result<Option<Job>, JobStoreError> {
            self.inner.get_by_filing(filing_ref)
        }

        fn list_by_filing(&self, filing_ref: &FilingRef) -> Result<Vec<Job>, JobStoreError> {
            self.inner.list_by_filing(filing_ref)
        }

        fn transition(
            &self,
            job_id: JobId,
            expected: &[JobStatus],
            new_status: JobStatus,
            fields: TransitionFields,
        ) -> Result<Job, JobStoreError> {
            match new_status {
                JobStatus::Running => self.check(Op::Claim)?,
                JobStatus::Retrying => self.check(Op::MarkRetrying)?,
                JobStatus::Failed => self.check(Op::MarkFailed)?,
                _ => {}
            }
            self.inner.transition(job_id, expected, new_status, fields)
        }

        fn write_result(
            &self,
            job_id: JobId,
            payload: serde_json::Value,
            duration_ms: u64,
        ) -> Result<(Job, ExtractionResult), JobStoreError> {
            self.check(Op::WriteResult)?;
            self.inner.write_result(job_id, payload, duration_ms)
        }

        fn touch(&self, job_id: JobId, expected: JobStatus) -> Result<Job, JobStoreError> {
            self.inner.touch(job_id, expected)
        }

        fn result_for_job(&self, job_id: JobId) -> Result<Option<ExtractionResult>, JobStoreError> {
            self.inner.result_for_job(job_id)
        }

        fn latest_result(&self, filing_ref: &FilingRef) -> Result<Option<ExtractionResult>, JobStoreError> {
            self.inner.latest_result(filing_ref)
        }

        fn list_stalled(&self, older_than: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
            self.inner.list_stalled(older_than, limit)
        }

        fn stats(&self) -> Result<JobStats, JobStoreError> {
            self.inner.stats()
        }
    }

    /// Dispatcher over a [`FlakyStore`], counting extractor calls.
    fn flaky_dispatcher<F>(
        f: F,
        settle_attempts: u32,
    ) -> (Dispatcher<Arc<FlakyStore>, Arc<InMemoryBroker>>, Arc<AtomicU32>)
    where
        F: Fn(&FilingRef) -> Result<serde_json::Value, ExtractionError> + Send + Sync + 'static,
    {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let d = Dispatcher::new(
            Arc::new(FlakyStore::default()),
            Arc::new(InMemoryBroker::new()),
            ExtractionRunner::new(
                extractor_fn(move |filing| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    f(filing)
                }),
                Duration::from_secs(2),
            ),
            policy(),
        )
        .with_infra_retry_delay(Duration::ZERO)
        .with_settle_attempts(settle_attempts);
        (d, calls)
    }

    fn submit<S: JobStore, B: Broker>(d: &Dispatcher<S, B>, filing: &str, max_attempts: u32) -> JobId {
        let job = d.store().create(&FilingRef::new(filing).unwrap(), max_attempts).unwrap();
        d.broker().enqueue(job.id, Duration::ZERO).unwrap();
        job.id
    }

    #[test]
    fn success_stores_result_and_acks() {
        let d = dispatcher(|f| Ok(json!({ "filing": f.as_str() })));
        let job_id = submit(&d, "10-K-001", 3);

        assert_eq!(d.process_next(LEASE).unwrap(), Some(Disposition::Completed));

        let job = d.store().get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.attempt_count, 1);
        let result = d.store().result_for_job(job_id).unwrap().unwrap();
        assert_eq!(result.payload, json!({ "filing": "10-K-001" }));
        assert_eq!(d.broker().in_flight_len(), 0);
        assert_eq!(d.broker().queued_len(), 0);
    }

    #[test]
    fn retryable_failure_marks_retrying_and_backs_off() {
        let d = dispatcher(|_| Err(ExtractionError::Unavailable("parser down".into())));
        let job_id = submit(&d, "10-K-001", 3);

        let disposition = d.process_next(LEASE).unwrap().unwrap();
        assert_eq!(disposition, Disposition::Retrying { delay: Duration::from_millis(20) });

        let job = d.store().get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Retrying);
        let error = job.last_error.unwrap();
        assert_eq!(error.kind, FailureKind::Unavailable);
        assert_eq!(error.attempt, 1);

        // Requeued with a delay, not immediately.
        assert_eq!(d.broker().queued_len(), 1);
        assert_eq!(d.broker().in_flight_len(), 0);
    }

    #[test]
    fn last_attempt_failure_is_terminal() {
        let d = dispatcher(|_| Err(ExtractionError::Parse("garbled".into())));
        let job_id = submit(&d, "10-K-001", 1);

        assert_eq!(d.process_next(LEASE).unwrap(), Some(Disposition::Failed));

        let job = d.store().get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 1);
        assert!(d.store().result_for_job(job_id).unwrap().is_none());
        assert_eq!(d.broker().queued_len(), 0);
    }

    #[test]
    fn unsupported_filing_fails_without_retrying() {
        let d = dispatcher(|_| Err(ExtractionError::Unsupported("pdf".into())));
        let job_id = submit(&d, "annual-report.pdf", 3);

        assert_eq!(d.process_next(LEASE).unwrap(), Some(Disposition::Failed));

        let job = d.store().get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.last_error.unwrap().kind, FailureKind::Unsupported);
    }

    #[test]
    fn timeout_counts_as_an_attempt() {
        let d = Dispatcher::new(
            InMemoryJobStore::arc(),
            Arc::new(InMemoryBroker::new()),
            ExtractionRunner::new(
                extractor_fn(|_| {
                    std::thread::sleep(Duration::from_millis(300));
                    Ok(json!({}))
                }),
                Duration::from_millis(20),
            ),
            policy(),
        );
        let job_id = submit(&d, "10-K-001", 2);

        assert!(matches!(d.process_next(LEASE).unwrap(), Some(Disposition::Retrying { .. })));

        let job = d.store().get(job_id).unwrap();
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.last_error.unwrap().kind, FailureKind::Timeout);
    }

    #[test]
    fn duplicate_delivery_for_finished_job_is_acked() {
        let d = dispatcher(|_| Ok(json!({})));
        let job_id = submit(&d, "10-K-001", 3);
        d.process_next(LEASE).unwrap();

        // A stale copy of the message arrives after completion.
        d.broker().enqueue(job_id, Duration::ZERO).unwrap();
        let before = d.store().get(job_id).unwrap();

        assert_eq!(
            d.process_next(LEASE).unwrap(),
            Some(Disposition::Discarded(DiscardReason::AlreadyTerminal(JobStatus::Done)))
        );
        assert_eq!(d.store().get(job_id).unwrap(), before);
        assert_eq!(d.broker().in_flight_len(), 0);
    }

    #[test]
    fn message_for_running_job_is_discarded() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let d = dispatcher(
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!({}))
            },
        );
        let job_id = submit(&d, "10-K-001", 3);
        d.store()
            .transition(job_id, &JobStatus::CLAIMABLE, JobStatus::Running, TransitionFields::claim())
            .unwrap();

        assert_eq!(
            d.process_next(LEASE).unwrap(),
            Some(Disposition::Discarded(DiscardReason::ClaimedElsewhere(JobStatus::Running)))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(d.store().get(job_id).unwrap().attempt_count, 1);
    }

    #[test]
    fn unknown_job_is_discarded() {
        let d = dispatcher(|_| Ok(json!({})));
        d.broker().enqueue(JobId::new(), Duration::ZERO).unwrap();

        assert_eq!(
            d.process_next(LEASE).unwrap(),
            Some(Disposition::Discarded(DiscardReason::UnknownJob))
        );
    }

    #[test]
    fn empty_queue_yields_none() {
        let d = dispatcher(|_| Ok(json!({})));
        assert_eq!(d.process_next(LEASE).unwrap(), None);
    }

    #[test]
    fn load_failure_requeues_without_spending_an_attempt() {
        let (d, calls) = flaky_dispatcher(|_| Ok(json!({})), 1);
        let job_id = submit(&d, "10-K-001", 1);
        d.store().fail(Op::Get, 1);

        assert_eq!(
            d.process_next(LEASE).unwrap(),
            Some(Disposition::Requeued { delay: Duration::ZERO })
        );
        let job = d.store().get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(d.process_next(LEASE).unwrap(), Some(Disposition::Completed));
        assert_eq!(d.store().get(job_id).unwrap().attempt_count, 1);
    }

    #[test]
    fn claim_failure_leaves_job_claimable() {
        let (d, calls) = flaky_dispatcher(|_| Ok(json!({})), 1);
        let job_id = submit(&d, "10-K-001", 1);
        d.store().fail(Op::Claim, 1);

        assert_eq!(
            d.process_next(LEASE).unwrap(),
            Some(Disposition::Requeued { delay: Duration::ZERO })
        );
        let job = d.store().get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(d.process_next(LEASE).unwrap(), Some(Disposition::Completed));
        let job = d.store().get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.attempt_count, 1);
    }

    #[test]
    fn brief_write_failure_is_retried_in_place() {
        let (d, calls) = flaky_dispatcher(|_| Ok(json!({ "facts": 7 })), 4);
        let job_id = submit(&d, "10-K-001", 1);
        d.store().fail(Op::WriteResult, 2);

        assert_eq!(d.process_next(LEASE).unwrap(), Some(Disposition::Completed));

        let job = d.store().get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(d.store().result_for_job(job_id).unwrap().unwrap().payload, json!({ "facts": 7 }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(d.broker().queued_len(), 0);
        assert_eq!(d.broker().in_flight_len(), 0);
    }

    #[test]
    fn result_write_outage_completes_on_redelivery() {
        let (d, calls) = flaky_dispatcher(|_| Ok(json!({ "facts": 7 })), 1);
        let job_id = submit(&d, "10-K-001", 1);
        d.store().fail(Op::WriteResult, 1);

        assert_eq!(
            d.process_next(LEASE).unwrap(),
            Some(Disposition::Requeued { delay: Duration::ZERO })
        );
        let job = d.store().get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempt_count, 1);

        // The redelivery writes the outcome already in hand.
        assert_eq!(d.process_next(LEASE).unwrap(), Some(Disposition::Completed));
        assert_eq!(d.process_next(LEASE).unwrap(), None);

        let job = d.store().get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.attempt_count, 1);
        assert!(d.store().result_for_job(job_id).unwrap().is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(d.broker().queued_len(), 0);
    }

    #[test]
    fn mark_retrying_outage_keeps_the_same_attempt() {
        let (d, calls) = flaky_dispatcher(|_| Err(ExtractionError::Unavailable("parser down".into())), 1);
        let job_id = submit(&d, "10-K-001", 3);
        d.store().fail(Op::MarkRetrying, 1);

        assert_eq!(
            d.process_next(LEASE).unwrap(),
            Some(Disposition::Requeued { delay: Duration::ZERO })
        );
        assert_eq!(
            d.process_next(LEASE).unwrap(),
            Some(Disposition::Retrying { delay: Duration::from_millis(20) })
        );

        let job = d.store().get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.last_error.unwrap().attempt, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn mark_failed_outage_settles_on_redelivery() {
        let (d, calls) = flaky_dispatcher(|_| Err(ExtractionError::Parse("garbled".into())), 1);
        let job_id = submit(&d, "10-K-001", 1);
        d.store().fail(Op::MarkFailed, 1);

        assert_eq!(
            d.process_next(LEASE).unwrap(),
            Some(Disposition::Requeued { delay: Duration::ZERO })
        );
        assert_eq!(d.process_next(LEASE).unwrap(), Some(Disposition::Failed));

        let job = d.store().get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.last_error.unwrap().kind, FailureKind::Parse);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(d.broker().queued_len(), 0);
    }

    #[test]
    fn parked_outcome_is_dropped_once_the_job_is_released() {
        let (d, calls) = flaky_dispatcher(|_| Ok(json!({})), 1);
        let job_id = submit(&d, "10-K-001", 3);
        d.store().fail(Op::WriteResult, 1);

        assert!(matches!(d.process_next(LEASE).unwrap(), Some(Disposition::Requeued { .. })));

        // The stall sweep hands the job back before the redelivery arrives.
        d.store()
            .transition(job_id, &[JobStatus::Running], JobStatus::Retrying, TransitionFields::default())
            .unwrap();

        assert_eq!(d.process_next(LEASE).unwrap(), Some(Disposition::Completed));
        let job = d.store().get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.attempt_count, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
