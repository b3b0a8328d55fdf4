//! Job store contract and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use secx_core::{ExtractionResult, FilingRef, Job, JobFailure, JobId, JobStatus};

/// Extra column updates applied by a status transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionFields {
    /// Count this transition as a dispatch attempt
    pub increment_attempt: bool,
    /// Replace `last_error`; `None` keeps the stored value
    pub last_error: Option<JobFailure>,
}

impl TransitionFields {
    /// Fields for a worker claiming a job.
    pub fn claim() -> Self {
        Self {
            increment_attempt: true,
            last_error: None,
        }
    }

    /// Fields recording a failed attempt.
    pub fn failure(error: JobFailure) -> Self {
        Self {
            increment_attempt: false,
            last_error: Some(error),
        }
    }
}

/// Job store abstraction.
///
/// Every mutation is a single-row atomic operation (plus the result row for
/// `write_result`). No cross-job locking is needed: uniqueness is per filing.
pub trait JobStore: Send + Sync {
    /// Insert a `PENDING` job for `filing_ref`.
    ///
    /// Fails with `DuplicateActiveJob` if the filing already has a
    /// non-terminal job.
    fn create(&self, filing_ref: &FilingRef, max_attempts: u32) -> Result<Job, JobStoreError>;

    fn get(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    /// Most recent job for a filing, terminal or not.
    fn get_by_filing(&self, filing_ref: &FilingRef) -> Result<Option<Job>, JobStoreError>;

    /// Every job for a filing, newest first.
    fn list_by_filing(&self, filing_ref: &FilingRef) -> Result<Vec<Job>, JobStoreError>;

    /// Compare-and-swap status change.
    ///
    /// Succeeds only if the stored status is one of `expected`; otherwise
    /// `StaleTransition`. `DONE` is reachable only through `write_result`.
    fn transition(
        &self,
        job_id: JobId,
        expected: &[JobStatus],
        new_status: JobStatus,
        fields: TransitionFields,
    ) -> Result<Job, JobStoreError>;

    /// Atomically move a `RUNNING` job to `DONE` and store its result.
    ///
    /// Both happen or neither does.
    fn write_result(
        &self,
        job_id: JobId,
        payload: JsonValue,
        duration_ms: u64,
    ) -> Result<(Job, ExtractionResult), JobStoreError>;

    /// Refresh `updated_at` if the job is still in `expected`.
    fn touch(&self, job_id: JobId, expected: JobStatus) -> Result<Job, JobStoreError>;

    fn result_for_job(&self, job_id: JobId) -> Result<Option<ExtractionResult>, JobStoreError>;

    /// Newest result for a filing.
    fn latest_result(&self, filing_ref: &FilingRef) -> Result<Option<ExtractionResult>, JobStoreError>;

    /// Non-terminal jobs whose `updated_at` is older than `older_than`, oldest first.
    fn list_stalled(&self, older_than: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("filing {filing_ref} already has an active job")]
    DuplicateActiveJob {
        filing_ref: FilingRef,
        existing: Option<JobId>,
    },

    #[error("stale transition for job {job_id}: expected one of {expected:?}, found {actual}")]
    StaleTransition {
        job_id: JobId,
        expected: Vec<JobStatus>,
        actual: JobStatus,
    },

    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },

    #[error("job {0} can only reach done together with its result")]
    ResultRequired(JobId),

    #[error("job {job_id} has used all {max_attempts} attempts")]
    AttemptsExhausted { job_id: JobId, max_attempts: u32 },

    #[error("max_attempts {0} is outside 1..=2147483647")]
    InvalidMaxAttempts(u32),

    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    /// Infrastructure failure worth retrying later (as opposed to a
    /// definitive answer about job state).
    pub fn is_transient(&self) -> bool {
        matches!(self, JobStoreError::Storage(_))
    }
}

/// Attempt budget as stored in the job table's `INTEGER` column.
pub(crate) fn check_max_attempts(max_attempts: u32) -> Result<i32, JobStoreError> {
    match i32::try_from(max_attempts) {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(JobStoreError::InvalidMaxAttempts(max_attempts)),
    }
}

/// Reject transitions that are not edges of the lifecycle graph.
pub(crate) fn check_transition(
    job_id: JobId,
    expected: &[JobStatus],
    new_status: JobStatus,
) -> Result<(), JobStoreError> {
    if new_status == JobStatus::Done {
        return Err(JobStoreError::ResultRequired(job_id));
    }
    if let Some(from) = expected.iter().find(|from| !from.can_transition_to(new_status)) {
        return Err(JobStoreError::IllegalTransition {
            from: *from,
            to: new_status,
        });
    }
    Ok(())
}

/// Job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub retrying: usize,
    pub done: usize,
    pub failed: usize,
    pub results: usize,
}

impl JobStats {
    pub(crate) fn record(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Running => self.running += count,
            JobStatus::Retrying => self.retrying += count,
            JobStatus::Done => self.done += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    pub fn active(&self) -> usize {
        self.pending + self.running + self.retrying
    }
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    /// Filing -> its single non-terminal job
    active: HashMap<FilingRef, JobId>,
    results: HashMap<JobId, ExtractionResult>,
}

impl Inner {
    fn job_mut(&mut self, job_id: JobId) -> Result<&mut Job, JobStoreError> {
        self.jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))
    }
}

/// In-memory job store for tests/dev.
///
/// One `RwLock` around all tables; every operation is atomic with respect to
/// every other.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, JobStoreError> {
        self.inner
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, JobStoreError> {
        self.inner
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))
    }

    /// Overwrite a job's `updated_at`, e.g. to simulate a stalled worker.
    pub fn set_updated_at(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), JobStoreError> {
        let mut inner = self.write()?;
        inner.job_mut(job_id)?.updated_at = at;
        Ok(())
    }
}

fn newest_first(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

impl JobStore for InMemoryJobStore {
    fn create(&self, filing_ref: &FilingRef, max_attempts: u32) -> Result<Job, JobStoreError> {
        check_max_attempts(max_attempts)?;
        let mut inner = self.write()?;

        if let Some(existing) = inner.active.get(filing_ref) {
            return Err(JobStoreError::DuplicateActiveJob {
                filing_ref: filing_ref.clone(),
                existing: Some(*existing),
            });
        }

        let job = Job::new(filing_ref.clone(), max_attempts);
        inner.active.insert(filing_ref.clone(), job.id);
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn get(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        self.read()?
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(JobStoreError::NotFound(job_id))
    }

    fn get_by_filing(&self, filing_ref: &FilingRef) -> Result<Option<Job>, JobStoreError> {
        Ok(self.list_by_filing(filing_ref)?.into_iter().next())
    }

    fn list_by_filing(&self, filing_ref: &FilingRef) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.read()?;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| &j.filing_ref == filing_ref)
            .cloned()
            .collect();
        newest_first(&mut jobs);
        Ok(jobs)
    }

    fn transition(
        &self,
        job_id: JobId,
        expected: &[JobStatus],
        new_status: JobStatus,
        fields: TransitionFields,
    ) -> Result<Job, JobStoreError> {
        check_transition(job_id, expected, new_status)?;

        let mut inner = self.write()?;
        let job = inner.job_mut(job_id)?;

        if !expected.contains(&job.status) {
            return Err(JobStoreError::StaleTransition {
                job_id,
                expected: expected.to_vec(),
                actual: job.status,
            });
        }
        if fields.increment_attempt && !job.has_attempts_left() {
            return Err(JobStoreError::AttemptsExhausted {
                job_id,
                max_attempts: job.max_attempts,
            });
        }

        job.status = new_status;
        if fields.increment_attempt {
            job.attempt_count += 1;
        }
        if let Some(error) = fields.last_error {
            job.last_error = Some(error);
        }
        job.updated_at = Utc::now();

        let job = job.clone();
        if job.is_terminal() {
            inner.active.remove(&job.filing_ref);
        }
        Ok(job)
    }

    fn write_result(
        &self,
        job_id: JobId,
        payload: JsonValue,
        duration_ms: u64,
    ) -> Result<(Job, ExtractionResult), JobStoreError> {
        let mut inner = self.write()?;
        let job = inner.job_mut(job_id)?;

        if job.status != JobStatus::Running {
            return Err(JobStoreError::StaleTransition {
                job_id,
                expected: vec![JobStatus::Running],
                actual: job.status,
            });
        }

        job.status = JobStatus::Done;
        job.updated_at = Utc::now();
        let job = job.clone();

        let result = ExtractionResult::new(job_id, job.filing_ref.clone(), payload, duration_ms);
        inner.results.insert(job_id, result.clone());
        inner.active.remove(&job.filing_ref);

        Ok((job, result))
    }

    fn touch(&self, job_id: JobId, expected: JobStatus) -> Result<Job, JobStoreError> {
        let mut inner = self.write()?;
        let job = inner.job_mut(job_id)?;

        if job.status != expected {
            return Err(JobStoreError::StaleTransition {
                job_id,
                expected: vec![expected],
                actual: job.status,
            });
        }

        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    fn result_for_job(&self, job_id: JobId) -> Result<Option<ExtractionResult>, JobStoreError> {
        Ok(self.read()?.results.get(&job_id).cloned())
    }

    fn latest_result(&self, filing_ref: &FilingRef) -> Result<Option<ExtractionResult>, JobStoreError> {
        let inner = self.read()?;
        Ok(inner
            .results
            .values()
            .filter(|r| &r.filing_ref == filing_ref)
            .max_by(|a, b| a.extracted_at.cmp(&b.extracted_at).then(a.job_id.cmp(&b.job_id)))
            .cloned())
    }

    fn list_stalled(&self, older_than: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.read()?;
        let mut stalled: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status.is_active() && j.updated_at < older_than)
            .cloned()
            .collect();
        stalled.sort_by_key(|j| j.updated_at);
        stalled.truncate(limit);
        Ok(stalled)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let inner = self.read()?;
        let mut stats = JobStats::default();
        for job in inner.jobs.values() {
            stats.record(job.status, 1);
        }
        stats.results = inner.results.len();
        Ok(stats)
    }
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn create(&self, filing_ref: &FilingRef, max_attempts: u32) -> Result<Job, JobStoreError> {
        (**self).create(filing_ref, max_attempts)
    }

    fn get(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        (**self).get(job_id)
    }

    fn get_by_filing(&self, filing_ref: &FilingRef) -> Result<Option<Job>, JobStoreError> {
        (**self).get_by_filing(filing_ref)
    }

    fn list_by_filing(&self, filing_ref: &FilingRef) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_filing(filing_ref)
    }

    fn transition(
        &self,
        job_id: JobId,
        expected: &[JobStatus],
        new_status: JobStatus,
        fields: TransitionFields,
    ) -> Result<Job, JobStoreError> {
        (**self).transition(job_id, expected, new_status, fields)
    }

    fn write_result(
        &self,
        job_id: JobId,
        payload: JsonValue,
        duration_ms: u64,
    ) -> Result<(Job, ExtractionResult), JobStoreError> {
        (**self).write_result(job_id, payload, duration_ms)
    }

    fn touch(&self, job_id: JobId, expected: JobStatus) -> Result<Job, JobStoreError> {
        (**self).touch(job_id, expected)
    }

    fn result_for_job(&self, job_id: JobId) -> Result<Option<ExtractionResult>, JobStoreError> {
        (**self).result_for_job(job_id)
    }

    fn latest_result(&self, filing_ref: &FilingRef) -> Result<Option<ExtractionResult>, JobStoreError> {
        (**self).latest_result(filing_ref)
    }

    fn list_stalled(&self, older_than: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_stalled(older_than, limit)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secx_core::FailureKind;
    use serde_json::json;
    use std::sync::Barrier;
    use std::thread;

    fn filing(s: &str) -> FilingRef {
        FilingRef::new(s).unwrap()
    }

    fn claim(store: &InMemoryJobStore, job_id: JobId) -> Result<Job, JobStoreError> {
        store.transition(job_id, &JobStatus::CLAIMABLE, JobStatus::Running, TransitionFields::claim())
    }

    #[test]
    fn create_and_get() {
        let store = InMemoryJobStore::new();
        let job = store.create(&filing("10-K-001"), 3).unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(store.get(job.id).unwrap(), job);
        assert_eq!(store.get_by_filing(&filing("10-K-001")).unwrap(), Some(job));
        assert!(store.get_by_filing(&filing("10-K-002")).unwrap().is_none());
    }

    #[test]
    fn create_rejects_attempt_budget_outside_column_range() {
        let store = InMemoryJobStore::new();

        assert!(matches!(
            store.create(&filing("10-K-001"), 0),
            Err(JobStoreError::InvalidMaxAttempts(0))
        ));
        assert!(matches!(
            store.create(&filing("10-K-001"), i32::MAX as u32 + 1),
            Err(JobStoreError::InvalidMaxAttempts(_))
        ));
        assert!(store.get_by_filing(&filing("10-K-001")).unwrap().is_none());

        let job = store.create(&filing("10-K-001"), i32::MAX as u32).unwrap();
        assert_eq!(job.max_attempts, i32::MAX as u32);
    }

    #[test]
    fn unknown_job_is_not_found() {
        let store = InMemoryJobStore::new();
        let id = JobId::new();
        assert!(matches!(store.get(id), Err(JobStoreError::NotFound(x)) if x == id));
    }

    #[test]
    fn second_active_job_for_filing_is_rejected() {
        let store = InMemoryJobStore::new();
        let first = store.create(&filing("10-K-001"), 3).unwrap();

        match store.create(&filing("10-K-001"), 3) {
            Err(JobStoreError::DuplicateActiveJob { existing, .. }) => {
                assert_eq!(existing, Some(first.id));
            }
            other => panic!("expected duplicate, got {other:?}"),
        }

        // Other filings are unaffected.
        store.create(&filing("10-K-002"), 3).unwrap();
    }

    #[test]
    fn terminal_job_can_be_superseded() {
        let store = InMemoryJobStore::new();
        let first = store.create(&filing("10-K-001"), 3).unwrap();
        claim(&store, first.id).unwrap();
        store.write_result(first.id, json!({"tables": 1}), 12).unwrap();

        let second = store.create(&filing("10-K-001"), 3).unwrap();
        assert_ne!(second.id, first.id);

        let history = store.list_by_filing(&filing("10-K-001")).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, second.id);
        assert_eq!(history[1].status, JobStatus::Done);
    }

    #[test]
    fn claim_increments_attempt_count() {
        let store = InMemoryJobStore::new();
        let job = store.create(&filing("10-K-001"), 3).unwrap();

        let running = claim(&store, job.id).unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.attempt_count, 1);
        assert!(running.updated_at >= job.updated_at);
    }

    #[test]
    fn stale_expected_status_is_rejected() {
        let store = InMemoryJobStore::new();
        let job = store.create(&filing("10-K-001"), 3).unwrap();
        claim(&store, job.id).unwrap();

        match claim(&store, job.id) {
            Err(JobStoreError::StaleTransition { actual, .. }) => {
                assert_eq!(actual, JobStatus::Running);
            }
            other => panic!("expected stale transition, got {other:?}"),
        }
        assert_eq!(store.get(job.id).unwrap().attempt_count, 1);
    }

    #[test]
    fn illegal_edges_are_rejected_before_touching_state() {
        let store = InMemoryJobStore::new();
        let job = store.create(&filing("10-K-001"), 3).unwrap();

        assert!(matches!(
            store.transition(job.id, &[JobStatus::Pending], JobStatus::Failed, TransitionFields::default()),
            Err(JobStoreError::IllegalTransition { from: JobStatus::Pending, to: JobStatus::Failed })
        ));
        assert!(matches!(
            store.transition(job.id, &[JobStatus::Running], JobStatus::Done, TransitionFields::default()),
            Err(JobStoreError::ResultRequired(_))
        ));
        assert_eq!(store.get(job.id).unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn attempts_are_capped() {
        let store = InMemoryJobStore::new();
        let job = store.create(&filing("10-K-001"), 1).unwrap();
        claim(&store, job.id).unwrap();
        store
            .transition(
                job.id,
                &[JobStatus::Running],
                JobStatus::Retrying,
                TransitionFields::failure(JobFailure::new(FailureKind::Parse, "boom", 1)),
            )
            .unwrap();

        assert!(matches!(
            claim(&store, job.id),
            Err(JobStoreError::AttemptsExhausted { max_attempts: 1, .. })
        ));
        let job = store.get(job.id).unwrap();
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.attempt_count, 1);
    }

    #[test]
    fn failure_records_last_error_and_frees_filing() {
        let store = InMemoryJobStore::new();
        let job = store.create(&filing("10-K-001"), 3).unwrap();
        claim(&store, job.id).unwrap();

        let failed = store
            .transition(
                job.id,
                &[JobStatus::Running],
                JobStatus::Failed,
                TransitionFields::failure(JobFailure::new(FailureKind::Unsupported, "pdf", 1)),
            )
            .unwrap();

        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.last_error.unwrap().kind, FailureKind::Unsupported);
        assert!(store.result_for_job(job.id).unwrap().is_none());
        store.create(&filing("10-K-001"), 3).unwrap();
    }

    #[test]
    fn write_result_requires_running() {
        let store = InMemoryJobStore::new();
        let job = store.create(&filing("10-K-001"), 3).unwrap();

        assert!(matches!(
            store.write_result(job.id, json!({}), 1),
            Err(JobStoreError::StaleTransition { actual: JobStatus::Pending, .. })
        ));
        assert!(store.result_for_job(job.id).unwrap().is_none());
        assert_eq!(store.get(job.id).unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn write_result_marks_done_and_stores_result() {
        let store = InMemoryJobStore::new();
        let job = store.create(&filing("10-K-001"), 3).unwrap();
        claim(&store, job.id).unwrap();

        let (done, result) = store.write_result(job.id, json!({"tables": 4}), 85).unwrap();

        assert_eq!(done.status, JobStatus::Done);
        assert_eq!(result.job_id, job.id);
        assert_eq!(result.duration_ms, 85);
        assert_eq!(store.result_for_job(job.id).unwrap(), Some(result.clone()));
        assert_eq!(store.latest_result(&filing("10-K-001")).unwrap(), Some(result));

        // A second write for the same job is stale.
        assert!(matches!(
            store.write_result(job.id, json!({}), 1),
            Err(JobStoreError::StaleTransition { actual: JobStatus::Done, .. })
        ));
    }

    #[test]
    fn touch_is_guarded_by_status() {
        let store = InMemoryJobStore::new();
        let job = store.create(&filing("10-K-001"), 3).unwrap();

        store.touch(job.id, JobStatus::Pending).unwrap();
        assert!(matches!(
            store.touch(job.id, JobStatus::Running),
            Err(JobStoreError::StaleTransition { .. })
        ));
    }

    #[test]
    fn stalled_lists_only_old_active_jobs() {
        let store = InMemoryJobStore::new();
        let old = store.create(&filing("10-K-001"), 3).unwrap();
        let fresh = store.create(&filing("10-K-002"), 3).unwrap();
        let done = store.create(&filing("10-K-003"), 3).unwrap();
        claim(&store, done.id).unwrap();
        store.write_result(done.id, json!({}), 1).unwrap();

        let long_ago = Utc::now() - chrono::Duration::hours(3);
        store.set_updated_at(old.id, long_ago).unwrap();
        store.set_updated_at(done.id, long_ago).unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(1);
        let stalled = store.list_stalled(cutoff, 10).unwrap();

        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].id, old.id);
        assert!(stalled.iter().all(|j| j.id != fresh.id));
    }

    #[test]
    fn stats_tracking() {
        let store = InMemoryJobStore::new();
        for i in 0..5 {
            store.create(&filing(&format!("10-K-{i:03}")), 3).unwrap();
        }
        let first = store.get_by_filing(&filing("10-K-000")).unwrap().unwrap();
        claim(&store, first.id).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.pending, 4);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.active(), 5);
        assert_eq!(stats.results, 0);
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = store.create(&filing("10-K-001"), 3).unwrap();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    store.transition(
                        job.id,
                        &JobStatus::CLAIMABLE,
                        JobStatus::Running,
                        TransitionFields::claim(),
                    )
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        let stale = results
            .iter()
            .filter(|r| matches!(r, Err(JobStoreError::StaleTransition { .. })))
            .count();

        assert_eq!(winners, 1);
        assert_eq!(stale, 7);
        assert_eq!(store.get(job.id).unwrap().attempt_count, 1);
    }
}
