//! Periodic sweep: create jobs for pending filings and recover stalled ones.

use std::io;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use secx_broker::Broker;
use secx_core::{FailureKind, Job, JobFailure, JobStatus};

use crate::filings::{FilingSource, FilingSourceError};
use crate::jobs::{JobStore, JobStoreError, TransitionFields};

/// Stalled jobs examined per pass.
const STALL_BATCH: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("filing source error: {0}")]
    Source(#[from] FilingSourceError),

    #[error("job store error: {0}")]
    Store(#[from] JobStoreError),
}

/// Counters for one scheduler pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepReport {
    /// Filings returned by the filing source
    pub discovered: usize,
    /// Jobs created and enqueued
    pub created: usize,
    /// Filings that already had an active job
    pub duplicates: usize,
    /// Job rows that could not be created
    pub create_failures: usize,
    /// Jobs created (or recovered) whose message could not be published
    pub enqueue_failures: usize,
    /// Stalled jobs put back on the queue
    pub recovered: usize,
    /// Stalled `RUNNING` jobs failed for good (no attempts left)
    pub failed_stalled: usize,
}

/// Lifetime counters for a spawned scheduler.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SchedulerStats {
    pub passes: u64,
    pub failed_passes: u64,
    pub last_report: Option<SweepReport>,
}

/// Decides which filings need jobs and makes sure every active job has a
/// message on the way.
pub struct Scheduler<S, B, F> {
    store: S,
    broker: B,
    source: F,
    max_attempts: u32,
    stall_timeout: Duration,
}

impl<S, B, F> Scheduler<S, B, F>
where
    S: JobStore,
    B: Broker,
    F: FilingSource,
{
    pub fn new(store: S, broker: B, source: F, max_attempts: u32, stall_timeout: Duration) -> Self {
        Self {
            store,
            broker,
            source,
            max_attempts,
            stall_timeout,
        }
    }

    /// One sweep. Per-filing failures are counted, not returned; only a
    /// failure to list filings or stalled jobs fails the pass.
    pub fn run_once(&self) -> Result<SweepReport, SchedulerError> {
        let mut report = SweepReport::default();

        let filings = self.source.list_pending_filings()?;
        report.discovered = filings.len();

        for filing in filings {
            match self.store.create(&filing, self.max_attempts) {
                Ok(job) => {
                    if let Err(e) = self.broker.enqueue(job.id, Duration::ZERO) {
                        // The stall sweep republishes it once it ages out.
                        warn!(job_id = %job.id, filing_ref = %filing, error = %e, "failed to enqueue scheduled job");
                        report.enqueue_failures += 1;
                    } else {
                        debug!(job_id = %job.id, filing_ref = %filing, "scheduled extraction");
                        report.created += 1;
                    }
                }
                Err(JobStoreError::DuplicateActiveJob { .. }) => {
                    debug!(filing_ref = %filing, "filing already has an active job");
                    report.duplicates += 1;
                }
                Err(e) => {
                    error!(filing_ref = %filing, error = %e, "failed to create job");
                    report.create_failures += 1;
                }
            }
        }

        self.recover_stalled(&mut report)?;

        info!(
            discovered = report.discovered,
            created = report.created,
            duplicates = report.duplicates,
            recovered = report.recovered,
            failed_stalled = report.failed_stalled,
            "scheduler pass finished"
        );
        Ok(report)
    }

    /// Re-drive non-terminal jobs that have not moved for `stall_timeout`.
    ///
    /// - `PENDING`/`RETRYING`: the message was lost; touch and republish
    /// - `RUNNING`: the worker died mid-attempt; the attempt counts, so the
    ///   job retries if it can and fails otherwise
    fn recover_stalled(&self, report: &mut SweepReport) -> Result<(), SchedulerError> {
        let cutoff = chrono::Duration::from_std(self.stall_timeout)
            .ok()
            .and_then(|stall| Utc::now().checked_sub_signed(stall))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        for job in self.store.list_stalled(cutoff, STALL_BATCH)? {
            let recovered = match job.status {
                JobStatus::Pending | JobStatus::Retrying => self.store.touch(job.id, job.status),
                JobStatus::Running => self.release_running(&job),
                JobStatus::Done | JobStatus::Failed => continue,
            };

            match recovered {
                Ok(updated) if updated.status == JobStatus::Failed => {
                    warn!(job_id = %job.id, filing_ref = %job.filing_ref, "stalled job out of attempts; failed");
                    report.failed_stalled += 1;
                }
                Ok(updated) => {
                    if let Err(e) = self.broker.enqueue(updated.id, Duration::ZERO) {
                        warn!(job_id = %job.id, error = %e, "failed to republish stalled job");
                        report.enqueue_failures += 1;
                    } else {
                        warn!(job_id = %job.id, filing_ref = %job.filing_ref, status = %job.status, "republished stalled job");
                        report.recovered += 1;
                    }
                }
                // Someone else moved it meanwhile; it is not stalled after all.
                Err(JobStoreError::StaleTransition { .. }) => {}
                Err(e) => error!(job_id = %job.id, error = %e, "failed to recover stalled job"),
            }
        }
        Ok(())
    }

    fn release_running(&self, job: &Job) -> Result<Job, JobStoreError> {
        let failure = JobFailure::new(
            FailureKind::Stalled,
            format!("no progress for {:?}", self.stall_timeout),
            job.attempt_count,
        );
        let next = if job.has_attempts_left() {
            JobStatus::Retrying
        } else {
            JobStatus::Failed
        };
        self.store
            .transition(job.id, &[JobStatus::Running], next, TransitionFields::failure(failure))
    }
}

impl<S, B, F> Scheduler<S, B, F>
where
    S: JobStore + 'static,
    B: Broker + 'static,
    F: FilingSource + 'static,
{
    /// Run a pass now and then every `interval` on a background thread.
    pub fn spawn(self, interval: Duration) -> io::Result<SchedulerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(SchedulerStats::default()));
        let thread_stats = stats.clone();

        let join = thread::Builder::new()
            .name("secx-scheduler".to_string())
            .spawn(move || scheduler_loop(self, interval, shutdown_rx, thread_stats))?;

        Ok(SchedulerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn scheduler_loop<S, B, F>(
    scheduler: Scheduler<S, B, F>,
    interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<SchedulerStats>>,
) where
    S: JobStore,
    B: Broker,
    F: FilingSource,
{
    info!(interval = ?interval, "scheduler started");

    loop {
        let outcome = scheduler.run_once();
        if let Ok(mut s) = stats.lock() {
            s.passes += 1;
            match outcome {
                Ok(report) => s.last_report = Some(report),
                Err(ref e) => {
                    s.failed_passes += 1;
                    error!(error = %e, "scheduler pass failed");
                }
            }
        }

        match shutdown_rx.recv_timeout(interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
    }

    info!("scheduler stopped");
}

/// Handle to control a running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl SchedulerHandle {
    /// Request shutdown and wait for the current pass to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}
