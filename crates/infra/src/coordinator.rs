//! Public contract used by the web layer: submit jobs, query their state.

use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use secx_broker::Broker;
use secx_core::{ExtractionResult, FilingRef, Job, JobId};

use crate::jobs::{JobStats, JobStore, JobStoreError};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("filing {filing_ref} already has an active job")]
    DuplicateActiveJob {
        filing_ref: FilingRef,
        existing: Option<JobId>,
    },

    #[error("job store error: {0}")]
    Store(JobStoreError),
}

impl From<JobStoreError> for CoordinatorError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::DuplicateActiveJob { filing_ref, existing } => {
                CoordinatorError::DuplicateActiveJob { filing_ref, existing }
            }
            other => CoordinatorError::Store(other),
        }
    }
}

/// One filing from a batch that could not be submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    pub filing_ref: FilingRef,
    pub error: String,
}

/// Outcome of `submit_batch`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub submitted: Vec<Job>,
    /// Filings skipped because they already had an active job
    pub duplicates: Vec<FilingRef>,
    pub failed: Vec<BatchFailure>,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.submitted.len() + self.duplicates.len() + self.failed.len()
    }
}

/// Entry point for on-demand extraction requests.
pub struct JobCoordinator<S, B> {
    store: S,
    broker: B,
    max_attempts: u32,
}

impl<S, B> JobCoordinator<S, B>
where
    S: JobStore,
    B: Broker,
{
    pub fn new(store: S, broker: B, max_attempts: u32) -> Self {
        Self {
            store,
            broker,
            max_attempts,
        }
    }

    /// Create a `PENDING` job for `filing_ref` and publish it.
    ///
    /// A publish failure does not fail the submission: the job row exists
    /// and the scheduler's stall sweep republishes it.
    pub fn submit(&self, filing_ref: &FilingRef) -> Result<Job, CoordinatorError> {
        let job = self.store.create(filing_ref, self.max_attempts)?;

        match self.broker.enqueue(job.id, Duration::ZERO) {
            Ok(()) => info!(job_id = %job.id, filing_ref = %filing_ref, "extraction submitted"),
            Err(e) => warn!(
                job_id = %job.id,
                filing_ref = %filing_ref,
                error = %e,
                "job created but not published; stall sweep will republish"
            ),
        }
        Ok(job)
    }

    /// Submit every filing, collecting per-filing outcomes.
    pub fn submit_batch<I>(&self, filings: I) -> BatchSummary
    where
        I: IntoIterator<Item = FilingRef>,
    {
        let mut summary = BatchSummary::default();
        for filing_ref in filings {
            match self.submit(&filing_ref) {
                Ok(job) => summary.submitted.push(job),
                Err(CoordinatorError::DuplicateActiveJob { .. }) => summary.duplicates.push(filing_ref),
                Err(e) => summary.failed.push(BatchFailure {
                    filing_ref,
                    error: e.to_string(),
                }),
            }
        }

        info!(
            submitted = summary.submitted.len(),
            duplicates = summary.duplicates.len(),
            failed = summary.failed.len(),
            "batch submitted"
        );
        summary
    }

    /// Most recent job for the filing.
    pub fn status(&self, filing_ref: &FilingRef) -> Result<Option<Job>, CoordinatorError> {
        Ok(self.store.get_by_filing(filing_ref)?)
    }

    /// Most recent result for the filing.
    pub fn result(&self, filing_ref: &FilingRef) -> Result<Option<ExtractionResult>, CoordinatorError> {
        Ok(self.store.latest_result(filing_ref)?)
    }

    /// Every job ever created for the filing, newest first.
    pub fn history(&self, filing_ref: &FilingRef) -> Result<Vec<Job>, CoordinatorError> {
        Ok(self.store.list_by_filing(filing_ref)?)
    }

    pub fn job(&self, job_id: JobId) -> Result<Job, CoordinatorError> {
        Ok(self.store.get(job_id)?)
    }

    pub fn stats(&self) -> Result<JobStats, CoordinatorError> {
        Ok(self.store.stats()?)
    }
}
