//! Filing catalogue: where the scheduler learns which filings still need work.

pub mod postgres;

use std::sync::{Arc, Mutex};

use secx_core::FilingRef;

pub use postgres::{FilingMetadata, PostgresFilingSource};

/// Failure to list filings.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FilingSourceError {
    #[error("filing source unavailable: {0}")]
    Unavailable(String),
}

/// Supplier of filings that have no result and no active job.
pub trait FilingSource: Send + Sync {
    fn list_pending_filings(&self) -> Result<Vec<FilingRef>, FilingSourceError>;
}

impl<F> FilingSource for Arc<F>
where
    F: FilingSource + ?Sized,
{
    fn list_pending_filings(&self) -> Result<Vec<FilingRef>, FilingSourceError> {
        (**self).list_pending_filings()
    }
}

/// Fixed list of filings, for tests/dev.
///
/// The list is returned as-is on every call; deduplicating against existing
/// jobs is left to the job store.
#[derive(Debug, Default)]
pub struct StaticFilingSource {
    filings: Mutex<Vec<FilingRef>>,
}

impl StaticFilingSource {
    pub fn new(filings: impl IntoIterator<Item = FilingRef>) -> Self {
        Self {
            filings: Mutex::new(filings.into_iter().collect()),
        }
    }

    pub fn push(&self, filing: FilingRef) {
        if let Ok(mut filings) = self.filings.lock() {
            filings.push(filing);
        }
    }

    /// Drop `filing` from the list, e.g. once it has a result.
    pub fn remove(&self, filing: &FilingRef) {
        if let Ok(mut filings) = self.filings.lock() {
            filings.retain(|f| f != filing);
        }
    }
}

impl FilingSource for StaticFilingSource {
    fn list_pending_filings(&self) -> Result<Vec<FilingRef>, FilingSourceError> {
        self.filings
            .lock()
            .map(|filings| filings.clone())
            .map_err(|_| FilingSourceError::Unavailable("filing list lock poisoned".into()))
    }
}
