//! Filing catalogue backed by the `filings` table.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::runtime::Handle;
use tracing::{instrument, warn};

use secx_core::FilingRef;

use super::{FilingSource, FilingSourceError};

const DEFAULT_BATCH_LIMIT: i64 = 500;

/// Catalogue entry for a filing. The file type is derived from the reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilingMetadata {
    pub filing_ref: FilingRef,
    pub company_name: Option<String>,
    /// SEC Central Index Key of the filer
    pub cik: Option<String>,
    /// e.g. `10-K`, `10-Q`, `8-K`
    pub form_type: Option<String>,
    pub filing_date: Option<NaiveDate>,
}

impl FilingMetadata {
    pub fn new(filing_ref: FilingRef) -> Self {
        Self {
            filing_ref,
            company_name: None,
            cik: None,
            form_type: None,
            filing_date: None,
        }
    }
}

/// Lists catalogued filings that have neither a stored result nor an active job.
///
/// Uses the tables created by [`crate::jobs::migrate`].
#[derive(Debug, Clone)]
pub struct PostgresFilingSource {
    pool: PgPool,
    runtime: Handle,
    limit: i64,
}

impl PostgresFilingSource {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool,
            runtime,
            limit: DEFAULT_BATCH_LIMIT,
        }
    }

    /// Cap on filings returned per sweep (oldest first).
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        self
    }

    /// Add a filing to the catalogue. Re-registering is a no-op.
    #[instrument(skip(self, metadata), fields(filing_ref = %metadata.filing_ref), err)]
    pub async fn register_filing(&self, metadata: &FilingMetadata) -> Result<(), FilingSourceError> {
        sqlx::query(
            r#"
            INSERT INTO filings (filing_ref, file_type, company_name, cik, form_type, filing_date)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (filing_ref) DO NOTHING
            "#,
        )
        .bind(metadata.filing_ref.as_str())
        .bind(metadata.filing_ref.kind().as_str())
        .bind(metadata.company_name.as_deref())
        .bind(metadata.cik.as_deref())
        .bind(metadata.form_type.as_deref())
        .bind(metadata.filing_date)
        .execute(&self.pool)
        .await
        .map_err(|e| FilingSourceError::Unavailable(format!("register_filing: {e}")))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_pending_filings(&self) -> Result<Vec<FilingRef>, FilingSourceError> {
        let refs: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT f.filing_ref
            FROM filings f
            WHERE NOT EXISTS (
                SELECT 1 FROM extraction_results r WHERE r.filing_ref = f.filing_ref
            )
            AND NOT EXISTS (
                SELECT 1 FROM extraction_jobs j
                WHERE j.filing_ref = f.filing_ref
                  AND j.status IN ('pending', 'running', 'retrying')
            )
            ORDER BY f.created_at ASC, f.filing_ref ASC
            LIMIT $1
            "#,
        )
        .bind(self.limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| FilingSourceError::Unavailable(format!("list_pending_filings: {e}")))?;

        // A row that fails validation is skipped rather than blocking the sweep.
        Ok(refs
            .into_iter()
            .filter_map(|value| match FilingRef::new(value.clone()) {
                Ok(filing) => Some(filing),
                Err(e) => {
                    warn!(filing_ref = %value, error = %e, "skipping invalid catalogued filing");
                    None
                }
            })
            .collect())
    }
}

impl FilingSource for PostgresFilingSource {
    fn list_pending_filings(&self) -> Result<Vec<FilingRef>, FilingSourceError> {
        self.runtime.block_on(self.fetch_pending_filings())
    }
}

#[cfg(test)]
mod tests {
    //! Require a live Postgres; run with
    //! `SECX_TEST_DATABASE_URL=... cargo test -p secx-infra -- --ignored`.

    use super::*;
    use crate::jobs::{JobStore, PostgresJobStore, TransitionFields};
    use secx_core::JobStatus;
    use serde_json::json;

    #[test]
    #[ignore]
    fn pending_excludes_filings_with_active_jobs_or_results() {
        let Ok(url) = std::env::var("SECX_TEST_DATABASE_URL") else { return };
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let pool = runtime.block_on(PgPool::connect(&url)).unwrap();
        runtime.block_on(crate::jobs::migrate(&pool)).unwrap();

        let store = PostgresJobStore::new(pool.clone(), runtime.handle().clone());
        let source = PostgresFilingSource::new(pool, runtime.handle().clone()).with_limit(usize::MAX);

        let filing = FilingRef::new(format!("{}.xml", uuid::Uuid::now_v7())).unwrap();
        let metadata = FilingMetadata {
            company_name: Some("Apple Inc.".into()),
            cik: Some("0000320193".into()),
            form_type: Some("10-K".into()),
            filing_date: NaiveDate::from_ymd_opt(2023, 11, 3),
            ..FilingMetadata::new(filing.clone())
        };
        runtime.block_on(source.register_filing(&metadata)).unwrap();
        runtime.block_on(source.register_filing(&metadata)).unwrap();
        assert!(source.list_pending_filings().unwrap().contains(&filing));

        let job = store.create(&filing, 3).unwrap();
        assert!(!source.list_pending_filings().unwrap().contains(&filing));

        store
            .transition(job.id, &JobStatus::CLAIMABLE, JobStatus::Running, TransitionFields::claim())
            .unwrap();
        store.write_result(job.id, json!({ "revenue": 1 }), 5).unwrap();
        assert!(!source.list_pending_filings().unwrap().contains(&filing));
    }
}
