//! Postgres-backed job store.
//!
//! ## Concurrency
//!
//! Every status change is a single conditional `UPDATE ... WHERE status = ANY($expected)`.
//! Zero affected rows means another writer got there first; a follow-up read
//! tells a stale transition apart from a missing job or an exhausted attempt
//! budget. The one-active-job-per-filing rule is a partial unique index, so
//! concurrent `create` calls race in the database, not in the application.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) on insert | `23505` | `DuplicateActiveJob` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / network / decode | N/A | `Storage` |
//!
//! ## Sync access
//!
//! `JobStore` is synchronous. The store keeps a runtime `Handle` and uses
//! `block_on`, so it must be called from plain threads (workers, scheduler)
//! or from `spawn_blocking`, never from inside an async task.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::{instrument, warn};

use secx_core::{ExtractionResult, FilingRef, Job, JobFailure, JobId, JobStatus};

use super::store::{check_max_attempts, check_transition, JobStats, JobStore, JobStoreError, TransitionFields};

/// Tables and indexes for jobs, results, and the filing catalogue.
///
/// Idempotent; run once at startup.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS filings (
    filing_ref    TEXT PRIMARY KEY CHECK (length(filing_ref) BETWEEN 1 AND 255),
    file_type     TEXT,
    company_name  TEXT,
    cik           TEXT,
    form_type     TEXT,
    filing_date   DATE,
    created_at    TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS extraction_jobs (
    id             UUID PRIMARY KEY,
    filing_ref     TEXT NOT NULL,
    status         TEXT NOT NULL
                   CHECK (status IN ('pending', 'running', 'retrying', 'done', 'failed')),
    attempt_count  INTEGER NOT NULL DEFAULT 0 CHECK (attempt_count >= 0),
    max_attempts   INTEGER NOT NULL CHECK (max_attempts >= 1),
    last_error     JSONB,
    created_at     TIMESTAMPTZ NOT NULL,
    updated_at     TIMESTAMPTZ NOT NULL,
    CHECK (attempt_count <= max_attempts)
);

CREATE UNIQUE INDEX IF NOT EXISTS extraction_jobs_one_active_per_filing
    ON extraction_jobs (filing_ref)
    WHERE status IN ('pending', 'running', 'retrying');

CREATE INDEX IF NOT EXISTS extraction_jobs_by_filing
    ON extraction_jobs (filing_ref, created_at DESC);

CREATE INDEX IF NOT EXISTS extraction_jobs_active_by_updated
    ON extraction_jobs (updated_at)
    WHERE status IN ('pending', 'running', 'retrying');

CREATE TABLE IF NOT EXISTS extraction_results (
    job_id        UUID PRIMARY KEY REFERENCES extraction_jobs (id),
    filing_ref    TEXT NOT NULL,
    payload       JSONB NOT NULL,
    duration_ms   BIGINT NOT NULL CHECK (duration_ms >= 0),
    extracted_at  TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS extraction_results_by_filing
    ON extraction_results (filing_ref, extracted_at DESC);
"#;

const JOB_COLUMNS: &str =
    "id, filing_ref, status, attempt_count, max_attempts, last_error, created_at, updated_at";

const RESULT_COLUMNS: &str = "job_id, filing_ref, payload, duration_ms, extracted_at";

/// Create the pipeline tables if they do not exist.
pub async fn migrate(pool: &PgPool) -> Result<(), JobStoreError> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("migrate", e))?;
    Ok(())
}

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    runtime: Handle,
}

impl PostgresJobStore {
    /// `runtime` drives the pool's IO; sync calls block on it.
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    /// Use the runtime of the calling context.
    pub fn from_current(pool: PgPool) -> Result<Self, JobStoreError> {
        let runtime = Handle::try_current().map_err(|_| {
            JobStoreError::Storage("PostgresJobStore requires a tokio runtime".to_string())
        })?;
        Ok(Self::new(pool, runtime))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        migrate(&self.pool).await
    }

    #[instrument(skip(self), fields(filing_ref = %filing_ref), err)]
    pub async fn create_job(&self, filing_ref: &FilingRef, max_attempts: u32) -> Result<Job, JobStoreError> {
        let max_attempts_column = check_max_attempts(max_attempts)?;
        let job = Job::new(filing_ref.clone(), max_attempts);

        let inserted = sqlx::query(
            r#"
            INSERT INTO extraction_jobs
                (id, filing_ref, status, attempt_count, max_attempts, last_error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, NULL, $6, $7)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.filing_ref.as_str())
        .bind(job.status.as_str())
        .bind(0_i32)
        .bind(max_attempts_column)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(job),
            Err(e) if is_unique_violation(&e) => {
                let existing = self.active_job_id(filing_ref).await.unwrap_or_else(|err| {
                    warn!(error = %err, "failed to look up conflicting active job");
                    None
                });
                Err(JobStoreError::DuplicateActiveJob {
                    filing_ref: filing_ref.clone(),
                    existing,
                })
            }
            Err(e) => Err(map_sqlx_error("create_job", e)),
        }
    }

    async fn active_job_id(&self, filing_ref: &FilingRef) -> Result<Option<JobId>, JobStoreError> {
        let id: Option<uuid::Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM extraction_jobs
            WHERE filing_ref = $1 AND status IN ('pending', 'running', 'retrying')
            "#,
        )
        .bind(filing_ref.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("active_job_id", e))?;

        Ok(id.map(JobId::from_uuid))
    }

    pub async fn fetch_job(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM extraction_jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_job", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(JobStoreError::NotFound(job_id)),
        }
    }

    pub async fn fetch_jobs_for_filing(&self, filing_ref: &FilingRef) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM extraction_jobs WHERE filing_ref = $1 ORDER BY created_at DESC, id DESC"
        ))
        .bind(filing_ref.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_jobs_for_filing", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(
        skip(self, update),
        fields(
            job_id = %job_id,
            to = %new_status,
            increment_attempt = update.increment_attempt
        ),
        err
    )]
    pub async fn transition_job(
        &self,
        job_id: JobId,
        expected: &[JobStatus],
        new_status: JobStatus,
        update: TransitionFields,
    ) -> Result<Job, JobStoreError> {
        check_transition(job_id, expected, new_status)?;

        let expected_names: Vec<&str> = expected.iter().map(JobStatus::as_str).collect();
        let increment: i32 = if update.increment_attempt { 1 } else { 0 };
        let last_error = update
            .last_error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| JobStoreError::Storage(format!("failed to encode last_error: {e}")))?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE extraction_jobs
            SET status = $3,
                attempt_count = attempt_count + $4,
                last_error = COALESCE($5::jsonb, last_error),
                updated_at = now()
            WHERE id = $1
              AND status = ANY($2::text[])
              AND attempt_count + $4 <= max_attempts
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .bind(&expected_names)
        .bind(new_status.as_str())
        .bind(increment)
        .bind(last_error)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition_job", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => {
                let current = self.fetch_job(job_id).await?;
                if !expected.contains(&current.status) {
                    Err(JobStoreError::StaleTransition {
                        job_id,
                        expected: expected.to_vec(),
                        actual: current.status,
                    })
                } else {
                    Err(JobStoreError::AttemptsExhausted {
                        job_id,
                        max_attempts: current.max_attempts,
                    })
                }
            }
        }
    }

    #[instrument(skip(self, payload), fields(job_id = %job_id), err)]
    pub async fn write_job_result(
        &self,
        job_id: JobId,
        payload: JsonValue,
        duration_ms: u64,
    ) -> Result<(Job, ExtractionResult), JobStoreError> {
        let mut tx: Transaction<'_, Postgres> = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_write_result", e))?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE extraction_jobs
            SET status = 'done', updated_at = now()
            WHERE id = $1 AND status = 'running'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("write_result_update", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback_write_result", e))?;
            let current = self.fetch_job(job_id).await?;
            return Err(JobStoreError::StaleTransition {
                job_id,
                expected: vec![JobStatus::Running],
                actual: current.status,
            });
        };
        let job = job_from_row(&row)?;

        let duration = i64::try_from(duration_ms).unwrap_or(i64::MAX);
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO extraction_results (job_id, filing_ref, payload, duration_ms, extracted_at)
            VALUES ($1, $2, $3, $4, now())
            RETURNING {RESULT_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .bind(job.filing_ref.as_str())
        .bind(&payload)
        .bind(duration)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("write_result_insert", e))?;
        let result = result_from_row(&row)?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_write_result", e))?;

        Ok((job, result))
    }

    pub async fn touch_job(&self, job_id: JobId, expected: JobStatus) -> Result<Job, JobStoreError> {
        let row = sqlx::query(&format!(
            "UPDATE extraction_jobs SET updated_at = now() WHERE id = $1 AND status = $2 RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_id.as_uuid())
        .bind(expected.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("touch_job", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => {
                let current = self.fetch_job(job_id).await?;
                Err(JobStoreError::StaleTransition {
                    job_id,
                    expected: vec![expected],
                    actual: current.status,
                })
            }
        }
    }

    pub async fn fetch_result_for_job(&self, job_id: JobId) -> Result<Option<ExtractionResult>, JobStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RESULT_COLUMNS} FROM extraction_results WHERE job_id = $1"
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_result_for_job", e))?;

        row.as_ref().map(result_from_row).transpose()
    }

    pub async fn fetch_latest_result(&self, filing_ref: &FilingRef) -> Result<Option<ExtractionResult>, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {RESULT_COLUMNS} FROM extraction_results
            WHERE filing_ref = $1
            ORDER BY extracted_at DESC, job_id DESC
            LIMIT 1
            "#
        ))
        .bind(filing_ref.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_latest_result", e))?;

        row.as_ref().map(result_from_row).transpose()
    }

    pub async fn fetch_stalled(&self, older_than: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM extraction_jobs
            WHERE status IN ('pending', 'running', 'retrying') AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#
        ))
        .bind(older_than)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_stalled", e))?;

        rows.iter().map(job_from_row).collect()
    }

    pub async fn fetch_stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM extraction_jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(decode_error)?;
            let count: i64 = row.try_get("n").map_err(decode_error)?;
            let status = status
                .parse::<JobStatus>()
                .map_err(|e| JobStoreError::Storage(e.to_string()))?;
            stats.record(status, count as usize);
        }

        let results: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM extraction_results")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_stats", e))?;
        stats.results = results as usize;

        Ok(stats)
    }

    fn block_on<F, T>(&self, fut: F) -> Result<T, JobStoreError>
    where
        F: std::future::Future<Output = Result<T, JobStoreError>>,
    {
        self.runtime.block_on(fut)
    }
}

impl JobStore for PostgresJobStore {
    fn create(&self, filing_ref: &FilingRef, max_attempts: u32) -> Result<Job, JobStoreError> {
        self.block_on(self.create_job(filing_ref, max_attempts))
    }

    fn get(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        self.block_on(self.fetch_job(job_id))
    }

    fn get_by_filing(&self, filing_ref: &FilingRef) -> Result<Option<Job>, JobStoreError> {
        Ok(self
            .block_on(self.fetch_jobs_for_filing(filing_ref))?
            .into_iter()
            .next())
    }

    fn list_by_filing(&self, filing_ref: &FilingRef) -> Result<Vec<Job>, JobStoreError> {
        self.block_on(self.fetch_jobs_for_filing(filing_ref))
    }

    fn transition(
        &self,
        job_id: JobId,
        expected: &[JobStatus],
        new_status: JobStatus,
        fields: TransitionFields,
    ) -> Result<Job, JobStoreError> {
        self.block_on(self.transition_job(job_id, expected, new_status, fields))
    }

    fn write_result(
        &self,
        job_id: JobId,
        payload: JsonValue,
        duration_ms: u64,
    ) -> Result<(Job, ExtractionResult), JobStoreError> {
        self.block_on(self.write_job_result(job_id, payload, duration_ms))
    }

    fn touch(&self, job_id: JobId, expected: JobStatus) -> Result<Job, JobStoreError> {
        self.block_on(self.touch_job(job_id, expected))
    }

    fn result_for_job(&self, job_id: JobId) -> Result<Option<ExtractionResult>, JobStoreError> {
        self.block_on(self.fetch_result_for_job(job_id))
    }

    fn latest_result(&self, filing_ref: &FilingRef) -> Result<Option<ExtractionResult>, JobStoreError> {
        self.block_on(self.fetch_latest_result(filing_ref))
    }

    fn list_stalled(&self, older_than: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.block_on(self.fetch_stalled(older_than, limit))
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.block_on(self.fetch_stats())
    }
}

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    filing_ref: String,
    status: String,
    attempt_count: i32,
    max_attempts: i32,
    last_error: Option<JsonValue>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            filing_ref: row.try_get("filing_ref")?,
            status: row.try_get("status")?,
            attempt_count: row.try_get("attempt_count")?,
            max_attempts: row.try_get("max_attempts")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |what: &str, e: &dyn std::fmt::Display| {
            JobStoreError::Storage(format!("corrupt job row {}: {what}: {e}", row.id))
        };

        let filing_ref = FilingRef::new(row.filing_ref.clone()).map_err(|e| corrupt("filing_ref", &e))?;
        let status = row.status.parse::<JobStatus>().map_err(|e| corrupt("status", &e))?;
        let last_error = row
            .last_error
            .clone()
            .map(serde_json::from_value::<JobFailure>)
            .transpose()
            .map_err(|e| corrupt("last_error", &e))?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            filing_ref,
            status,
            attempt_count: row.attempt_count.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct ResultRow {
    job_id: uuid::Uuid,
    filing_ref: String,
    payload: JsonValue,
    duration_ms: i64,
    extracted_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ResultRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ResultRow {
            job_id: row.try_get("job_id")?,
            filing_ref: row.try_get("filing_ref")?,
            payload: row.try_get("payload")?,
            duration_ms: row.try_get("duration_ms")?,
            extracted_at: row.try_get("extracted_at")?,
        })
    }
}

impl TryFrom<ResultRow> for ExtractionResult {
    type Error = JobStoreError;

    fn try_from(row: ResultRow) -> Result<Self, Self::Error> {
        let filing_ref = FilingRef::new(row.filing_ref).map_err(|e| {
            JobStoreError::Storage(format!("corrupt result row {}: filing_ref: {e}", row.job_id))
        })?;

        Ok(ExtractionResult {
            job_id: JobId::from_uuid(row.job_id),
            filing_ref,
            payload: row.payload,
            duration_ms: row.duration_ms.max(0) as u64,
            extracted_at: row.extracted_at,
        })
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    use sqlx::FromRow;
    JobRow::from_row(row).map_err(decode_error)?.try_into()
}

fn result_from_row(row: &PgRow) -> Result<ExtractionResult, JobStoreError> {
    use sqlx::FromRow;
    ResultRow::from_row(row).map_err(decode_error)?.try_into()
}

fn decode_error(err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(format!("failed to decode row: {err}"))
}

/// Map SQLx errors to `JobStoreError`.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            JobStoreError::Storage(format!("unexpected row not found in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}
