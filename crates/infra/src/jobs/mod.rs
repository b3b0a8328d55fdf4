//! Job persistence.
//!
//! ## Components
//!
//! - `JobStore`: transactional CRUD over jobs and results with
//!   compare-and-swap status transitions
//! - `InMemoryJobStore`: tests/dev
//! - `PostgresJobStore`: durable store (`extraction_jobs` and `extraction_results` tables)
//!
//! At most one non-terminal job exists per filing. Both implementations
//! enforce it at insert time (the Postgres one with a partial unique index).

pub mod postgres;
pub mod store;

pub use postgres::{migrate, PostgresJobStore, SCHEMA};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError, TransitionFields};
