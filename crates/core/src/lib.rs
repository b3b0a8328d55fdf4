//! `secx-core`: domain building blocks for the filing extraction pipeline.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! job records and their lifecycle, extraction results, filing references,
//! and the retry policy shared by every component that schedules work.

pub mod error;
pub mod filing;
pub mod id;
pub mod job;
pub mod result;
pub mod retry;

pub use error::{DomainError, DomainResult};
pub use filing::{FilingKind, FilingRef};
pub use id::JobId;
pub use job::{FailureKind, Job, JobFailure, JobStatus};
pub use result::ExtractionResult;
pub use retry::RetryPolicy;
