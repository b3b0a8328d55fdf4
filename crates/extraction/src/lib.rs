//! `secx-extraction`
//!
//! **Responsibility:** boundary to the document parsing capability.
//!
//! The pipeline never parses filings itself. It hands a filing reference to an
//! [`Extractor`] and treats the call as untrusted: arbitrary latency, arbitrary
//! failures, possibly a panic. [`ExtractionRunner`] bounds the call in time and
//! folds every way it can end into an explicit [`ExtractionOutcome`].

pub mod error;
pub mod extractor;
pub mod http;
pub mod outcome;
pub mod registry;
pub mod runner;

pub use error::ExtractionError;
pub use extractor::{Extractor, FnExtractor, extractor_fn};
pub use http::HttpExtractor;
pub use outcome::ExtractionOutcome;
pub use registry::ExtractorRegistry;
pub use runner::ExtractionRunner;
