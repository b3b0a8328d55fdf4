use std::sync::Arc;

use serde_json::Value as JsonValue;

use secx_core::FilingRef;

use crate::error::ExtractionError;

/// Produces structured data for a filing.
///
/// The payload schema belongs to the implementation; the pipeline stores it
/// as-is. Implementations may block.
pub trait Extractor: Send + Sync + 'static {
    fn extract(&self, filing: &FilingRef) -> Result<JsonValue, ExtractionError>;
}

impl<E> Extractor for Arc<E>
where
    E: Extractor + ?Sized,
{
    fn extract(&self, filing: &FilingRef) -> Result<JsonValue, ExtractionError> {
        (**self).extract(filing)
    }
}

impl<E> Extractor for Box<E>
where
    E: Extractor + ?Sized,
{
    fn extract(&self, filing: &FilingRef) -> Result<JsonValue, ExtractionError> {
        (**self).extract(filing)
    }
}

/// Extractor backed by a closure.
pub struct FnExtractor<F> {
    f: F,
}

impl<F> Extractor for FnExtractor<F>
where
    F: Fn(&FilingRef) -> Result<JsonValue, ExtractionError> + Send + Sync + 'static,
{
    fn extract(&self, filing: &FilingRef) -> Result<JsonValue, ExtractionError> {
        (self.f)(filing)
    }
}

pub fn extractor_fn<F>(f: F) -> FnExtractor<F>
where
    F: Fn(&FilingRef) -> Result<JsonValue, ExtractionError> + Send + Sync + 'static,
{
    FnExtractor { f }
}
