//! Routes filings to an extractor by document kind.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use secx_core::{FilingKind, FilingRef};

use crate::error::ExtractionError;
use crate::extractor::Extractor;

/// Extractor that dispatches on [`FilingKind`].
///
/// Lookup order: the extractor registered for the filing's kind, then the
/// fallback. A filing neither matches is `Unsupported`.
#[derive(Default)]
pub struct ExtractorRegistry {
    by_kind: HashMap<FilingKind, Arc<dyn Extractor>>,
    fallback: Option<Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<E: Extractor>(mut self, kind: FilingKind, extractor: E) -> Self {
        self.by_kind.insert(kind, Arc::new(extractor));
        self
    }

    pub fn with_fallback<E: Extractor>(mut self, extractor: E) -> Self {
        self.fallback = Some(Arc::new(extractor));
        self
    }

    fn route(&self, kind: FilingKind) -> Option<&Arc<dyn Extractor>> {
        self.by_kind.get(&kind).or(self.fallback.as_ref())
    }
}

impl Extractor for ExtractorRegistry {
    fn extract(&self, filing: &FilingRef) -> Result<JsonValue, ExtractionError> {
        let kind = filing.kind();
        let extractor = self.route(kind).ok_or_else(|| {
            ExtractionError::Unsupported(format!("no extractor for {kind} filing {filing}"))
        })?;
        extractor.extract(filing)
    }
}
