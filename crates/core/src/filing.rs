//! Filing references and filing kinds.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Longest filing reference accepted (matches the `filings.filing_ref` column).
pub const MAX_FILING_REF_LEN: usize = 255;

/// Opaque identifier of a filing under extraction (e.g. `"10-K-001"` or an
/// accession document name such as `"0000320193-23-000106.xml"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FilingRef(String);

impl FilingRef {
    /// Validate and wrap a filing reference.
    ///
    /// Surrounding whitespace is trimmed; empty, overlong, or control-character
    /// references are rejected.
    pub fn new(value: impl Into<String>) -> DomainResult<Self> {
        let value = value.into();
        let trimmed = value.trim();

        if trimmed.is_empty() {
            return Err(DomainError::validation("filing_ref must not be empty"));
        }
        if trimmed.len() > MAX_FILING_REF_LEN {
            return Err(DomainError::validation(format!(
                "filing_ref exceeds {MAX_FILING_REF_LEN} bytes"
            )));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(DomainError::validation(
                "filing_ref must not contain control characters",
            ));
        }

        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Kind of document this reference points at, inferred from its extension.
    pub fn kind(&self) -> FilingKind {
        FilingKind::detect(&self.0)
    }
}

impl core::fmt::Display for FilingRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for FilingRef {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for FilingRef {
    type Error = DomainError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FilingRef> for String {
    fn from(value: FilingRef) -> Self {
        value.0
    }
}

impl core::str::FromStr for FilingRef {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Document format of a filing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilingKind {
    /// XBRL instance document (`.xml`, `.xbrl`).
    Xbrl,
    /// HTML filing (`.htm`, `.html`).
    Html,
    /// No recognizable extension.
    Unknown,
}

impl FilingKind {
    /// Infer the kind from a file name or reference by its extension.
    pub fn detect(name: &str) -> Self {
        let Some((_, ext)) = name.rsplit_once('.') else {
            return FilingKind::Unknown;
        };

        match ext.to_ascii_lowercase().as_str() {
            "xml" | "xbrl" => FilingKind::Xbrl,
            "htm" | "html" => FilingKind::Html,
            _ => FilingKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FilingKind::Xbrl => "xbrl",
            FilingKind::Html => "html",
            FilingKind::Unknown => "unknown",
        }
    }
}

impl core::fmt::Display for FilingKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filing_ref_is_trimmed() {
        let r = FilingRef::new("  10-K-001 ").unwrap();
        assert_eq!(r.as_str(), "10-K-001");
    }

    #[test]
    fn empty_filing_ref_is_rejected() {
        assert!(matches!(FilingRef::new("   "), Err(DomainError::Validation(_))));
    }

    #[test]
    fn control_characters_are_rejected() {
        assert!(FilingRef::new("10-K\n001").is_err());
    }

    #[test]
    fn overlong_filing_ref_is_rejected() {
        let long = "x".repeat(MAX_FILING_REF_LEN + 1);
        assert!(FilingRef::new(long).is_err());
    }

    #[test]
    fn filing_ref_deserializes_with_validation() {
        let ok: FilingRef = serde_json::from_str("\"10-Q-7\"").unwrap();
        assert_eq!(ok.as_str(), "10-Q-7");
        assert!(serde_json::from_str::<FilingRef>("\"\"").is_err());
    }

    #[test]
    fn kind_is_detected_from_extension() {
        assert_eq!(FilingKind::detect("aapl-20230930.XML"), FilingKind::Xbrl);
        assert_eq!(FilingKind::detect("report.xbrl"), FilingKind::Xbrl);
        assert_eq!(FilingKind::detect("form10k.htm"), FilingKind::Html);
        assert_eq!(FilingKind::detect("form10k.html"), FilingKind::Html);
        assert_eq!(FilingKind::detect("10-K-001"), FilingKind::Unknown);
        assert_eq!(FilingKind::detect("archive.zip"), FilingKind::Unknown);
    }
}
