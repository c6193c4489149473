//! Core domain types shared by the fetcher, compressor and analysis stages.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{FetchError, GenieError, Result};

/// Upper bound on a sanitized field name.
pub const MAX_FIELD_NAME_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Page
// ---------------------------------------------------------------------------

/// One sample URL and what came back for it.
///
/// Exactly one of `markup` / `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    /// The URL as requested.
    pub url: String,
    /// Decoded, prolog-stripped markup.
    pub markup: Option<String>,
    /// Why nothing was fetched.
    pub error: Option<FetchError>,
}

impl Page {
    /// A successfully fetched page.
    pub fn fetched(url: impl Into<String>, markup: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            markup: Some(markup.into()),
            error: None,
        }
    }

    /// A page whose fetch failed.
    pub fn failed(url: impl Into<String>, error: FetchError) -> Self {
        Self {
            url: url.into(),
            markup: None,
            error: Some(error),
        }
    }

    /// Whether the page has markup to work with.
    pub fn is_fetched(&self) -> bool {
        self.markup.is_some()
    }

    /// The markup, or the reason there is none.
    pub fn try_markup(&self) -> Result<&str> {
        match (&self.markup, &self.error) {
            (Some(markup), _) => Ok(markup.as_str()),
            (None, Some(error)) => Err(GenieError::Fetch(error.clone())),
            (None, None) => Err(GenieError::validation(format!("{} has no markup", self.url))),
        }
    }
}

// ---------------------------------------------------------------------------
// FieldMapping
// ---------------------------------------------------------------------------

/// Field name → selector expression, ordered by field name.
pub type FieldMapping = BTreeMap<String, String>;

/// Reduce a proposed field name to `[A-Za-z0-9_]`, at most
/// [`MAX_FIELD_NAME_LEN`] characters. Returns `None` when nothing survives.
pub fn sanitize_field_name(raw: &str) -> Option<String> {
    static DISALLOWED_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_]+").expect("valid regex"));

    let replaced = DISALLOWED_RE.replace_all(raw.trim(), "_");
    let trimmed = replaced.trim_matches('_');
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_FIELD_NAME_LEN).collect())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Per-field outcome of evaluating a selector against every parsed page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// The selector that was evaluated.
    pub selector: String,
    /// hits / parsed pages, in `[0, 1]`.
    pub confidence: f64,
    /// One entry per parsed page, in page order. `None` means no match.
    pub samples: Vec<Option<String>>,
    /// True when the field did not match on every page.
    pub optional: bool,
    /// Set when some page matched several nodes with differing text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

// ---------------------------------------------------------------------------
// Ambiguity
// ---------------------------------------------------------------------------

/// Multiple matches of one selector on one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchOccurrence {
    pub url: String,
    pub match_count: usize,
    /// Serialized surroundings (grandparent or parent) of the first few matches.
    pub snippets: Vec<String>,
}

/// Everything a refiner needs to disambiguate one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguityContext {
    pub selector: String,
    pub occurrences: Vec<MatchOccurrence>,
    /// Whether all matches on the first ambiguous page had the same text.
    pub all_identical: bool,
}

// ---------------------------------------------------------------------------
// AnalysisReport
// ---------------------------------------------------------------------------

/// A page that took no part in the analysis, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageFailure {
    pub url: String,
    pub error: String,
}

/// Result of a full analysis run over one site's sample pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Host of the first URL.
    pub site: String,
    /// Final, validated mapping.
    pub mappings: BTreeMap<String, ValidationResult>,
    pub pages_analyzed: usize,
    pub pages_failed: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<PageFailure>,
    /// Tokens reported by the proposer and refiner.
    pub tokens_used: u64,
    /// Fields repaired by mechanical narrowing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub narrowed_fields: Vec<String>,
    /// Fields replaced by the refiner.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refined_fields: Vec<String>,
    pub elapsed_seconds: f64,
    pub analyzed_at: DateTime<Utc>,
}
