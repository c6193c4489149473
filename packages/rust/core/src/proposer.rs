//! Boundary interfaces for the field proposer and refiner.
//!
//! Both collaborators usually sit behind an LLM. The pipeline only sees the
//! traits; [`crate::bridge::BridgeClient`] implements them over a subprocess
//! and [`StaticProposer`] serves a mapping from disk.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{Map, Value};
use tracing::{debug, info};

use genie_shared::{AmbiguityContext, FieldMapping, GenieError, Result, sanitize_field_name};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A proposed mapping and the tokens spent producing it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Proposal {
    pub mapping: FieldMapping,
    pub tokens_used: u64,
}

/// Replacement selectors for some subset of the fields sent for refinement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Refinement {
    pub replacements: FieldMapping,
    pub tokens_used: u64,
}

/// Proposes field → selector mappings from compressed sample pages.
pub trait FieldProposer: Send + Sync {
    /// `documents` are compressed pages, `hints` optional field names the
    /// caller wants covered.
    fn propose(&self, documents: &[String], hints: &[String]) -> Result<Proposal>;
}

/// Suggests replacement selectors for ambiguous fields.
pub trait FieldRefiner: Send + Sync {
    fn refine(&self, fields: &BTreeMap<String, AmbiguityContext>) -> Result<Refinement>;
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Extract a mapping from free-form model output.
///
/// Tries, in order: the text with code fences stripped, the outermost
/// `{...}` span, and finally a repair that drops an unterminated tail and
/// closes the object. Names are sanitized; null or non-string selectors are
/// dropped.
pub fn parse_mapping_response(text: &str) -> Result<FieldMapping> {
    let body = strip_code_fence(text.trim());

    let object = serde_json::from_str::<Map<String, Value>>(body)
        .ok()
        .or_else(|| outermost_object(body))
        .or_else(|| repair_truncated(body))
        .ok_or_else(|| {
            let preview: String = body.chars().take(200).collect();
            GenieError::Proposer(format!("response is not a JSON object: {preview}"))
        })?;

    Ok(sanitize_mapping(object.into_iter().filter_map(
        |(name, value)| match value {
            Value::String(selector) => Some((name, selector)),
            _ => None,
        },
    )))
}

/// Sanitize field names and drop blank selectors. The first entry wins when
/// two names sanitize to the same key.
pub fn sanitize_mapping(entries: impl IntoIterator<Item = (String, String)>) -> FieldMapping {
    let mut mapping = FieldMapping::new();
    for (raw_name, selector) in entries {
        let selector = selector.trim();
        if selector.is_empty() {
            continue;
        }
        let Some(name) = sanitize_field_name(&raw_name) else {
            debug!(name = %raw_name, "dropping field with unusable name");
            continue;
        };
        mapping.entry(name).or_insert_with(|| selector.to_string());
    }
    mapping
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string (e.g. `json`) on the opening line.
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

fn outermost_object(text: &str) -> Option<Map<String, Value>> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

/// Close an object cut off mid-stream. Candidates are the whole tail and
/// every top-level comma, latest first.
fn repair_truncated(text: &str) -> Option<Map<String, Value>> {
    let start = text.find('{')?;
    let body = &text[start..];

    let mut cuts = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in body.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => depth = depth.saturating_sub(1),
            ',' if depth == 1 => cuts.push(i),
            _ => {}
        }
    }

    std::iter::once(body.trim_end().len())
        .chain(cuts.into_iter().rev())
        .find_map(|cut| {
            let candidate = format!("{}}}", body[..cut].trim_end().trim_end_matches(','));
            serde_json::from_str(&candidate).ok()
        })
}

// ---------------------------------------------------------------------------
// StaticProposer
// ---------------------------------------------------------------------------

/// Read a mapping file (JSON object of field → selector).
pub fn load_mapping(path: &Path) -> Result<FieldMapping> {
    let text = std::fs::read_to_string(path).map_err(|e| GenieError::io(path, e))?;
    parse_mapping_response(&text)
        .map_err(|e| GenieError::config(format!("invalid mapping file {}: {e}", path.display())))
}

/// Proposer that always answers with a fixed mapping.
#[derive(Debug, Clone, Default)]
pub struct StaticProposer {
    mapping: FieldMapping,
}

impl StaticProposer {
    pub fn new(mapping: FieldMapping) -> Self {
        Self { mapping }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let mapping = load_mapping(path)?;
        info!(path = %path.display(), fields = mapping.len(), "loaded static mapping");
        Ok(Self { mapping })
    }
}

impl FieldProposer for StaticProposer {
    fn propose(&self, _documents: &[String], hints: &[String]) -> Result<Proposal> {
        for hint in hints {
            if !self.mapping.contains_key(hint) {
                debug!(hint = %hint, "hinted field missing from static mapping");
            }
        }
        Ok(Proposal {
            mapping: self.mapping.clone(),
            tokens_used: 0,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
