//! Error types for Genie.
//!
//! Library crates use [`GenieError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Per-URL fetch failures are modelled separately as [`FetchError`] because
//! they are data, not control flow: a failed page is recorded on its
//! [`Page`](crate::Page) and the batch carries on.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level error type for all Genie operations.
#[derive(Debug, thiserror::Error)]
pub enum GenieError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// A page the caller needed could not be fetched.
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Markup could not be parsed, or nothing usable was left of it.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// The field-mapping proposer failed or returned unusable output.
    #[error("proposer error: {0}")]
    Proposer(String),

    /// The field-mapping refiner failed or returned unusable output.
    #[error("refiner error: {0}")]
    Refiner(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Input validation error (too many URLs, no usable pages, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, GenieError>;

impl GenieError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Why a single URL produced no markup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchError {
    /// The URL did not parse or has no host.
    #[error("invalid URL: {message}")]
    InvalidUrl { message: String },

    /// Refused before any request was made (scheme or address blocklist).
    #[error("blocked: {reason}")]
    Blocked { reason: String },

    /// The request did not complete within the configured timeout.
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The server answered with a non-2xx status.
    #[error("HTTP {status}")]
    Status { status: u16 },

    /// DNS, connect, TLS or body-read failure.
    #[error("network error: {message}")]
    Network { message: String },

    /// The body could not be turned into text.
    #[error("decode error: {message}")]
    Decode { message: String },
}

impl FetchError {
    /// True when the URL was refused by the SSRF guard.
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = GenieError::config("missing bridge script");
        assert_eq!(err.to_string(), "config error: missing bridge script");

        let err = GenieError::validation("at most 10 URLs");
        assert!(err.to_string().contains("at most 10"));
    }

    #[test]
    fn parse_helper_builds_parse_variant() {
        let err = GenieError::parse("empty document");
        assert!(matches!(err, GenieError::Parse { .. }));
        assert_eq!(err.to_string(), "parse error: empty document");
    }

    #[test]
    fn fetch_error_wraps_transparently() {
        let err: GenieError = FetchError::Status { status: 404 }.into();
        assert_eq!(err.to_string(), "fetch error: HTTP 404");
    }

    #[test]
    fn fetch_error_serializes_with_kind_tag() {
        let err = FetchError::Blocked {
            reason: "private address 10.0.0.1".into(),
        };
        let json = serde_json::to_value(&err).expect("serialize");
        assert_eq!(json["kind"], "blocked");
        assert_eq!(json["reason"], "private address 10.0.0.1");
        assert!(err.is_blocked());
        assert!(!FetchError::Timeout { secs: 15 }.is_blocked());
    }
}
