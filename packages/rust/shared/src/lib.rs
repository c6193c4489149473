//! Shared types, error model, and configuration for Genie.
//!
//! This crate is the foundation depended on by all other Genie crates.
//! It provides:
//! - [`GenieError`] and [`FetchError`]: the unified error types
//! - Domain types ([`Page`], [`FieldMapping`], [`ValidationResult`], [`AmbiguityContext`])
//! - Configuration ([`AppConfig`], [`FetchConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BridgeSection, CompressSection, FetchConfig, FetchSection, config_dir,
    config_file_path, init_config, load_config, load_config_from,
};
pub use error::{FetchError, GenieError, Result};
pub use types::{
    AmbiguityContext, AnalysisReport, FieldMapping, MAX_FIELD_NAME_LEN, MatchOccurrence, Page,
    PageFailure, ValidationResult, sanitize_field_name,
};
