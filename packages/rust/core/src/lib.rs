//! Selector inference for Genie.
//!
//! This crate turns a proposed field mapping into a validated one:
//! - [`validator`]: confidence and representative samples per field
//! - [`ambiguity`] / [`narrowing`]: detect and mechanically repair selectors
//!   that match several nodes
//! - [`proposer`] / [`bridge`]: the proposer and refiner seams and their
//!   subprocess implementation
//! - [`pipeline`]: the end-to-end `analyze` workflow

pub mod ambiguity;
pub mod bridge;
pub mod narrowing;
pub mod pipeline;
pub mod proposer;
pub mod scope;
pub mod validator;

pub use ambiguity::{find_ambiguous, find_ambiguous_parsed};
pub use bridge::BridgeClient;
pub use narrowing::{narrow, narrow_parsed};
pub use pipeline::{AnalyzeOptions, ProgressReporter, SilentProgress, analyze, analyze_pages, prepare_urls};
pub use proposer::{
    FieldProposer, FieldRefiner, Proposal, Refinement, StaticProposer, load_mapping,
    parse_mapping_response,
};
pub use validator::{ParsedPage, parse_pages, validate, validate_parsed};
