//! Safe concurrent page fetching.
//!
//! This crate provides:
//! - [`SafeFetcher`]: bounded-concurrency fetcher that keeps input order
//! - [`guard`]: scheme and address checks run before every connection
//! - [`decode`]: charset detection and markup cleanup

pub mod decode;
pub mod engine;
pub mod guard;

pub use decode::{charset_from_content_type, clean_markup, decode_body};
pub use engine::SafeFetcher;
pub use guard::is_blocked_ip;
