//! Owned markup tree and the XPath-subset selector engine.
//!
//! This crate provides:
//! - [`Document`]: an owned, mutable tree built with `scraper`'s lenient HTML5 parser
//! - [`xpath`]: a structured selector representation with a parser and evaluator
//!
//! Nodes are addressed by child-index paths ([`NodePath`]). Document order is
//! lexicographic path order, and an ancestor is a strict prefix of its
//! descendants, so ancestor walks never need parent pointers.

pub mod tree;
pub mod xpath;

pub use tree::{Document, Element, Node, NodePath, NodeRef, ParseError, ancestor_paths};
pub use xpath::{Item, Selector, SelectorError};
