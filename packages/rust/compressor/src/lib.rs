//! Structural compression of sample pages.
//!
//! Reduces a page to the skeleton of its main content so that a field
//! proposer sees the shape of the data without boilerplate or long prose.
//! Steps, in order:
//! 1. drop non-content tags and boilerplate (by tag, then by class/id)
//! 2. detect the main section ([`main_section`])
//! 3. prune noise again inside it, truncate text, drop empty elements
//! 4. serialize and collapse whitespace

pub mod cleanup;
pub mod main_section;

use genie_dom::{Document, Element};
use genie_shared::{CompressSection, GenieError, Result};
use tracing::{debug, instrument};

use crate::main_section::{MainSection, find_main_section};

/// Tags removed with their content before anything else.
const REMOVE_TAGS: &[&str] = &["script", "style", "noscript", "iframe", "svg", "link", "meta", "head"];

/// Page chrome removed by tag.
const STRIP_TAGS: &[&str] = &["header", "footer", "nav", "aside"];

/// Shortest class token usable as a container hint.
const MIN_HINT_TOKEN_LEN: usize = 3;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Budgets for [`compress_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressOptions {
    /// Characters kept per text node before the ellipsis.
    pub text_limit: usize,
    /// Text length a block needs to count as main content.
    pub min_main_text: usize,
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self {
            text_limit: 30,
            min_main_text: 200,
        }
    }
}

impl From<&CompressSection> for CompressOptions {
    fn from(section: &CompressSection) -> Self {
        Self {
            text_limit: section.text_limit,
            min_main_text: section.min_main_text,
        }
    }
}

/// Tag and class token of the element chosen as main content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHint {
    pub tag: String,
    pub class_token: String,
}

impl ContainerHint {
    /// Hint for `el`, from its first class token of at least three characters.
    pub fn from_element(el: &Element) -> Option<Self> {
        let token = el
            .classes()
            .find(|token| token.chars().count() >= MIN_HINT_TOKEN_LEN)?;
        Some(Self {
            tag: el.name.clone(),
            class_token: token.to_string(),
        })
    }
}

/// A compressed page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompressedDocument {
    /// Serialized skeleton; empty when the markup could not be parsed.
    pub html: String,
    /// Set when the main section is a real element with a usable class.
    pub container: Option<ContainerHint>,
}

impl CompressedDocument {
    pub fn is_empty(&self) -> bool {
        self.html.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Compressor
// ---------------------------------------------------------------------------

/// Compress with default budgets, returning only the serialized skeleton.
pub fn compress(markup: &str) -> String {
    compress_with(markup, &CompressOptions::default()).html
}

/// Compress `markup`. Unparsable markup yields an empty document.
pub fn compress_with(markup: &str, opts: &CompressOptions) -> CompressedDocument {
    try_compress_with(markup, opts).unwrap_or_else(|e| {
        debug!(error = %e, "nothing to compress");
        CompressedDocument::default()
    })
}

/// Compress `markup`, failing with [`GenieError::Parse`] when it does not
/// parse or nothing is left of it.
#[instrument(skip_all, fields(bytes = markup.len()))]
pub fn try_compress_with(markup: &str, opts: &CompressOptions) -> Result<CompressedDocument> {
    let mut doc = Document::parse(markup).map_err(|e| GenieError::parse(e.to_string()))?;

    cleanup::remove_tags(&mut doc.children, REMOVE_TAGS);
    cleanup::remove_tags(&mut doc.children, STRIP_TAGS);
    // Before main detection, so boilerplate cannot win it.
    for node in doc.children.iter_mut() {
        if let Some(el) = node.as_element_mut() {
            cleanup::remove_noise(el);
        }
    }

    let (main, container) = match find_main_section(&doc, opts) {
        MainSection::Node(path) => {
            let el = doc.element(&path);
            (el.cloned(), el.and_then(ContainerHint::from_element))
        }
        MainSection::Merged(wrapper) => (Some(wrapper), None),
        MainSection::Whole => (doc.root_element().map(|root| strip_wrappers(root).clone()), None),
    };
    let mut main = main.ok_or_else(|| GenieError::parse("document has no root element"))?;

    cleanup::remove_noise(&mut main);
    cleanup::truncate_text(&mut main, opts.text_limit);
    cleanup::remove_empty(&mut main);

    let html = cleanup::collapse_whitespace(&main.outer_html());
    if html.is_empty() {
        return Err(GenieError::parse("nothing left after compression"));
    }
    debug!(
        input_bytes = markup.len(),
        output_bytes = html.len(),
        container = ?container,
        "compressed page"
    );

    Ok(CompressedDocument { html, container })
}

/// Descend through elements whose only content is one child element, so a
/// page that is already a bare skeleton keeps its shape when compressed again.
fn strip_wrappers(mut el: &Element) -> &Element {
    loop {
        let mut elements = el.element_children();
        let (Some(only), None) = (elements.next(), elements.next()) else {
            return el;
        };
        if !el.children.iter().all(|n| n.as_element().is_some() || n.is_blank_text()) {
            return el;
        }
        el = only;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
