//! Main-content detection.
//!
//! Rules, first success wins:
//! 1. `<main>` (or `<article>`): its largest non-noise child when that child
//!    has enough text, else the container itself.
//! 2. Structured data: the div/section holding `th`/`dt` markers, scored by
//!    marker count times text length. When no container dominates, the top
//!    disjoint candidates are merged under a synthetic `<div>`.
//! 3. The largest non-noise div/section with enough text, else the whole
//!    document.

use genie_dom::{Document, Element, Node, NodePath, ancestor_paths};
use tracing::debug;

use crate::CompressOptions;
use crate::cleanup::is_noise;

/// How far up from a marker to look for its container.
const MAX_MARKER_DEPTH: usize = 10;

/// The part of the document treated as main content.
#[derive(Debug, Clone, PartialEq)]
pub enum MainSection {
    /// An element of the document.
    Node(NodePath),
    /// Copies of several containers under a synthetic `<div>`.
    Merged(Element),
    /// Nothing stood out; use the whole document.
    Whole,
}

/// Pick the main section of an already pruned document.
pub fn find_main_section(doc: &Document, opts: &CompressOptions) -> MainSection {
    if let Some(section) = semantic_container(doc, opts) {
        debug!(rule = "semantic", "main section found");
        return section;
    }
    if let Some(section) = structured_section(doc) {
        debug!(rule = "structured", "main section found");
        return section;
    }
    let section = largest_block(doc, opts);
    debug!(rule = "largest_block", whole = section == MainSection::Whole, "main section found");
    section
}

fn first_named(doc: &Document, name: &str) -> Option<NodePath> {
    doc.find_elements(|el| el.name == name).into_iter().next()
}

fn semantic_container(doc: &Document, opts: &CompressOptions) -> Option<MainSection> {
    let path = first_named(doc, "main").or_else(|| first_named(doc, "article"))?;
    let container = doc.element(&path)?;

    let mut best: Option<usize> = None;
    let mut best_len = 0;
    for (index, child) in container.children.iter().enumerate() {
        let Node::Element(el) = child else {
            continue;
        };
        if is_noise(el) {
            continue;
        }
        let len = el.text_len();
        if len > best_len {
            best_len = len;
            best = Some(index);
        }
    }

    Some(match best {
        Some(index) if best_len > opts.min_main_text => {
            let mut child = path;
            child.push(index);
            MainSection::Node(child)
        }
        _ => MainSection::Node(path),
    })
}

struct Candidate {
    path: NodePath,
    markers: usize,
    score: usize,
}

fn structured_section(doc: &Document) -> Option<MainSection> {
    let markers: Vec<NodePath> = doc
        .find_elements(|el| el.name == "th")
        .into_iter()
        .chain(doc.find_elements(|el| el.name == "dt"))
        .collect();
    if markers.len() < 2 {
        return None;
    }

    // Insertion order is kept so equal scores rank by first appearance.
    let mut candidates: Vec<Candidate> = Vec::new();
    for marker in &markers {
        for ancestor in ancestor_paths(marker).take(MAX_MARKER_DEPTH) {
            let Some(el) = doc.element(ancestor) else {
                break;
            };
            if el.name == "div" || el.name == "section" {
                if !is_noise(el) {
                    match candidates.iter_mut().find(|c| c.path == ancestor) {
                        Some(candidate) => candidate.markers += 1,
                        None => candidates.push(Candidate {
                            path: ancestor.to_vec(),
                            markers: 1,
                            score: 0,
                        }),
                    }
                }
                break;
            }
            if el.name == "body" {
                break;
            }
        }
    }

    for candidate in &mut candidates {
        let text_len = doc.element(&candidate.path).map_or(0, Element::text_len);
        candidate.score = candidate.markers * text_len.max(1);
    }
    candidates.sort_by(|a, b| b.score.cmp(&a.score));

    let best = candidates.first()?;
    if best.markers < 2 {
        return None;
    }

    let total: usize = candidates
        .iter()
        .filter(|c| c.markers >= 2)
        .map(|c| c.score)
        .sum();

    if best.score * 2 < total && candidates.len() > 1 {
        let mut wrapper = Element::new("div");
        let mut added: Vec<&NodePath> = Vec::new();
        for candidate in candidates.iter().filter(|c| c.markers >= 2) {
            if added.iter().any(|a| candidate.path.starts_with(a)) {
                continue;
            }
            if let Some(el) = doc.element(&candidate.path) {
                wrapper.children.push(Node::Element(el.clone()));
                added.push(&candidate.path);
            }
        }
        if !wrapper.children.is_empty() {
            debug!(merged = added.len(), "no dominant structured section; merging");
            return Some(MainSection::Merged(wrapper));
        }
    }

    Some(MainSection::Node(best.path.clone()))
}

fn largest_block(doc: &Document, opts: &CompressOptions) -> MainSection {
    let mut best = None;
    let mut best_len = 0;
    for path in doc.find_elements(|el| (el.name == "div" || el.name == "section") && !is_noise(el)) {
        let len = doc.element(&path).map_or(0, Element::text_len);
        if len > best_len {
            best_len = len;
            best = Some(path);
        }
    }
    match best {
        Some(path) if best_len > opts.min_main_text => MainSection::Node(path),
        _ => MainSection::Whole,
    }
}
