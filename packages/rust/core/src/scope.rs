//! Scoping proposed selectors to the main-content container.

use tracing::debug;

use genie_compressor::ContainerHint;
use genie_dom::xpath::{LocationPath, Step};
use genie_dom::Selector;
use genie_shared::FieldMapping;

use crate::validator::ParsedPage;

/// The most frequent hint; ties go to the one seen first.
pub fn dominant_hint<'a>(hints: impl IntoIterator<Item = &'a ContainerHint>) -> Option<ContainerHint> {
    let mut counts: Vec<(&ContainerHint, usize)> = Vec::new();
    for hint in hints {
        match counts.iter_mut().find(|(seen, _)| *seen == hint) {
            Some((_, count)) => *count += 1,
            None => counts.push((hint, 1)),
        }
    }

    let mut best: Option<(&ContainerHint, usize)> = None;
    for (hint, count) in counts {
        if best.is_none_or(|(_, top)| count > top) {
            best = Some((hint, count));
        }
    }
    best.map(|(hint, _)| hint.clone())
}

/// Prefix each selector with `//tag[contains(@class,'token')]` when the
/// scoped form hits at least as many pages as the original. Returns the
/// updated mapping and the fields that were scoped.
pub fn scope_mapping(
    mapping: &FieldMapping,
    hint: &ContainerHint,
    pages: &[ParsedPage],
) -> (FieldMapping, Vec<String>) {
    let mut out = mapping.clone();
    let mut scoped_fields = Vec::new();

    for (field, text) in mapping {
        let Ok(selector) = Selector::parse(text) else {
            continue;
        };
        let Some(scoped) = scope_selector(&selector, hint) else {
            continue;
        };

        let before = page_hits(&selector, pages);
        let after = page_hits(&scoped, pages);
        if after > 0 && after >= before {
            let scoped = scoped.to_string();
            debug!(field = %field, from = %text, to = %scoped, "scoped selector");
            out.insert(field.clone(), scoped);
            scoped_fields.push(field.clone());
        } else {
            debug!(field = %field, before, after, "scoping would lose hits");
        }
    }

    (out, scoped_fields)
}

/// `//tag[contains(@class,'token')]` + selector, for `//`-rooted paths not
/// already filtering on the token.
pub fn scope_selector(selector: &Selector, hint: &ContainerHint) -> Option<Selector> {
    let path = selector.location_path()?;
    if !path.absolute || !path.steps.first().is_some_and(Step::is_descendant_joint) {
        return None;
    }
    if path
        .steps
        .iter()
        .any(|step| step.class_token() == Some(hint.class_token.as_str()))
    {
        return None;
    }

    let mut steps = vec![
        Step::descendant_or_self(),
        Step::child_with_class(hint.tag.clone(), hint.class_token.clone()),
    ];
    steps.extend(path.steps.iter().cloned());
    Some(Selector::from_path(LocationPath {
        absolute: true,
        steps,
    }))
}

fn page_hits(selector: &Selector, pages: &[ParsedPage]) -> usize {
    pages
        .iter()
        .filter(|page| selector.select(&page.doc).is_ok_and(|items| !items.is_empty()))
        .count()
}
