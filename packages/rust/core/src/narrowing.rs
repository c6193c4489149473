//! Mechanical narrowing of ambiguous selectors.
//!
//! A proposed selector usually reads `container // core`, where the container
//! ends in a class-predicate step. When the core matches several nodes with
//! the same text, a discriminating ancestor step is inserted between container
//! and core: `container // tag[contains(@class,'token')] // core`. Candidate
//! tokens come from the ancestors of the matched nodes, below the container.

use std::collections::BTreeMap;

use tracing::{debug, info, instrument};

use genie_dom::xpath::{LocationPath, Step};
use genie_dom::{Document, Item, NodePath, Selector, ancestor_paths};
use genie_shared::{AmbiguityContext, FieldMapping, Page};

use crate::validator::{ParsedPage, parse_pages};

/// Class tokens shorter than this never become narrowing candidates.
const MIN_TOKEN_LEN: usize = 3;

/// Narrow every identical-value ambiguous field. Returns replacement
/// selectors for the fields that were repaired; all others are left out.
pub fn narrow(
    mapping: &FieldMapping,
    ambiguous: &BTreeMap<String, AmbiguityContext>,
    pages: &[Page],
) -> BTreeMap<String, String> {
    narrow_parsed(mapping, ambiguous, &parse_pages(pages))
}

#[instrument(skip_all, fields(candidates = ambiguous.len(), pages = pages.len()))]
pub fn narrow_parsed(
    mapping: &FieldMapping,
    ambiguous: &BTreeMap<String, AmbiguityContext>,
    pages: &[ParsedPage],
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();

    for (field, ctx) in ambiguous {
        if !ctx.all_identical {
            continue;
        }
        let text = mapping.get(field).unwrap_or(&ctx.selector);
        let Ok(selector) = Selector::parse(text) else {
            continue;
        };
        match narrow_selector(&selector, pages) {
            Some(narrowed) => {
                let narrowed = narrowed.to_string();
                info!(field = %field, from = %text, to = %narrowed, "narrowed selector");
                out.insert(field.clone(), narrowed);
            }
            None => debug!(field = %field, selector = %text, "no discriminating ancestor found"),
        }
    }

    out
}

/// Try to make `selector` match exactly one node on the first page where it
/// matches several. Only absolute location paths are narrowed.
pub fn narrow_selector(selector: &Selector, pages: &[ParsedPage]) -> Option<Selector> {
    let path = selector.location_path()?;
    if !path.absolute {
        return None;
    }

    let (element_steps, tail) = split_value_tail(&path.steps);
    let (container, core) = split_container_core(element_steps);
    if core.iter().all(Step::is_descendant_joint) {
        return None;
    }

    let element_selector = Selector::from_path(LocationPath {
        absolute: true,
        steps: element_steps.to_vec(),
    });
    let (doc, matches) = pages.iter().find_map(|page| {
        let matches = element_matches(&page.doc, &element_selector);
        (matches.len() >= 2).then_some((&page.doc, matches))
    })?;

    let container_token = container.last().and_then(Step::class_token);
    let candidates = candidate_tokens(doc, &matches, container_token);

    for (tag, token) in candidates {
        let mut steps = container.to_vec();
        steps.push(Step::descendant_or_self());
        steps.push(Step::child_with_class(tag, token));
        if !core.first().is_some_and(Step::is_descendant_joint) {
            steps.push(Step::descendant_or_self());
        }
        steps.extend_from_slice(core);

        let trial = Selector::from_path(LocationPath {
            absolute: true,
            steps: steps.clone(),
        });
        if element_matches(doc, &trial).len() == 1 {
            steps.extend_from_slice(tail);
            return Some(Selector::from_path(LocationPath {
                absolute: true,
                steps,
            }));
        }
    }

    None
}

/// Split steps into the container (through the first class-predicate step
/// followed by `//`) and the core after that `//`. Without such a step the
/// container is empty.
pub fn split_container_core(steps: &[Step]) -> (&[Step], &[Step]) {
    for (i, pair) in steps.windows(2).enumerate() {
        if pair[0].class_token().is_some() && pair[1].is_descendant_joint() {
            return (&steps[..=i], &steps[i + 2..]);
        }
    }
    (&[], steps)
}

/// Separate a trailing `@attr` / `text()` step (and the `//` before it).
fn split_value_tail(steps: &[Step]) -> (&[Step], &[Step]) {
    let mut cut = steps.len();
    if steps.last().is_some_and(Step::selects_value) {
        cut -= 1;
        if cut > 0 && steps[cut - 1].is_descendant_joint() {
            cut -= 1;
        }
    }
    steps.split_at(cut)
}

fn element_matches(doc: &Document, selector: &Selector) -> Vec<NodePath> {
    selector
        .select(doc)
        .unwrap_or_default()
        .into_iter()
        .filter(|item: &Item| item.attr.is_none() && doc.element(&item.path).is_some())
        .map(|item| item.path)
        .collect()
}

/// `(tag, class token)` pairs from the ancestors of each match, in discovery
/// order, stopping at the container.
fn candidate_tokens(
    doc: &Document,
    matches: &[NodePath],
    container_token: Option<&str>,
) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    for path in matches {
        for ancestor in ancestor_paths(path) {
            let Some(el) = doc.element(ancestor) else {
                continue;
            };
            let in_container = container_token
                .is_some_and(|token| el.attr("class").is_some_and(|class| class.contains(token)));
            if in_container {
                break;
            }
            for token in el.classes() {
                if token.chars().count() < MIN_TOKEN_LEN {
                    continue;
                }
                let candidate = (el.name.clone(), token.to_string());
                if !out.contains(&candidate) {
                    out.push(candidate);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><body class="page">
        <div class="job-detail">
          <div class="head"><span class="company">Acme</span></div>
          <div class="foot box"><span class="company">Acme</span></div>
        </div>
        <div class="other"><span class="company">Acme</span></div>
        </body></html>"#;

    fn parsed(html: &str) -> Vec<ParsedPage> {
        parse_pages(&[Page::fetched("https://a.example/1", html)])
    }

    fn narrowed(selector: &str, pages: &[ParsedPage]) -> Option<String> {
        let selector = Selector::parse(selector).expect("parse");
        narrow_selector(&selector, pages).map(|s| s.to_string())
    }

    fn count(selector: &str, pages: &[ParsedPage]) -> usize {
        Selector::parse(selector)
            .expect("parse")
            .select(&pages[0].doc)
            .expect("select")
            .len()
    }

    #[test]
    fn splits_at_the_first_class_step_before_descendant() {
        let selector = Selector::parse("//div[contains(@class,'job-detail')]//dl/dd").expect("parse");
        let steps = &selector.location_path().expect("path").steps;
        let (container, core) = split_container_core(steps);
        assert_eq!(container.len(), 2);
        assert_eq!(container[1].class_token(), Some("job-detail"));
        assert_eq!(core.len(), 2);
    }

    #[test]
    fn no_class_step_means_empty_container() {
        let selector = Selector::parse("//dl/dd").expect("parse");
        let steps = &selector.location_path().expect("path").steps;
        let (container, core) = split_container_core(steps);
        assert!(container.is_empty());
        assert_eq!(core.len(), steps.len());
    }

    #[test]
    fn narrows_without_container() {
        let pages = parsed(PAGE);
        let result = narrowed("//span[contains(@class,'company')]", &pages);
        assert_eq!(
            result.as_deref(),
            Some("//div[contains(@class,'head')]//span[contains(@class,'company')]")
        );
        assert_eq!(count(result.as_deref().unwrap_or_default(), &pages), 1);
    }

    #[test]
    fn narrows_inside_container_and_keeps_value_step() {
        let pages = parsed(PAGE);
        let result = narrowed(
            "//div[contains(@class,'job-detail')]//span[contains(@class,'company')]/text()",
            &pages,
        );
        assert_eq!(
            result.as_deref(),
            Some(
                "//div[contains(@class,'job-detail')]//div[contains(@class,'head')]//span[contains(@class,'company')]/text()"
            )
        );
    }

    #[test]
    fn container_ancestors_are_not_candidates() {
        // Both matches sit directly in the container, so nothing below it
        // can tell them apart.
        let html = r#"<html><body><div class="job-detail">
            <span class="company">Acme</span><span class="company">Acme</span>
            </div></body></html>"#;
        let pages = parsed(html);
        assert_eq!(
            narrowed("//div[contains(@class,'job-detail')]//span[contains(@class,'company')]", &pages),
            None
        );
    }

    #[test]
    fn unnarrowable_selector_is_left_alone() {
        let pages = parsed("<html><body><ul><li>x</li><li>x</li></ul></body></html>");
        assert_eq!(narrowed("//li", &pages), None);
    }

    #[test]
    fn short_tokens_are_ignored() {
        let html = r#"<html><body><div class="ab"><i>x</i></div><div class="cd"><i>x</i></div></body></html>"#;
        assert_eq!(narrowed("//i", &parsed(html)), None);
    }

    #[test]
    fn non_path_selectors_are_not_narrowed() {
        let pages = parsed(PAGE);
        assert_eq!(narrowed("//span | //div", &pages), None);
        assert_eq!(narrowed("(//span)[1]", &pages), None);
    }

    #[test]
    fn uses_first_page_with_several_matches() {
        let pages = parse_pages(&[
            Page::fetched("a", "<html><body><p><b>x</b></p></body></html>"),
            Page::fetched(
                "b",
                r#"<html><body><p class="lead"><b>x</b></p><p class="tail"><b>x</b></p></body></html>"#,
            ),
        ]);
        assert_eq!(
            narrowed("//b", &pages).as_deref(),
            Some("//p[contains(@class,'lead')]//b")
        );
    }

    #[test]
    fn narrow_only_touches_identical_fields() {
        let pages = parsed(PAGE);
        let mapping: FieldMapping = [
            ("company".to_string(), "//span[contains(@class,'company')]".to_string()),
            ("other".to_string(), "//div[@class='x']".to_string()),
        ]
        .into_iter()
        .collect();
        let mut ambiguous = BTreeMap::new();
        for (field, identical) in [("company", true), ("other", false)] {
            ambiguous.insert(
                field.to_string(),
                AmbiguityContext {
                    selector: mapping[field].clone(),
                    occurrences: Vec::new(),
                    all_identical: identical,
                },
            );
        }
        let out = narrow_parsed(&mapping, &ambiguous, &pages);
        assert_eq!(out.len(), 1);
        assert_eq!(
            out["company"],
            "//div[contains(@class,'head')]//span[contains(@class,'company')]"
        );
    }
}
