//! Detection of selectors that match more than one node on a page.

use std::collections::BTreeMap;

use tracing::{debug, instrument};

use genie_dom::{Document, Item, Selector, ancestor_paths};
use genie_shared::{AmbiguityContext, FieldMapping, MatchOccurrence, Page};

use crate::validator::{ParsedPage, all_identical, normalize_whitespace, parse_pages, truncate_chars};

/// Snippets recorded per ambiguous page.
pub const MAX_SNIPPETS: usize = 4;
/// Snippet length cap, in characters.
pub const MAX_SNIPPET_CHARS: usize = 300;

/// Find every field whose selector matches several nodes on some page.
pub fn find_ambiguous(
    mapping: &FieldMapping,
    pages: &[Page],
) -> BTreeMap<String, AmbiguityContext> {
    find_ambiguous_parsed(mapping, &parse_pages(pages))
}

#[instrument(skip_all, fields(fields = mapping.len(), pages = pages.len()))]
pub fn find_ambiguous_parsed(
    mapping: &FieldMapping,
    pages: &[ParsedPage],
) -> BTreeMap<String, AmbiguityContext> {
    let mut out = BTreeMap::new();

    for (field, text) in mapping {
        // Unparsable selectors are reported by the validator instead.
        let Ok(selector) = Selector::parse(text) else {
            continue;
        };

        let mut occurrences = Vec::new();
        let mut identical = None;

        for page in pages {
            let Ok(items) = selector.select(&page.doc) else {
                continue;
            };
            if items.len() < 2 {
                continue;
            }

            if identical.is_none() {
                let texts: Vec<String> = items
                    .iter()
                    .map(|item| normalize_whitespace(&item.string_value(&page.doc)))
                    .collect();
                identical = Some(all_identical(&texts));
            }

            occurrences.push(MatchOccurrence {
                url: page.url.clone(),
                match_count: items.len(),
                snippets: snippets(&page.doc, &items),
            });
        }

        if let Some(all_identical) = identical {
            debug!(
                field = %field,
                pages = occurrences.len(),
                all_identical,
                "ambiguous selector"
            );
            out.insert(
                field.clone(),
                AmbiguityContext {
                    selector: text.clone(),
                    occurrences,
                    all_identical,
                },
            );
        }
    }

    out
}

/// Serialized grandparents (or parents) of the first few matches.
fn snippets(doc: &Document, items: &[Item]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items.iter().take(MAX_SNIPPETS) {
        let Some(path) = item.element_path(doc) else {
            continue;
        };
        let mut ancestors = ancestor_paths(&path);
        let parent = ancestors.next();
        let surrounding = ancestors.next().or(parent).unwrap_or(&path);
        let snippet = truncate_chars(
            &normalize_whitespace(&doc.outer_html(surrounding)),
            MAX_SNIPPET_CHARS,
        );
        if !out.contains(&snippet) {
            out.push(snippet);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><body>
        <div class="job-detail">
          <div class="head"><span class="company">Acme</span></div>
          <div class="foot"><span class="company">Acme</span></div>
          <ul class="tags"><li>Rust</li><li>Remote</li><li>Senior</li></ul>
        </div>
        </body></html>"#;

    fn mapping(entries: &[(&str, &str)]) -> FieldMapping {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn unique_selectors_are_not_ambiguous() {
        let pages = vec![Page::fetched("u", PAGE)];
        let found = find_ambiguous(&mapping(&[("tags", "//ul[@class='tags']")]), &pages);
        assert!(found.is_empty());
    }

    #[test]
    fn identical_matches_are_flagged_identical() {
        let pages = vec![Page::fetched("https://a.example/1", PAGE)];
        let found = find_ambiguous(&mapping(&[("company", "//span[@class='company']")]), &pages);
        let ctx = &found["company"];
        assert!(ctx.all_identical);
        assert_eq!(ctx.selector, "//span[@class='company']");
        assert_eq!(ctx.occurrences.len(), 1);
        assert_eq!(ctx.occurrences[0].url, "https://a.example/1");
        assert_eq!(ctx.occurrences[0].match_count, 2);
    }

    #[test]
    fn divergent_matches_are_flagged_divergent() {
        let pages = vec![Page::fetched("u", PAGE)];
        let found = find_ambiguous(&mapping(&[("tag", "//li")]), &pages);
        let ctx = &found["tag"];
        assert!(!ctx.all_identical);
        assert_eq!(ctx.occurrences[0].match_count, 3);
    }

    #[test]
    fn snippets_use_the_grandparent() {
        let pages = vec![Page::fetched("u", PAGE)];
        let found = find_ambiguous(&mapping(&[("company", "//span[@class='company']")]), &pages);
        let snippets = &found["company"].occurrences[0].snippets;
        // Both spans share the job-detail grandparent.
        assert_eq!(snippets.len(), 1);
        assert!(snippets[0].starts_with(r#"<div class="job-detail">"#));
        assert!(snippets[0].chars().count() <= MAX_SNIPPET_CHARS);
    }

    #[test]
    fn snippets_are_capped_and_collapsed() {
        let items: String = (0..10)
            .map(|i| format!("<div class='g{i}'><p>\n  <b>v{i}</b>  </p></div>"))
            .collect();
        let html = format!("<html><body>{items}</body></html>");
        let pages = vec![Page::fetched("u", html)];
        let found = find_ambiguous(&mapping(&[("v", "//b")]), &pages);
        let occurrence = &found["v"].occurrences[0];
        assert_eq!(occurrence.match_count, 10);
        assert_eq!(occurrence.snippets.len(), MAX_SNIPPETS);
        assert_eq!(occurrence.snippets[0], r#"<div class="g0"><p> <b>v0</b> </p></div>"#);
    }

    #[test]
    fn all_identical_comes_from_the_first_ambiguous_page() {
        let first = "<html><body><i>same</i><i>same</i></body></html>";
        let second = "<html><body><i>one</i><i>two</i></body></html>";
        let pages = vec![
            Page::fetched("a", "<html><body><i>only</i></body></html>"),
            Page::fetched("b", first),
            Page::fetched("c", second),
        ];
        let found = find_ambiguous(&mapping(&[("i", "//i")]), &pages);
        let ctx = &found["i"];
        assert!(ctx.all_identical);
        assert_eq!(ctx.occurrences.len(), 2);
        assert_eq!(ctx.occurrences[0].url, "b");
    }

    #[test]
    fn unparsable_selectors_are_skipped() {
        let pages = vec![Page::fetched("u", PAGE)];
        assert!(find_ambiguous(&mapping(&[("bad", "//li[")]), &pages).is_empty());
    }
}
