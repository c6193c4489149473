//! Selector validation and confidence scoring.
//!
//! Every field's selector is evaluated against every parsed page. Confidence
//! is the share of pages with at least one match; each page contributes one
//! sample, positionally aligned with the page list.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use tracing::{debug, instrument, warn};

use genie_dom::{Document, Item, Selector, ancestor_paths};
use genie_shared::{FieldMapping, Page, ValidationResult};

/// Sample recorded when a selector could not be evaluated on a page.
pub const ERROR_SAMPLE: &str = "(error)";
/// Sample recorded when the chosen node has no text.
pub const EMPTY_SAMPLE: &str = "(empty)";
/// Samples are cut to this many characters.
pub const MAX_SAMPLE_CHARS: usize = 100;

const POSITIVE_TOKENS: &[&str] = &["main", "article", "detail", "content", "primary"];
const NEGATIVE_TOKENS: &[&str] = &["aside", "sidebar", "nav", "footer", "recommend", "related"];
const POSITIVE_TAGS: &[&str] = &["main", "article"];
const NEGATIVE_TAGS: &[&str] = &["aside", "nav", "footer"];
const TAG_WEIGHT: i32 = 10;
const TOKEN_WEIGHT: i32 = 5;

// ---------------------------------------------------------------------------
// Parsed pages
// ---------------------------------------------------------------------------

/// A fetched page together with its parsed tree.
#[derive(Debug, Clone)]
pub struct ParsedPage {
    pub url: String,
    pub doc: Document,
}

/// Parse every page that carries markup. Pages without markup, or whose
/// markup does not parse, are left out.
pub fn parse_pages(pages: &[Page]) -> Vec<ParsedPage> {
    pages
        .iter()
        .filter_map(|page| {
            let markup = page.markup.as_deref()?;
            match Document::parse(markup) {
                Ok(doc) => Some(ParsedPage {
                    url: page.url.clone(),
                    doc,
                }),
                Err(e) => {
                    warn!(url = %page.url, error = %e, "page excluded: markup did not parse");
                    None
                }
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate `mapping` against the fetched `pages`.
pub fn validate(mapping: &FieldMapping, pages: &[Page]) -> BTreeMap<String, ValidationResult> {
    validate_parsed(mapping, &parse_pages(pages))
}

/// Validate `mapping` against already-parsed pages.
#[instrument(skip_all, fields(fields = mapping.len(), pages = pages.len()))]
pub fn validate_parsed(
    mapping: &FieldMapping,
    pages: &[ParsedPage],
) -> BTreeMap<String, ValidationResult> {
    if pages.is_empty() {
        return BTreeMap::new();
    }

    mapping
        .iter()
        .map(|(field, selector)| {
            let result = validate_field(field, selector, pages);
            debug!(
                field = %field,
                confidence = result.confidence,
                warned = result.warning.is_some(),
                "field validated"
            );
            (field.clone(), result)
        })
        .collect()
}

fn validate_field(field: &str, text: &str, pages: &[ParsedPage]) -> ValidationResult {
    let selector = match Selector::parse(text) {
        Ok(selector) => selector,
        Err(e) => {
            warn!(field, selector = text, error = %e, "selector does not parse");
            return ValidationResult {
                selector: text.to_string(),
                confidence: 0.0,
                samples: vec![Some(ERROR_SAMPLE.to_string()); pages.len()],
                optional: true,
                warning: None,
            };
        }
    };

    let mut hits = 0usize;
    let mut samples = Vec::with_capacity(pages.len());
    let mut warning = None;

    for page in pages {
        let items = match selector.select(&page.doc) {
            Ok(items) => items,
            Err(e) => {
                debug!(field, url = %page.url, error = %e, "selector evaluation failed");
                samples.push(Some(ERROR_SAMPLE.to_string()));
                continue;
            }
        };
        if items.is_empty() {
            samples.push(None);
            continue;
        }

        hits += 1;
        let texts: Vec<String> = items
            .iter()
            .map(|item| normalize_whitespace(&item.string_value(&page.doc)))
            .collect();

        if warning.is_none() && !all_identical(&texts) {
            warning = Some(format!(
                "{} matches with differing values on {}",
                items.len(),
                page.url
            ));
        }

        let chosen = representative(&page.doc, &items, &texts);
        samples.push(Some(sample_text(&texts[chosen])));
    }

    let confidence = hits as f64 / pages.len() as f64;
    ValidationResult {
        selector: text.to_string(),
        confidence,
        samples,
        optional: confidence < 1.0,
        warning,
    }
}

// ---------------------------------------------------------------------------
// Representative node
// ---------------------------------------------------------------------------

/// Index of the match whose surroundings look most like main content.
/// Ties go to the longer text, then to the earlier node.
fn representative(doc: &Document, items: &[Item], texts: &[String]) -> usize {
    if items.len() == 1 {
        return 0;
    }
    items
        .iter()
        .enumerate()
        .max_by_key(|(index, item)| {
            (
                context_score(doc, item),
                texts[*index].chars().count(),
                Reverse(*index),
            )
        })
        .map(|(index, _)| index)
        .unwrap_or(0)
}

/// Structural score of the chain from the item's element up to `<html>`.
pub(crate) fn context_score(doc: &Document, item: &Item) -> i32 {
    let Some(path) = item.element_path(doc) else {
        return 0;
    };
    std::iter::once(path.as_slice())
        .chain(ancestor_paths(&path))
        .filter_map(|p| doc.element(p))
        .map(|el| {
            let mut score = 0;
            if POSITIVE_TAGS.contains(&el.name.as_str()) {
                score += TAG_WEIGHT;
            }
            if NEGATIVE_TAGS.contains(&el.name.as_str()) {
                score -= TAG_WEIGHT;
            }
            let tokens = el.class_and_id().to_lowercase();
            for word in tokens.split(|c: char| !c.is_ascii_alphanumeric()) {
                if word.is_empty() {
                    continue;
                }
                if POSITIVE_TOKENS.iter().any(|t| word.contains(t)) {
                    score += TOKEN_WEIGHT;
                }
                if NEGATIVE_TOKENS.iter().any(|t| word.contains(t)) {
                    score -= TOKEN_WEIGHT;
                }
            }
            score
        })
        .sum()
}

// ---------------------------------------------------------------------------
// Text helpers
// ---------------------------------------------------------------------------

pub(crate) fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

pub(crate) fn all_identical(texts: &[String]) -> bool {
    texts.windows(2).all(|pair| pair[0] == pair[1])
}

fn sample_text(text: &str) -> String {
    if text.is_empty() {
        EMPTY_SAMPLE.to_string()
    } else {
        truncate_chars(text, MAX_SAMPLE_CHARS)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn page(url: &str, html: &str) -> Page {
        Page::fetched(url, html)
    }

    fn job(title: &str, salary: &str) -> String {
        format!(
            r#"<html><body>
            <div class="job-detail">
              <h1>{title}</h1>
              <dl><dt>給与</dt><dd>{salary}</dd></dl>
              <p class="company">Acme</p>
            </div>
            <aside class="related-jobs">
              <dl><dt>給与</dt><dd>月給20万円</dd></dl>
              <p class="company">Acme</p>
            </aside>
            </body></html>"#
        )
    }

    fn mapping(entries: &[(&str, &str)]) -> FieldMapping {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn three_pages() -> Vec<Page> {
        vec![
            page("https://jobs.example/1", &job("Engineer", "年収600万円")),
            page("https://jobs.example/2", &job("Designer", "年収500万円")),
            page("https://jobs.example/3", &job("Writer", "年収400万円")),
        ]
    }

    #[test]
    fn full_hit_is_confident_and_required() {
        let results = validate(&mapping(&[("title", "//h1")]), &three_pages());
        let title = &results["title"];
        assert_eq!(title.confidence, 1.0);
        assert!(!title.optional);
        assert!(title.warning.is_none());
        assert_eq!(
            title.samples,
            vec![
                Some("Engineer".to_string()),
                Some("Designer".to_string()),
                Some("Writer".to_string())
            ]
        );
    }

    #[test]
    fn no_hit_gives_zero_and_null_samples() {
        let results = validate(
            &mapping(&[("phone", "//span[@class='tel']")]),
            &three_pages(),
        );
        let phone = &results["phone"];
        assert_eq!(phone.confidence, 0.0);
        assert!(phone.optional);
        assert_eq!(phone.samples, vec![None, None, None]);
        assert!(phone.warning.is_none());
    }

    #[test]
    fn partial_hits_are_optional() {
        let pages = vec![
            page("https://a.example/1", "<html><body><h2>x</h2></body></html>"),
            page("https://a.example/2", "<html><body><p>y</p></body></html>"),
        ];
        let results = validate(&mapping(&[("sub", "//h2")]), &pages);
        assert_eq!(results["sub"].confidence, 0.5);
        assert!(results["sub"].optional);
        assert_eq!(results["sub"].samples, vec![Some("x".to_string()), None]);
    }

    #[test]
    fn identical_duplicates_do_not_warn() {
        let results = validate(
            &mapping(&[("company", "//p[contains(@class,'company')]")]),
            &three_pages(),
        );
        let company = &results["company"];
        assert_eq!(company.confidence, 1.0);
        assert!(company.warning.is_none());
    }

    #[test]
    fn divergent_duplicates_warn_and_prefer_main_content() {
        let results = validate(
            &mapping(&[("salary", "//dt[text()='給与']/following-sibling::dd[1]")]),
            &three_pages(),
        );
        let salary = &results["salary"];
        assert!(salary.warning.is_some());
        assert_eq!(
            salary.samples,
            vec![
                Some("年収600万円".to_string()),
                Some("年収500万円".to_string()),
                Some("年収400万円".to_string())
            ]
        );
    }

    #[test]
    fn reported_selector_is_the_text_given() {
        let html = r#"<html><body><ul class="tags"><li>Rust</li></ul></body></html>"#;
        let text = "//ul[@class='tags']/li";
        let results = validate(&mapping(&[("tag", text)]), &[page("u", html)]);
        assert_eq!(results["tag"].selector, text);
        assert_eq!(results["tag"].confidence, 1.0);
    }

    #[test]
    fn longer_text_breaks_score_ties() {
        let html = "<html><body><div><span>ab</span><span>abcd</span></div></body></html>";
        let results = validate(&mapping(&[("v", "//span")]), &[page("u", html)]);
        assert_eq!(results["v"].samples, vec![Some("abcd".to_string())]);
    }

    #[test]
    fn unparsable_selector_yields_error_samples() {
        let results = validate(&mapping(&[("bad", "//div[")]), &three_pages());
        let bad = &results["bad"];
        assert_eq!(bad.confidence, 0.0);
        assert!(bad.optional);
        assert_eq!(bad.samples, vec![Some(ERROR_SAMPLE.to_string()); 3]);
    }

    #[test]
    fn non_node_selector_is_an_evaluation_error() {
        let results = validate(&mapping(&[("n", "count(//h1)")]), &three_pages());
        assert_eq!(results["n"].samples, vec![Some(ERROR_SAMPLE.to_string()); 3]);
        assert_eq!(results["n"].confidence, 0.0);
    }

    #[test]
    fn empty_and_long_samples() {
        let long = "x".repeat(250);
        let html = format!("<html><body><p class='e'> </p><p class='l'>{long}</p></body></html>");
        let results = validate(
            &mapping(&[("empty", "//p[@class='e']"), ("long", "//p[@class='l']")]),
            &[page("u", &html)],
        );
        assert_eq!(results["empty"].samples, vec![Some(EMPTY_SAMPLE.to_string())]);
        assert_eq!(results["empty"].confidence, 1.0);
        let sample = results["long"].samples[0].as_deref().unwrap_or_default();
        assert_eq!(sample.chars().count(), MAX_SAMPLE_CHARS);
    }

    #[test]
    fn attribute_selectors_sample_the_value() {
        let html = r#"<html><body><a href="/jobs/1">Apply</a></body></html>"#;
        let results = validate(&mapping(&[("link", "//a/@href")]), &[page("u", html)]);
        assert_eq!(results["link"].samples, vec![Some("/jobs/1".to_string())]);
    }

    #[test]
    fn samples_align_with_parsed_pages_only() {
        let mut pages = three_pages();
        pages.insert(
            1,
            Page::failed(
                "https://jobs.example/x",
                genie_shared::FetchError::Status { status: 404 },
            ),
        );
        let results = validate(&mapping(&[("title", "//h1")]), &pages);
        assert_eq!(results["title"].samples.len(), 3);
        assert_eq!(results["title"].confidence, 1.0);
    }

    #[test]
    fn no_valid_pages_gives_empty_result() {
        let pages = vec![Page::failed(
            "https://jobs.example/x",
            genie_shared::FetchError::Timeout { secs: 15 },
        )];
        assert!(validate(&mapping(&[("title", "//h1")]), &pages).is_empty());
    }

    #[test]
    fn confidence_is_hits_over_pages() {
        let pages: Vec<Page> = (0..4)
            .map(|i| {
                let body = if i % 2 == 0 { "<b>k</b>" } else { "<i>k</i>" };
                page(&format!("u{i}"), &format!("<html><body>{body}</body></html>"))
            })
            .collect();
        let results = validate(&mapping(&[("b", "//b"), ("i", "//i"), ("x", "//b | //i")]), &pages);
        assert_eq!(results["b"].confidence, 0.5);
        assert_eq!(results["i"].confidence, 0.5);
        assert_eq!(results["x"].confidence, 1.0);
        for result in results.values() {
            assert!((0.0..=1.0).contains(&result.confidence));
            assert_eq!(result.samples.len(), 4);
        }
    }
}
