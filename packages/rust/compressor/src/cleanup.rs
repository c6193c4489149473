//! Tree pruning passes.
//!
//! All passes work in place on owned elements. Text "tails" are ordinary
//! sibling text nodes here, so a pass that drops an element never drops the
//! text that follows it.

use std::sync::LazyLock;

use genie_dom::{Element, Node};
use regex::Regex;

/// Class/id tokens that mark boilerplate blocks.
static NOISE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)recommend|related|sidebar|widget|breadcrumb|modal|slide|footer|banner|\bad[-_]|popup|cookie|privacy|policy|inquiry|contact|sns[-_]|share",
    )
    .expect("valid regex")
});

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

static INTER_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r">\s+<").expect("valid regex"));

/// Empty elements that still say something about layout.
const KEEP_EMPTY: &[&str] = &["br", "hr", "img", "input"];

/// Whether `el` looks like boilerplate by its class/id. `<body>` never does.
pub fn is_noise(el: &Element) -> bool {
    el.name != "body" && NOISE_RE.is_match(&el.class_and_id())
}

/// Drop every element named in `tags`, at any depth.
pub fn remove_tags(children: &mut Vec<Node>, tags: &[&str]) {
    children.retain(|child| !matches!(child, Node::Element(el) if tags.contains(&el.name.as_str())));
    for child in children.iter_mut() {
        if let Node::Element(el) = child {
            remove_tags(&mut el.children, tags);
        }
    }
}

/// Drop noisy descendants of `el`, top-down. `el` itself is kept.
pub fn remove_noise(el: &mut Element) {
    el.children
        .retain(|child| !matches!(child, Node::Element(c) if is_noise(c)));
    for child in el.children.iter_mut() {
        if let Node::Element(c) = child {
            remove_noise(c);
        }
    }
}

/// Cut every text node longer than `limit` characters (after trimming) to
/// `limit` characters plus an ellipsis.
pub fn truncate_text(el: &mut Element, limit: usize) {
    for child in el.children.iter_mut() {
        match child {
            Node::Text(text) => {
                let trimmed = text.trim();
                if trimmed.chars().count() > limit {
                    let mut cut: String = trimmed.chars().take(limit).collect();
                    cut.push('…');
                    *text = cut;
                }
            }
            Node::Element(c) => truncate_text(c, limit),
        }
    }
}

/// Drop elements with no text, no children and no trailing text, bottom-up.
pub fn remove_empty(el: &mut Element) {
    for child in el.children.iter_mut() {
        if let Node::Element(c) = child {
            remove_empty(c);
        }
    }

    let keep: Vec<bool> = el
        .children
        .iter()
        .enumerate()
        .map(|(index, child)| match child {
            Node::Text(_) => true,
            Node::Element(c) => {
                KEEP_EMPTY.contains(&c.name.as_str())
                    || has_content(c)
                    || el
                        .children
                        .get(index + 1)
                        .is_some_and(|next| matches!(next, Node::Text(t) if !t.trim().is_empty()))
            }
        })
        .collect();

    let mut keep = keep.into_iter();
    el.children.retain(|_| keep.next().unwrap_or(true));
}

fn has_content(el: &Element) -> bool {
    el.children.iter().any(|child| match child {
        Node::Element(_) => true,
        Node::Text(text) => !text.trim().is_empty(),
    })
}

/// Collapse whitespace runs, then whitespace between tags.
pub fn collapse_whitespace(html: &str) -> String {
    let collapsed = WHITESPACE_RE.replace_all(html, " ");
    INTER_TAG_RE.replace_all(&collapsed, "><").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(markup: &str) -> Element {
        let doc = genie_dom::Document::parse(markup).expect("parse");
        doc.root_element().expect("root").clone()
    }

    #[test]
    fn noise_classifier() {
        let mut el = Element::new("div");
        el.attrs.push(("class".into(), "ad-slot".into()));
        assert!(is_noise(&el));

        el.attrs[0].1 = "header-shadow".into();
        assert!(!is_noise(&el), "'ad' must be a token prefix");

        el.attrs[0].1 = "SNS_share".into();
        assert!(is_noise(&el));

        let mut body = Element::new("body");
        body.attrs.push(("class".into(), "contact-page".into()));
        assert!(!is_noise(&body));
    }

    #[test]
    fn remove_tags_at_any_depth() {
        let mut root = element("<div><p>a<script>x()</script></p><style>p{}</style></div>");
        remove_tags(&mut root.children, &["script", "style"]);
        let html = root.outer_html();
        assert!(!html.contains("script"));
        assert!(!html.contains("style"));
        assert!(html.contains("<p>a</p>"));
    }

    #[test]
    fn remove_noise_is_top_down() {
        let mut root = element(
            r#"<div><div id="popup"><p>buy</p></div><section><div class="share-buttons">x</div><p>keep</p></section></div>"#,
        );
        remove_noise(&mut root);
        let html = root.outer_html();
        assert!(!html.contains("buy"));
        assert!(!html.contains("share-buttons"));
        assert!(html.contains("keep"));
    }

    #[test]
    fn truncation_counts_characters() {
        let mut root = element("<p>  あいうえおかきくけこさしすせそたちつてとなにぬねのはひふへほまみむめも  </p><p>short</p>");
        truncate_text(&mut root, 30);
        let html = root.outer_html();
        assert!(html.contains("<p>あいうえおかきくけこさしすせそたちつてとなにぬねのはひふへほ…</p>"));
        assert!(html.contains("<p>short</p>"));
    }

    #[test]
    fn remove_empty_keeps_void_layout_tags_and_tails() {
        let mut root = element(
            r#"<div><span></span><br><div><i></i></div><b></b>tail<img src="x.png"><p> </p></div>"#,
        );
        remove_empty(&mut root);
        let html = collapse_whitespace(&root.outer_html());
        assert!(!html.contains("<span>"));
        assert!(!html.contains("<i>"));
        assert!(!html.contains("<p>"));
        assert!(html.contains("<br>"));
        assert!(html.contains("<b></b>tail"));
        assert!(html.contains(r#"<img src="x.png">"#));
    }

    #[test]
    fn whitespace_collapse() {
        assert_eq!(
            collapse_whitespace("<div>\n  <p>a   b</p>\n</div>"),
            "<div><p>a b</p></div>"
        );
    }
}
