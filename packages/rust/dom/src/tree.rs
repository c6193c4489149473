//! Owned markup tree.
//!
//! Markup is parsed with `scraper` (html5ever underneath, so any input yields
//! a tree) and copied into plain owned structs that the compressor can mutate
//! freely. Comments, doctypes and processing instructions are dropped.

use scraper::{ElementRef, Html};

/// Child-index path from the document node. `[]` is the document itself.
pub type NodePath = Vec<usize>;

/// Elements that never have children or a closing tag.
const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

/// Elements whose text is written without escaping.
const RAW_TEXT_TAGS: &[&str] = &["script", "style"];

/// Markup that cannot become a document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("markup is empty")]
    Empty,
}

// ---------------------------------------------------------------------------
// Node / Element
// ---------------------------------------------------------------------------

/// A child of an element or of the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

impl Node {
    pub fn as_element(&self) -> Option<&Element> {
        match self {
            Self::Element(el) => Some(el),
            Self::Text(_) => None,
        }
    }

    pub fn as_element_mut(&mut self) -> Option<&mut Element> {
        match self {
            Self::Element(el) => Some(el),
            Self::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Element(_) => None,
        }
    }

    /// True for text nodes that are empty or whitespace only.
    pub fn is_blank_text(&self) -> bool {
        matches!(self, Self::Text(text) if text.trim().is_empty())
    }
}

/// An element with its attributes (in source order) and children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    /// Lowercase tag name.
    pub name: String,
    /// Sorted by name when built by [`Document::parse`].
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    /// An element with no attributes or children.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Whitespace-separated tokens of the `class` attribute.
    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attr("class").unwrap_or_default().split_whitespace()
    }

    pub fn has_class(&self, token: &str) -> bool {
        self.classes().any(|class| class == token)
    }

    /// `class` and `id` joined by a space, for pattern classifiers.
    pub fn class_and_id(&self) -> String {
        format!(
            "{} {}",
            self.attr("class").unwrap_or_default(),
            self.attr("id").unwrap_or_default()
        )
    }

    pub fn element_children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(Node::as_element)
    }

    /// Concatenated text of all descendant text nodes.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        for child in &self.children {
            match child {
                Node::Text(text) => out.push_str(text),
                Node::Element(el) => el.collect_text(out),
            }
        }
    }

    /// Length of [`text_content`](Self::text_content) in characters.
    pub fn text_len(&self) -> usize {
        self.children
            .iter()
            .map(|child| match child {
                Node::Text(text) => text.chars().count(),
                Node::Element(el) => el.text_len(),
            })
            .sum()
    }

    /// Node at `path` relative to this element.
    pub fn get(&self, path: &[usize]) -> Option<&Node> {
        let (first, rest) = path.split_first()?;
        let mut node = self.children.get(*first)?;
        for &index in rest {
            node = node.as_element()?.children.get(index)?;
        }
        Some(node)
    }

    /// Serialize this element and its subtree as HTML.
    pub fn outer_html(&self) -> String {
        let mut out = String::new();
        self.write_html(&mut out);
        out
    }

    fn write_html(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attrs {
            out.push(' ');
            out.push_str(key);
            out.push_str("=\"");
            escape_into(value, true, out);
            out.push('"');
        }
        out.push('>');

        if VOID_TAGS.contains(&self.name.as_str()) {
            return;
        }

        let raw = RAW_TEXT_TAGS.contains(&self.name.as_str());
        for child in &self.children {
            match child {
                Node::Text(text) if raw => out.push_str(text),
                Node::Text(text) => escape_into(text, false, out),
                Node::Element(el) => el.write_html(out),
            }
        }

        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

fn escape_into(text: &str, attribute: bool, out: &mut String) {
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' if !attribute => out.push_str("&lt;"),
            '>' if !attribute => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            _ => out.push(ch),
        }
    }
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// Borrowed view of whatever sits at a [`NodePath`].
#[derive(Debug, Clone, Copy)]
pub enum NodeRef<'a> {
    Document(&'a Document),
    Element(&'a Element),
    Text(&'a str),
}

/// A parsed document: the (virtual) document node and its children.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Document {
    pub children: Vec<Node>,
}

impl Document {
    /// Parse markup leniently. Only blank input is rejected.
    pub fn parse(markup: &str) -> Result<Self, ParseError> {
        if markup.trim().is_empty() {
            return Err(ParseError::Empty);
        }
        let html = Html::parse_document(markup);
        let root = convert_element(html.root_element());
        Ok(Self {
            children: vec![Node::Element(root)],
        })
    }

    /// A document whose only child is `root`.
    pub fn from_element(root: Element) -> Self {
        Self {
            children: vec![Node::Element(root)],
        }
    }

    /// The first element child of the document node (normally `<html>`).
    pub fn root_element(&self) -> Option<&Element> {
        self.children.iter().find_map(Node::as_element)
    }

    pub fn node(&self, path: &[usize]) -> Option<NodeRef<'_>> {
        let Some((first, rest)) = path.split_first() else {
            return Some(NodeRef::Document(self));
        };
        let mut node = self.children.get(*first)?;
        for &index in rest {
            node = node.as_element()?.children.get(index)?;
        }
        Some(match node {
            Node::Element(el) => NodeRef::Element(el),
            Node::Text(text) => NodeRef::Text(text),
        })
    }

    pub fn element(&self, path: &[usize]) -> Option<&Element> {
        match self.node(path)? {
            NodeRef::Element(el) => Some(el),
            _ => None,
        }
    }

    /// Children of the node at `path`; empty for text nodes and bad paths.
    pub fn children(&self, path: &[usize]) -> &[Node] {
        match self.node(path) {
            Some(NodeRef::Document(doc)) => &doc.children,
            Some(NodeRef::Element(el)) => &el.children,
            _ => &[],
        }
    }

    /// All nodes below `path`, in document order.
    pub fn descendants(&self, path: &[usize]) -> Vec<NodePath> {
        let mut out = Vec::new();
        let mut current = path.to_vec();
        collect_descendants(self.children(path), &mut current, &mut out);
        out
    }

    /// Paths of all elements matching `pred`, in document order.
    pub fn find_elements(&self, pred: impl Fn(&Element) -> bool) -> Vec<NodePath> {
        self.descendants(&[])
            .into_iter()
            .filter(|path| self.element(path).is_some_and(&pred))
            .collect()
    }

    /// XPath string-value of the node at `path`.
    pub fn string_value(&self, path: &[usize]) -> String {
        match self.node(path) {
            Some(NodeRef::Document(doc)) => doc
                .children
                .iter()
                .map(|child| match child {
                    Node::Element(el) => el.text_content(),
                    Node::Text(text) => text.clone(),
                })
                .collect(),
            Some(NodeRef::Element(el)) => el.text_content(),
            Some(NodeRef::Text(text)) => text.to_string(),
            None => String::new(),
        }
    }

    /// HTML of the node at `path` (text nodes are escaped).
    pub fn outer_html(&self, path: &[usize]) -> String {
        match self.node(path) {
            Some(NodeRef::Document(doc)) => doc
                .children
                .iter()
                .map(|child| match child {
                    Node::Element(el) => el.outer_html(),
                    Node::Text(text) => {
                        let mut out = String::new();
                        escape_into(text, false, &mut out);
                        out
                    }
                })
                .collect(),
            Some(NodeRef::Element(el)) => el.outer_html(),
            Some(NodeRef::Text(text)) => {
                let mut out = String::new();
                escape_into(text, false, &mut out);
                out
            }
            None => String::new(),
        }
    }
}

fn collect_descendants(children: &[Node], current: &mut NodePath, out: &mut Vec<NodePath>) {
    for (index, child) in children.iter().enumerate() {
        current.push(index);
        out.push(current.clone());
        if let Node::Element(el) = child {
            collect_descendants(&el.children, current, out);
        }
        current.pop();
    }
}

/// Element ancestors of `path`, nearest first. The document node is excluded.
pub fn ancestor_paths(path: &[usize]) -> impl Iterator<Item = &[usize]> {
    (1..path.len()).rev().map(move |len| &path[..len])
}

fn convert_element(el: ElementRef<'_>) -> Element {
    let mut children = Vec::new();
    for child in el.children() {
        if let Some(child_el) = ElementRef::wrap(child) {
            children.push(Node::Element(convert_element(child_el)));
        } else if let Some(text) = child.value().as_text() {
            children.push(Node::Text(String::from(&**text)));
        }
    }

    // Attribute storage order inside the parser is not guaranteed; sort so
    // serialization is stable across parses.
    let mut attrs: Vec<(String, String)> = el
        .value()
        .attrs()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    attrs.sort();

    Element {
        name: el.value().name().to_ascii_lowercase(),
        attrs,
        children,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Document {
        Document::parse(
            r#"<html><head><title>T</title></head><body>
            <div class="item main" id="x"><p>Hello <b>world</b></p></div>
            <!-- comment --><br>
            </body></html>"#,
        )
        .expect("parse")
    }

    #[test]
    fn parse_rejects_blank_markup() {
        assert_eq!(Document::parse("   \n").unwrap_err(), ParseError::Empty);
    }

    #[test]
    fn parse_builds_html_root_and_drops_comments() {
        let doc = sample();
        let root = doc.root_element().expect("root");
        assert_eq!(root.name, "html");
        let html = root.outer_html();
        assert!(!html.contains("comment"));
        assert!(html.contains(r#"<div class="item main" id="x">"#));
        assert!(html.contains("<br>"));
        assert!(!html.contains("</br>"));
    }

    #[test]
    fn lenient_parse_of_fragment() {
        let doc = Document::parse("<td>cell</td><span>loose").expect("parse");
        let body = doc.find_elements(|el| el.name == "span");
        assert_eq!(body.len(), 1);
        assert_eq!(doc.string_value(&body[0]), "loose");
    }

    #[test]
    fn element_helpers() {
        let doc = sample();
        let div_path = doc.find_elements(|el| el.name == "div").remove(0);
        let div = doc.element(&div_path).expect("div");
        assert!(div.has_class("main"));
        assert!(!div.has_class("mai"));
        assert_eq!(div.class_and_id(), "item main x");
        assert_eq!(div.text_content(), "Hello world");
        assert_eq!(div.text_len(), 11);
    }

    #[test]
    fn paths_are_document_ordered_and_prefix_ancestors() {
        let doc = sample();
        let all = doc.descendants(&[]);
        let mut sorted = all.clone();
        sorted.sort();
        assert_eq!(all, sorted);

        let bold = doc.find_elements(|el| el.name == "b").remove(0);
        let names: Vec<&str> = ancestor_paths(&bold)
            .filter_map(|p| doc.element(p))
            .map(|el| el.name.as_str())
            .collect();
        assert_eq!(names, vec!["p", "div", "body", "html"]);
    }

    #[test]
    fn serialization_escapes_text_and_attributes() {
        let mut el = Element::new("a");
        el.attrs.push(("title".into(), "say \"hi\" & bye".into()));
        el.children.push(Node::Text("1 < 2 & 3".into()));
        assert_eq!(
            el.outer_html(),
            r#"<a title="say &quot;hi&quot; &amp; bye">1 &lt; 2 &amp; 3</a>"#
        );
    }

    #[test]
    fn node_lookup_by_path() {
        let doc = sample();
        assert!(matches!(doc.node(&[]), Some(NodeRef::Document(_))));
        assert!(matches!(doc.node(&[0]), Some(NodeRef::Element(el)) if el.name == "html"));
        assert!(doc.node(&[0, 99]).is_none());
        assert!(doc.children(&[0, 99]).is_empty());
    }
}
