//! XPath-subset selectors.
//!
//! A [`Selector`] wraps a parsed [`Expr`] and serializes back to canonical
//! abbreviated text through `Display`. Narrowing and scoping edit the [`LocationPath`] steps
//! directly and re-serialize; selector text is never spliced.

mod eval;
mod parser;

use std::fmt;

use crate::tree::{Document, NodePath, NodeRef};

pub use parser::parse;

/// Why a selector could not be parsed or evaluated.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SelectorError {
    #[error("syntax error at {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("unsupported function {0}()")]
    UnsupportedFunction(String),

    #[error("unsupported axis {0}")]
    UnsupportedAxis(String),

    #[error("{function}() expects {expected} argument(s)")]
    Arity {
        function: String,
        expected: &'static str,
    },

    #[error("expression does not select nodes")]
    NotNodeSet,
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Child,
    Descendant,
    DescendantOrSelf,
    SelfAxis,
    Parent,
    Ancestor,
    AncestorOrSelf,
    FollowingSibling,
    PrecedingSibling,
    Following,
    Preceding,
    Attribute,
}

impl Axis {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "child" => Self::Child,
            "descendant" => Self::Descendant,
            "descendant-or-self" => Self::DescendantOrSelf,
            "self" => Self::SelfAxis,
            "parent" => Self::Parent,
            "ancestor" => Self::Ancestor,
            "ancestor-or-self" => Self::AncestorOrSelf,
            "following-sibling" => Self::FollowingSibling,
            "preceding-sibling" => Self::PrecedingSibling,
            "following" => Self::Following,
            "preceding" => Self::Preceding,
            "attribute" => Self::Attribute,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            Self::Child => "child",
            Self::Descendant => "descendant",
            Self::DescendantOrSelf => "descendant-or-self",
            Self::SelfAxis => "self",
            Self::Parent => "parent",
            Self::Ancestor => "ancestor",
            Self::AncestorOrSelf => "ancestor-or-self",
            Self::FollowingSibling => "following-sibling",
            Self::PrecedingSibling => "preceding-sibling",
            Self::Following => "following",
            Self::Preceding => "preceding",
            Self::Attribute => "attribute",
        }
    }

    /// Reverse axes count predicate positions from the context node outward.
    fn is_reverse(self) -> bool {
        matches!(
            self,
            Self::Parent | Self::Ancestor | Self::AncestorOrSelf | Self::PrecedingSibling | Self::Preceding
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeTest {
    /// Element (or attribute, on the attribute axis) with this name.
    Name(String),
    /// `*`
    Any,
    /// `text()`
    Text,
    /// `node()`
    Node,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub axis: Axis,
    pub test: NodeTest,
    pub predicates: Vec<Expr>,
}

impl Step {
    /// `child::name`
    pub fn child(name: impl Into<String>) -> Self {
        Self {
            axis: Axis::Child,
            test: NodeTest::Name(name.into()),
            predicates: Vec::new(),
        }
    }

    /// The implicit step behind `//`.
    pub fn descendant_or_self() -> Self {
        Self {
            axis: Axis::DescendantOrSelf,
            test: NodeTest::Node,
            predicates: Vec::new(),
        }
    }

    /// `child::name[contains(@class,'token')]`
    pub fn child_with_class(name: impl Into<String>, token: impl Into<String>) -> Self {
        let mut step = Self::child(name);
        step.predicates.push(Expr::Function {
            name: "contains".into(),
            args: vec![
                Expr::Path(LocationPath {
                    absolute: false,
                    steps: vec![Step {
                        axis: Axis::Attribute,
                        test: NodeTest::Name("class".into()),
                        predicates: Vec::new(),
                    }],
                }),
                Expr::Literal(token.into()),
            ],
        });
        step
    }

    /// Whether this step is what `//` abbreviates.
    pub fn is_descendant_joint(&self) -> bool {
        self.axis == Axis::DescendantOrSelf && self.test == NodeTest::Node && self.predicates.is_empty()
    }

    /// Steps that select strings rather than elements (`@x`, `text()`).
    pub fn selects_value(&self) -> bool {
        self.axis == Axis::Attribute || self.test == NodeTest::Text
    }

    /// The class token this step filters on, from `contains(@class,'t')` or
    /// `@class='t'`. Only the first whitespace-separated token counts.
    pub fn class_token(&self) -> Option<&str> {
        self.predicates.iter().find_map(|pred| {
            let literal = match pred {
                Expr::Function { name, args } if name == "contains" && args.len() == 2 => {
                    is_class_attribute(&args[0]).then_some(&args[1])?
                }
                Expr::Binary {
                    op: BinaryOp::Eq,
                    lhs,
                    rhs,
                } => is_class_attribute(lhs).then_some(rhs.as_ref())?,
                _ => return None,
            };
            match literal {
                Expr::Literal(text) => text.split_whitespace().next(),
                _ => None,
            }
        })
    }
}

fn is_class_attribute(expr: &Expr) -> bool {
    match expr {
        Expr::Path(path) => {
            !path.absolute
                && path.steps.len() == 1
                && path.steps[0].axis == Axis::Attribute
                && path.steps[0].test == NodeTest::Name("class".into())
        }
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocationPath {
    pub absolute: bool,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Union,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Or => "or",
            Self::And => "and",
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Union => "|",
        }
    }

    fn precedence(self) -> u8 {
        match self {
            Self::Or => 1,
            Self::And => 2,
            Self::Eq | Self::Ne => 3,
            Self::Lt | Self::Le | Self::Gt | Self::Ge => 4,
            Self::Add | Self::Sub => 5,
            Self::Union => 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Path(LocationPath),
    /// `primary[pred]/steps`, e.g. `(//a)[1]/@href`.
    Filter {
        primary: Box<Expr>,
        predicates: Vec<Expr>,
        steps: Vec<Step>,
    },
    Literal(String),
    Number(f64),
    Function {
        name: String,
        args: Vec<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Negate(Box<Expr>),
}

impl Expr {
    fn precedence(&self) -> u8 {
        match self {
            Self::Binary { op, .. } => op.precedence(),
            Self::Negate(_) => 6,
            _ => 8,
        }
    }
}

// ---------------------------------------------------------------------------
// Serialization (abbreviated syntax)
// ---------------------------------------------------------------------------

impl fmt::Display for NodeTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Any => f.write_str("*"),
            Self::Text => f.write_str("text()"),
            Self::Node => f.write_str("node()"),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_descendant_joint() {
            // Rendered by the surrounding separators.
            return Ok(());
        }
        let bare_node = self.test == NodeTest::Node && self.predicates.is_empty();
        match self.axis {
            Axis::SelfAxis if bare_node => return f.write_str("."),
            Axis::Parent if bare_node => return f.write_str(".."),
            Axis::Child => {}
            Axis::Attribute => f.write_str("@")?,
            axis => write!(f, "{}::", axis.name())?,
        }
        write!(f, "{}", self.test)?;
        for pred in &self.predicates {
            write!(f, "[{pred}]")?;
        }
        Ok(())
    }
}

fn write_steps(f: &mut fmt::Formatter<'_>, steps: &[Step]) -> fmt::Result {
    for (i, step) in steps.iter().enumerate() {
        if i > 0 {
            f.write_str("/")?;
        }
        write!(f, "{step}")?;
    }
    Ok(())
}

impl fmt::Display for LocationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.absolute {
            f.write_str("/")?;
        }
        write_steps(f, &self.steps)
    }
}

fn write_literal(f: &mut fmt::Formatter<'_>, text: &str) -> fmt::Result {
    if !text.contains('\'') {
        return write!(f, "'{text}'");
    }
    if !text.contains('"') {
        return write!(f, "\"{text}\"");
    }
    // No single literal can hold both quote kinds.
    let mut args = Vec::new();
    for (i, part) in text.split('\'').enumerate() {
        if i > 0 {
            args.push("\"'\"".to_string());
        }
        if !part.is_empty() {
            args.push(format!("'{part}'"));
        }
    }
    write!(f, "concat({})", args.join(","))
}

fn write_operand(f: &mut fmt::Formatter<'_>, expr: &Expr, min_precedence: u8) -> fmt::Result {
    if expr.precedence() < min_precedence {
        write!(f, "({expr})")
    } else {
        write!(f, "{expr}")
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{path}"),
            Self::Filter {
                primary,
                predicates,
                steps,
            } => {
                match primary.as_ref() {
                    Self::Function { .. } | Self::Literal(_) | Self::Number(_) => {
                        write!(f, "{primary}")?
                    }
                    other => write!(f, "({other})")?,
                }
                for pred in predicates {
                    write!(f, "[{pred}]")?;
                }
                if !steps.is_empty() {
                    f.write_str("/")?;
                    write_steps(f, steps)?;
                }
                Ok(())
            }
            Self::Literal(text) => write_literal(f, text),
            Self::Number(n) if n.fract() == 0.0 && n.is_finite() => write!(f, "{}", *n as i64),
            Self::Number(n) => write!(f, "{n}"),
            Self::Function { name, args } => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
            Self::Binary { op, lhs, rhs } => {
                let prec = op.precedence();
                write_operand(f, lhs, prec)?;
                if *op == BinaryOp::Union {
                    f.write_str(" | ")?;
                } else {
                    write!(f, " {} ", op.symbol())?;
                }
                // Left-associative: a right operand at the same level needs parens.
                write_operand(f, rhs, prec + 1)
            }
            Self::Negate(inner) => {
                f.write_str("-")?;
                write_operand(f, inner, 6)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

/// One selected node: a tree node, or an attribute of an element.
///
/// Ordering is document order: an element sorts before its attributes, which
/// sort before its children.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Item {
    pub path: NodePath,
    /// Attribute index on the element at `path`.
    pub attr: Option<usize>,
}

impl Item {
    pub fn node(path: NodePath) -> Self {
        Self { path, attr: None }
    }

    pub fn document() -> Self {
        Self::node(Vec::new())
    }

    /// The element this item belongs to: itself, its owner (attributes) or
    /// its parent (text nodes).
    pub fn element_path(&self, doc: &Document) -> Option<NodePath> {
        if self.attr.is_some() {
            return Some(self.path.clone());
        }
        match doc.node(&self.path)? {
            NodeRef::Element(_) => Some(self.path.clone()),
            NodeRef::Text(_) => {
                let parent = &self.path[..self.path.len().saturating_sub(1)];
                doc.element(parent).map(|_| parent.to_vec())
            }
            NodeRef::Document(_) => None,
        }
    }

    /// XPath string-value.
    pub fn string_value(&self, doc: &Document) -> String {
        match self.attr {
            Some(index) => doc
                .element(&self.path)
                .and_then(|el| el.attrs.get(index))
                .map(|(_, value)| value.clone())
                .unwrap_or_default(),
            None => doc.string_value(&self.path),
        }
    }
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// A parsed selector expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    expr: Expr,
}

impl Selector {
    /// Parse selector text.
    pub fn parse(text: &str) -> Result<Self, SelectorError> {
        Ok(Self { expr: parse(text)? })
    }

    /// Wrap an already-built location path.
    pub fn from_path(path: LocationPath) -> Self {
        Self {
            expr: Expr::Path(path),
        }
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// The location path, when the whole selector is a single path.
    pub fn location_path(&self) -> Option<&LocationPath> {
        match &self.expr {
            Expr::Path(path) => Some(path),
            _ => None,
        }
    }

    /// Evaluate against `doc`, returning matches in document order.
    pub fn select(&self, doc: &Document) -> Result<Vec<Item>, SelectorError> {
        eval::select(doc, &self.expr)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)
    }
}

impl std::str::FromStr for Selector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(text: &str) -> String {
        Selector::parse(text).expect("parse").to_string()
    }

    #[test]
    fn serializes_abbreviated_forms() {
        assert_eq!(roundtrip("//div[contains(@class, 'price')]"), "//div[contains(@class,'price')]");
        assert_eq!(roundtrip("/html/body//h1"), "/html/body//h1");
        assert_eq!(roundtrip("//a/@href"), "//a/@href");
        assert_eq!(roundtrip(".//span/text()"), ".//span/text()");
        assert_eq!(roundtrip("//td/.."), "//td/..");
        assert_eq!(
            roundtrip("//dt[text()=\"勤務地\"]/following-sibling::dd[1]"),
            "//dt[text() = '勤務地']/following-sibling::dd[1]"
        );
    }

    #[test]
    fn serializes_operators_with_needed_parens() {
        assert_eq!(
            roundtrip("//div[(@id='a' or @id='b') and @class]"),
            "//div[(@id = 'a' or @id = 'b') and @class]"
        );
        assert_eq!(roundtrip("(//li)[last()]"), "(//li)[last()]");
        assert_eq!(roundtrip("//h1 | //h2"), "//h1 | //h2");
    }

    #[test]
    fn class_token_extraction() {
        let sel = Selector::parse("//div[contains(@class,'job-detail main')]//dd").expect("parse");
        let path = sel.location_path().expect("path");
        assert_eq!(path.steps[1].class_token(), Some("job-detail"));
        assert_eq!(path.steps[3].class_token(), None);

        let sel = Selector::parse("//section[@class='spec']").expect("parse");
        assert_eq!(sel.location_path().unwrap().steps[1].class_token(), Some("spec"));
    }

    #[test]
    fn built_steps_serialize() {
        let path = LocationPath {
            absolute: true,
            steps: vec![
                Step::descendant_or_self(),
                Step::child_with_class("div", "detail"),
                Step::descendant_or_self(),
                Step::child("dd"),
            ],
        };
        assert_eq!(Selector::from_path(path).to_string(), "//div[contains(@class,'detail')]//dd");
    }

    #[test]
    fn literals_with_both_quotes_serialize_as_concat() {
        let path = LocationPath {
            absolute: true,
            steps: vec![Step::descendant_or_self(), Step::child_with_class("p", r#"it's "x""#)],
        };
        let text = Selector::from_path(path).to_string();
        assert_eq!(text, r#"//p[contains(@class,concat('it',"'",'s "x"'))]"#);

        let doc = Document::parse(r#"<p class="it's &quot;x&quot;">hit</p><p class="its">miss</p>"#)
            .expect("parse");
        let hits = Selector::parse(&text).expect("reparse").select(&doc).expect("select");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].string_value(&doc), "hit");
    }
}
