//! Evaluator for parsed selector expressions.
//!
//! Node-sets are kept sorted in document order and free of duplicates after
//! every step. Predicates see positions in axis order, so reverse axes count
//! outward from the context node.

use std::cell::OnceCell;

use super::{Axis, BinaryOp, Expr, Item, NodeTest, SelectorError, Step};
use crate::tree::{Document, NodePath, NodeRef};

type Result<T> = std::result::Result<T, SelectorError>;

/// Evaluate `expr` with the document node as context. Anything other than a
/// node-set is rejected.
pub(super) fn select(doc: &Document, expr: &Expr) -> Result<Vec<Item>> {
    let root = Item::document();
    let ctx = Context {
        item: &root,
        position: 1,
        size: 1,
    };
    let evaluator = Evaluator {
        doc,
        all_nodes: OnceCell::new(),
    };
    match evaluator.eval(expr, &ctx)? {
        Value::Nodes(items) => Ok(items),
        _ => Err(SelectorError::NotNodeSet),
    }
}

#[derive(Debug, Clone)]
enum Value {
    Nodes(Vec<Item>),
    Str(String),
    Num(f64),
    Bool(bool),
}

struct Context<'a> {
    item: &'a Item,
    position: usize,
    size: usize,
}

struct Evaluator<'a> {
    doc: &'a Document,
    /// Every node in document order, built on first use of `following` or
    /// `preceding`.
    all_nodes: OnceCell<Vec<NodePath>>,
}

impl Evaluator<'_> {
    // -----------------------------------------------------------------------
    // Conversions
    // -----------------------------------------------------------------------

    fn string(&self, value: &Value) -> String {
        match value {
            Value::Nodes(items) => items
                .first()
                .map(|item| item.string_value(self.doc))
                .unwrap_or_default(),
            Value::Str(text) => text.clone(),
            Value::Num(n) => number_to_string(*n),
            Value::Bool(b) => b.to_string(),
        }
    }

    fn number(&self, value: &Value) -> f64 {
        match value {
            Value::Num(n) => *n,
            Value::Bool(b) => f64::from(u8::from(*b)),
            other => string_to_number(&self.string(other)),
        }
    }

    fn boolean(value: &Value) -> bool {
        match value {
            Value::Nodes(items) => !items.is_empty(),
            Value::Str(text) => !text.is_empty(),
            Value::Num(n) => *n != 0.0 && !n.is_nan(),
            Value::Bool(b) => *b,
        }
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn eval(&self, expr: &Expr, ctx: &Context<'_>) -> Result<Value> {
        match expr {
            Expr::Path(path) => {
                let start = if path.absolute {
                    Item::document()
                } else {
                    ctx.item.clone()
                };
                self.apply_steps(vec![start], &path.steps).map(Value::Nodes)
            }
            Expr::Filter {
                primary,
                predicates,
                steps,
            } => {
                let Value::Nodes(items) = self.eval(primary, ctx)? else {
                    return Err(SelectorError::NotNodeSet);
                };
                let items = self.apply_predicates(items, predicates)?;
                self.apply_steps(items, steps).map(Value::Nodes)
            }
            Expr::Literal(text) => Ok(Value::Str(text.clone())),
            Expr::Number(n) => Ok(Value::Num(*n)),
            Expr::Negate(inner) => {
                let value = self.eval(inner, ctx)?;
                Ok(Value::Num(-self.number(&value)))
            }
            Expr::Function { name, args } => self.call(name, args, ctx),
            Expr::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs, ctx),
        }
    }

    fn binary(&self, op: BinaryOp, lhs: &Expr, rhs: &Expr, ctx: &Context<'_>) -> Result<Value> {
        match op {
            BinaryOp::Or => {
                let left = Self::boolean(&self.eval(lhs, ctx)?);
                Ok(Value::Bool(left || Self::boolean(&self.eval(rhs, ctx)?)))
            }
            BinaryOp::And => {
                let left = Self::boolean(&self.eval(lhs, ctx)?);
                Ok(Value::Bool(left && Self::boolean(&self.eval(rhs, ctx)?)))
            }
            BinaryOp::Union => {
                let (Value::Nodes(mut left), Value::Nodes(right)) =
                    (self.eval(lhs, ctx)?, self.eval(rhs, ctx)?)
                else {
                    return Err(SelectorError::NotNodeSet);
                };
                left.extend(right);
                left.sort();
                left.dedup();
                Ok(Value::Nodes(left))
            }
            BinaryOp::Add | BinaryOp::Sub => {
                let left = self.number(&self.eval(lhs, ctx)?);
                let right = self.number(&self.eval(rhs, ctx)?);
                Ok(Value::Num(if op == BinaryOp::Add {
                    left + right
                } else {
                    left - right
                }))
            }
            _ => {
                let left = self.eval(lhs, ctx)?;
                let right = self.eval(rhs, ctx)?;
                Ok(Value::Bool(self.compare(op, &left, &right)))
            }
        }
    }

    /// Comparison with node-set existential semantics.
    fn compare(&self, op: BinaryOp, left: &Value, right: &Value) -> bool {
        match (left, right) {
            (Value::Nodes(a), Value::Nodes(b)) => {
                let right_values: Vec<String> =
                    b.iter().map(|item| item.string_value(self.doc)).collect();
                a.iter().any(|item| {
                    let lv = item.string_value(self.doc);
                    right_values.iter().any(|rv| compare_strings(op, &lv, rv))
                })
            }
            (Value::Nodes(items), Value::Bool(_)) => {
                compare_atoms(op, &Value::Bool(!items.is_empty()), right, self)
            }
            (Value::Bool(_), Value::Nodes(items)) => {
                compare_atoms(op, left, &Value::Bool(!items.is_empty()), self)
            }
            (Value::Nodes(items), atom) => items.iter().any(|item| {
                compare_atoms(op, &Value::Str(item.string_value(self.doc)), atom, self)
            }),
            (atom, Value::Nodes(items)) => items.iter().any(|item| {
                compare_atoms(op, atom, &Value::Str(item.string_value(self.doc)), self)
            }),
            (a, b) => compare_atoms(op, a, b, self),
        }
    }

    // -----------------------------------------------------------------------
    // Location steps
    // -----------------------------------------------------------------------

    fn apply_steps(&self, mut items: Vec<Item>, steps: &[Step]) -> Result<Vec<Item>> {
        for step in steps {
            let mut next = Vec::new();
            for item in &items {
                let mut candidates: Vec<Item> = self
                    .axis_items(item, step.axis)
                    .into_iter()
                    .filter(|candidate| self.matches_test(candidate, step.axis, &step.test))
                    .collect();
                if step.axis.is_reverse() {
                    candidates.reverse();
                }
                next.extend(self.apply_predicates(candidates, &step.predicates)?);
            }
            next.sort();
            next.dedup();
            items = next;
        }
        Ok(items)
    }

    fn apply_predicates(&self, mut items: Vec<Item>, predicates: &[Expr]) -> Result<Vec<Item>> {
        for pred in predicates {
            let size = items.len();
            let mut kept = Vec::with_capacity(size);
            for (index, item) in items.into_iter().enumerate() {
                let position = index + 1;
                let ctx = Context {
                    item: &item,
                    position,
                    size,
                };
                let keep = match self.eval(pred, &ctx)? {
                    Value::Num(n) => n == position as f64,
                    other => Self::boolean(&other),
                };
                if keep {
                    kept.push(item);
                }
            }
            items = kept;
        }
        Ok(items)
    }

    /// Nodes along `axis` from `item`, in document order.
    fn axis_items(&self, item: &Item, axis: Axis) -> Vec<Item> {
        let doc = self.doc;
        let path = &item.path;

        if item.attr.is_some() {
            return match axis {
                Axis::SelfAxis => vec![item.clone()],
                Axis::Parent => vec![Item::node(path.clone())],
                Axis::Ancestor | Axis::AncestorOrSelf => {
                    let mut out: Vec<Item> =
                        (0..=path.len()).map(|len| Item::node(path[..len].to_vec())).collect();
                    if axis == Axis::AncestorOrSelf {
                        out.push(item.clone());
                    }
                    out
                }
                // The owner element's children come after its attributes.
                Axis::Following => self.following(path, true),
                Axis::Preceding => self.preceding(path),
                _ => Vec::new(),
            };
        }

        let child = |index: usize| {
            let mut p = path.clone();
            p.push(index);
            Item::node(p)
        };

        match axis {
            Axis::Child => (0..doc.children(path).len()).map(child).collect(),
            Axis::Descendant => doc.descendants(path).into_iter().map(Item::node).collect(),
            Axis::DescendantOrSelf => std::iter::once(item.clone())
                .chain(doc.descendants(path).into_iter().map(Item::node))
                .collect(),
            Axis::SelfAxis => vec![item.clone()],
            Axis::Parent => match path.split_last() {
                Some((_, parent)) => vec![Item::node(parent.to_vec())],
                None => Vec::new(),
            },
            Axis::Ancestor | Axis::AncestorOrSelf => {
                if path.is_empty() && axis == Axis::Ancestor {
                    return Vec::new();
                }
                let top = if axis == Axis::AncestorOrSelf {
                    path.len()
                } else {
                    path.len() - 1
                };
                (0..=top).map(|len| Item::node(path[..len].to_vec())).collect()
            }
            Axis::FollowingSibling | Axis::PrecedingSibling => {
                let Some((&index, parent)) = path.split_last() else {
                    return Vec::new();
                };
                let sibling = |i: usize| {
                    let mut p = parent.to_vec();
                    p.push(i);
                    Item::node(p)
                };
                if axis == Axis::FollowingSibling {
                    (index + 1..doc.children(parent).len()).map(sibling).collect()
                } else {
                    (0..index).map(sibling).collect()
                }
            }
            Axis::Following => self.following(path, false),
            Axis::Preceding => self.preceding(path),
            Axis::Attribute => match doc.element(path) {
                Some(el) => (0..el.attrs.len())
                    .map(|i| Item {
                        path: path.clone(),
                        attr: Some(i),
                    })
                    .collect(),
                None => Vec::new(),
            },
        }
    }

    fn all_nodes(&self) -> &[NodePath] {
        self.all_nodes.get_or_init(|| self.doc.descendants(&[]))
    }

    /// Nodes after `path` in document order. Its own descendants are
    /// skipped unless `with_descendants` is set.
    fn following(&self, path: &[usize], with_descendants: bool) -> Vec<Item> {
        let all = self.all_nodes();
        let start = all.partition_point(|p| p.as_slice() <= path);
        all[start..]
            .iter()
            .skip_while(|p| !with_descendants && p.starts_with(path))
            .cloned()
            .map(Item::node)
            .collect()
    }

    /// Nodes before `path` in document order, excluding its ancestors.
    fn preceding(&self, path: &[usize]) -> Vec<Item> {
        let all = self.all_nodes();
        let end = all.partition_point(|p| p.as_slice() < path);
        all[..end]
            .iter()
            .filter(|p| !path.starts_with(p))
            .cloned()
            .map(Item::node)
            .collect()
    }

    fn matches_test(&self, item: &Item, axis: Axis, test: &NodeTest) -> bool {
        if let Some(index) = item.attr {
            let Some((name, _)) = self.doc.element(&item.path).and_then(|el| el.attrs.get(index))
            else {
                return false;
            };
            return match test {
                NodeTest::Name(wanted) => axis == Axis::Attribute && name.eq_ignore_ascii_case(wanted),
                NodeTest::Any => axis == Axis::Attribute,
                NodeTest::Node => true,
                NodeTest::Text => false,
            };
        }

        match self.doc.node(&item.path) {
            Some(NodeRef::Element(el)) => match test {
                NodeTest::Name(wanted) => el.name.eq_ignore_ascii_case(wanted),
                NodeTest::Any | NodeTest::Node => true,
                NodeTest::Text => false,
            },
            Some(NodeRef::Text(_)) => matches!(test, NodeTest::Text | NodeTest::Node),
            Some(NodeRef::Document(_)) => matches!(test, NodeTest::Node),
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Functions
    // -----------------------------------------------------------------------

    fn call(&self, name: &str, args: &[Expr], ctx: &Context<'_>) -> Result<Value> {
        let values = args
            .iter()
            .map(|arg| self.eval(arg, ctx))
            .collect::<Result<Vec<_>>>()?;
        let arity = |min: usize, max: usize, expected: &'static str| {
            if values.len() < min || values.len() > max {
                Err(SelectorError::Arity {
                    function: name.to_string(),
                    expected,
                })
            } else {
                Ok(())
            }
        };
        // String argument `i`, defaulting to the context node.
        let string_arg = |i: usize| match values.get(i) {
            Some(value) => self.string(value),
            None => ctx.item.string_value(self.doc),
        };

        Ok(match name {
            "last" => {
                arity(0, 0, "0")?;
                Value::Num(ctx.size as f64)
            }
            "position" => {
                arity(0, 0, "0")?;
                Value::Num(ctx.position as f64)
            }
            "count" => {
                arity(1, 1, "1")?;
                match &values[0] {
                    Value::Nodes(items) => Value::Num(items.len() as f64),
                    _ => return Err(SelectorError::NotNodeSet),
                }
            }
            "string" => {
                arity(0, 1, "0 or 1")?;
                Value::Str(string_arg(0))
            }
            "concat" => {
                arity(2, usize::MAX, "2 or more")?;
                Value::Str(values.iter().map(|v| self.string(v)).collect())
            }
            "contains" => {
                arity(2, 2, "2")?;
                Value::Bool(string_arg(0).contains(&string_arg(1)))
            }
            "starts-with" => {
                arity(2, 2, "2")?;
                Value::Bool(string_arg(0).starts_with(&string_arg(1)))
            }
            "ends-with" => {
                arity(2, 2, "2")?;
                Value::Bool(string_arg(0).ends_with(&string_arg(1)))
            }
            "substring-before" => {
                arity(2, 2, "2")?;
                let haystack = string_arg(0);
                let needle = string_arg(1);
                Value::Str(
                    haystack
                        .find(&needle)
                        .map(|at| haystack[..at].to_string())
                        .unwrap_or_default(),
                )
            }
            "substring-after" => {
                arity(2, 2, "2")?;
                let haystack = string_arg(0);
                let needle = string_arg(1);
                Value::Str(
                    haystack
                        .find(&needle)
                        .map(|at| haystack[at + needle.len()..].to_string())
                        .unwrap_or_default(),
                )
            }
            "substring" => {
                arity(2, 3, "2 or 3")?;
                let text = string_arg(0);
                let start = round(self.number(&values[1]));
                let end = match values.get(2) {
                    Some(len) => start + round(self.number(len)),
                    None => f64::INFINITY,
                };
                Value::Str(
                    text.chars()
                        .enumerate()
                        .filter(|&(i, _)| {
                            let pos = (i + 1) as f64;
                            pos >= start && pos < end
                        })
                        .map(|(_, ch)| ch)
                        .collect(),
                )
            }
            "normalize-space" => {
                arity(0, 1, "0 or 1")?;
                Value::Str(string_arg(0).split_whitespace().collect::<Vec<_>>().join(" "))
            }
            "string-length" => {
                arity(0, 1, "0 or 1")?;
                Value::Num(string_arg(0).chars().count() as f64)
            }
            "translate" => {
                arity(3, 3, "3")?;
                let from: Vec<char> = string_arg(1).chars().collect();
                let to: Vec<char> = string_arg(2).chars().collect();
                Value::Str(
                    string_arg(0)
                        .chars()
                        .filter_map(|ch| match from.iter().position(|&f| f == ch) {
                            Some(i) => to.get(i).copied(),
                            None => Some(ch),
                        })
                        .collect(),
                )
            }
            "not" => {
                arity(1, 1, "1")?;
                Value::Bool(!Self::boolean(&values[0]))
            }
            "boolean" => {
                arity(1, 1, "1")?;
                Value::Bool(Self::boolean(&values[0]))
            }
            "true" => {
                arity(0, 0, "0")?;
                Value::Bool(true)
            }
            "false" => {
                arity(0, 0, "0")?;
                Value::Bool(false)
            }
            "number" => {
                arity(0, 1, "0 or 1")?;
                match values.first() {
                    Some(value) => Value::Num(self.number(value)),
                    None => Value::Num(string_to_number(&string_arg(0))),
                }
            }
            "name" | "local-name" => {
                arity(0, 1, "0 or 1")?;
                let item = match values.first() {
                    Some(Value::Nodes(items)) => items.first(),
                    Some(_) => return Err(SelectorError::NotNodeSet),
                    None => Some(ctx.item),
                };
                Value::Str(item.map(|item| self.node_name(item)).unwrap_or_default())
            }
            other => return Err(SelectorError::UnsupportedFunction(other.to_string())),
        })
    }

    fn node_name(&self, item: &Item) -> String {
        let Some(el) = self.doc.element(&item.path) else {
            return String::new();
        };
        match item.attr {
            Some(index) => el.attrs.get(index).map(|(k, _)| k.clone()).unwrap_or_default(),
            None => el.name.clone(),
        }
    }
}

fn compare_atoms(op: BinaryOp, left: &Value, right: &Value, ev: &Evaluator<'_>) -> bool {
    match op {
        BinaryOp::Eq | BinaryOp::Ne => {
            let equal = if matches!(left, Value::Bool(_)) || matches!(right, Value::Bool(_)) {
                Evaluator::boolean(left) == Evaluator::boolean(right)
            } else if matches!(left, Value::Num(_)) || matches!(right, Value::Num(_)) {
                ev.number(left) == ev.number(right)
            } else {
                ev.string(left) == ev.string(right)
            };
            equal == (op == BinaryOp::Eq)
        }
        _ => compare_numbers(op, ev.number(left), ev.number(right)),
    }
}

fn compare_strings(op: BinaryOp, left: &str, right: &str) -> bool {
    match op {
        BinaryOp::Eq => left == right,
        BinaryOp::Ne => left != right,
        _ => compare_numbers(op, string_to_number(left), string_to_number(right)),
    }
}

fn compare_numbers(op: BinaryOp, left: f64, right: f64) -> bool {
    match op {
        BinaryOp::Lt => left < right,
        BinaryOp::Le => left <= right,
        BinaryOp::Gt => left > right,
        BinaryOp::Ge => left >= right,
        BinaryOp::Eq => left == right,
        BinaryOp::Ne => left != right,
        _ => false,
    }
}

fn string_to_number(text: &str) -> f64 {
    let trimmed = text.trim();
    let valid = !trimmed.is_empty()
        && trimmed
            .strip_prefix('-')
            .unwrap_or(trimmed)
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.');
    if valid {
        trimmed.parse().unwrap_or(f64::NAN)
    } else {
        f64::NAN
    }
}

fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n == f64::INFINITY {
        "Infinity".to_string()
    } else if n == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

fn round(n: f64) -> f64 {
    (n + 0.5).floor()
}
