//! Tokenizer and recursive-descent parser for the selector language.

use super::{Axis, BinaryOp, Expr, LocationPath, NodeTest, SelectorError, Step};

/// Functions the evaluator implements.
const FUNCTIONS: &[&str] = &[
    "last",
    "position",
    "count",
    "string",
    "concat",
    "contains",
    "starts-with",
    "ends-with",
    "substring",
    "substring-before",
    "substring-after",
    "normalize-space",
    "string-length",
    "translate",
    "not",
    "true",
    "false",
    "boolean",
    "number",
    "name",
    "local-name",
];

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Slash,
    DoubleSlash,
    LBracket,
    RBracket,
    LParen,
    RParen,
    At,
    Comma,
    Pipe,
    Dot,
    DotDot,
    ColonColon,
    Star,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Name(String),
    Literal(String),
    Number(f64),
}

fn syntax(position: usize, message: impl Into<String>) -> SelectorError {
    SelectorError::Syntax {
        position,
        message: message.into(),
    }
}

fn is_name_start(ch: char) -> bool {
    ch.is_alphabetic() || ch == '_'
}

fn is_name_char(ch: char) -> bool {
    ch.is_alphanumeric() || matches!(ch, '_' | '-' | '.')
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, SelectorError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, ch) = chars[i];
        let next = chars.get(i + 1).map(|&(_, c)| c);

        let (token, width) = match ch {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '/' if next == Some('/') => (Token::DoubleSlash, 2),
            '/' => (Token::Slash, 1),
            '[' => (Token::LBracket, 1),
            ']' => (Token::RBracket, 1),
            '(' => (Token::LParen, 1),
            ')' => (Token::RParen, 1),
            '@' => (Token::At, 1),
            ',' => (Token::Comma, 1),
            '|' => (Token::Pipe, 1),
            '*' => (Token::Star, 1),
            '=' => (Token::Eq, 1),
            '+' => (Token::Plus, 1),
            '-' => (Token::Minus, 1),
            '!' if next == Some('=') => (Token::Ne, 2),
            '<' if next == Some('=') => (Token::Le, 2),
            '<' => (Token::Lt, 1),
            '>' if next == Some('=') => (Token::Ge, 2),
            '>' => (Token::Gt, 1),
            ':' if next == Some(':') => (Token::ColonColon, 2),
            '.' if next == Some('.') => (Token::DotDot, 2),
            '.' if next.is_some_and(|c| c.is_ascii_digit()) => {
                let (number, width) = scan_number(&chars[i..]);
                (Token::Number(number), width)
            }
            '.' => (Token::Dot, 1),
            '\'' | '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&(_, c)| c == ch)
                    .ok_or_else(|| syntax(pos, "unterminated string literal"))?;
                let text: String = chars[i + 1..i + 1 + end].iter().map(|&(_, c)| c).collect();
                (Token::Literal(text), end + 2)
            }
            c if c.is_ascii_digit() => {
                let (number, width) = scan_number(&chars[i..]);
                (Token::Number(number), width)
            }
            c if is_name_start(c) => {
                let mut width = 1;
                while chars.get(i + width).is_some_and(|&(_, c)| is_name_char(c)) {
                    width += 1;
                }
                // A trailing '.' belongs to the next token (e.g. `a/.`).
                while width > 1 && chars[i + width - 1].1 == '.' {
                    width -= 1;
                }
                let name: String = chars[i..i + width].iter().map(|&(_, c)| c).collect();
                (Token::Name(name), width)
            }
            other => return Err(syntax(pos, format!("unexpected character {other:?}"))),
        };

        tokens.push((token, pos));
        i += width;
    }

    Ok(tokens)
}

fn scan_number(chars: &[(usize, char)]) -> (f64, usize) {
    let mut width = 0;
    let mut seen_dot = false;
    while let Some(&(_, c)) = chars.get(width) {
        if c.is_ascii_digit() {
            width += 1;
        } else if c == '.' && !seen_dot && chars.get(width + 1).is_none_or(|&(_, n)| n != '.') {
            seen_dot = true;
            width += 1;
        } else {
            break;
        }
    }
    let text: String = chars[..width].iter().map(|&(_, c)| c).collect();
    (text.parse().unwrap_or(f64::NAN), width)
}

/// Parse selector text into an expression tree.
pub fn parse(input: &str) -> Result<Expr, SelectorError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(syntax(0, "empty selector"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.len(),
    };
    let expr = parser.parse_expr()?;
    if parser.pos < parser.tokens.len() {
        return Err(syntax(parser.offset(), "unexpected trailing input"));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.pos + ahead).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |&(_, p)| p)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<(), SelectorError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(syntax(self.offset(), format!("expected {what}")))
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if matches!(self.peek(), Some(Token::Name(name)) if name == keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, SelectorError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, SelectorError> {
        let mut lhs = self.parse_and()?;
        while self.eat_keyword("or") {
            let rhs = self.parse_and()?;
            lhs = binary(BinaryOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, SelectorError> {
        let mut lhs = self.parse_equality()?;
        while self.eat_keyword("and") {
            let rhs = self.parse_equality()?;
            lhs = binary(BinaryOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, SelectorError> {
        let mut lhs = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinaryOp::Eq,
                Some(Token::Ne) => BinaryOp::Ne,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_relational()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn parse_relational(&mut self) -> Result<Expr, SelectorError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Ge) => BinaryOp::Ge,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_additive()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, SelectorError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, SelectorError> {
        if self.eat(&Token::Minus) {
            return Ok(Expr::Negate(Box::new(self.parse_unary()?)));
        }
        self.parse_union()
    }

    fn parse_union(&mut self) -> Result<Expr, SelectorError> {
        let mut lhs = self.parse_path_expr()?;
        while self.eat(&Token::Pipe) {
            let rhs = self.parse_path_expr()?;
            lhs = binary(BinaryOp::Union, lhs, rhs);
        }
        Ok(lhs)
    }

    fn starts_primary(&self) -> bool {
        match self.peek() {
            Some(Token::Literal(_) | Token::Number(_) | Token::LParen) => true,
            Some(Token::Name(name)) => {
                self.peek_at(1) == Some(&Token::LParen) && !is_node_type(name)
            }
            _ => false,
        }
    }

    fn parse_path_expr(&mut self) -> Result<Expr, SelectorError> {
        if !self.starts_primary() {
            return Ok(Expr::Path(self.parse_location_path()?));
        }

        let primary = self.parse_primary()?;
        let mut predicates = Vec::new();
        while self.eat(&Token::LBracket) {
            predicates.push(self.parse_expr()?);
            self.expect(&Token::RBracket, "']'")?;
        }

        let mut steps = Vec::new();
        match self.peek() {
            Some(Token::Slash) => {
                self.pos += 1;
                self.parse_relative_steps(&mut steps)?;
            }
            Some(Token::DoubleSlash) => {
                self.pos += 1;
                steps.push(Step::descendant_or_self());
                self.parse_relative_steps(&mut steps)?;
            }
            _ => {}
        }

        if predicates.is_empty() && steps.is_empty() {
            return Ok(primary);
        }
        Ok(Expr::Filter {
            primary: Box::new(primary),
            predicates,
            steps,
        })
    }

    fn parse_primary(&mut self) -> Result<Expr, SelectorError> {
        let offset = self.offset();
        match self.peek().cloned() {
            Some(Token::Literal(text)) => {
                self.pos += 1;
                Ok(Expr::Literal(text))
            }
            Some(Token::Number(n)) => {
                self.pos += 1;
                Ok(Expr::Number(n))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::Name(name)) => {
                self.pos += 1;
                if !FUNCTIONS.contains(&name.as_str()) {
                    return Err(SelectorError::UnsupportedFunction(name));
                }
                self.expect(&Token::LParen, "'('")?;
                let mut args = Vec::new();
                if !self.eat(&Token::RParen) {
                    loop {
                        args.push(self.parse_expr()?);
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        self.expect(&Token::RParen, "')' or ','")?;
                        break;
                    }
                }
                Ok(Expr::Function { name, args })
            }
            _ => Err(syntax(offset, "expected expression")),
        }
    }

    fn can_start_step(&self) -> bool {
        matches!(
            self.peek(),
            Some(Token::Dot | Token::DotDot | Token::At | Token::Star | Token::Name(_))
        )
    }

    fn parse_location_path(&mut self) -> Result<LocationPath, SelectorError> {
        let mut steps = Vec::new();
        let absolute = match self.peek() {
            Some(Token::Slash) => {
                self.pos += 1;
                if self.can_start_step() {
                    self.parse_relative_steps(&mut steps)?;
                }
                true
            }
            Some(Token::DoubleSlash) => {
                self.pos += 1;
                steps.push(Step::descendant_or_self());
                self.parse_relative_steps(&mut steps)?;
                true
            }
            _ => {
                self.parse_relative_steps(&mut steps)?;
                false
            }
        };
        Ok(LocationPath { absolute, steps })
    }

    fn parse_relative_steps(&mut self, steps: &mut Vec<Step>) -> Result<(), SelectorError> {
        steps.push(self.parse_step()?);
        loop {
            match self.peek() {
                Some(Token::Slash) => {
                    self.pos += 1;
                    steps.push(self.parse_step()?);
                }
                Some(Token::DoubleSlash) => {
                    self.pos += 1;
                    steps.push(Step::descendant_or_self());
                    steps.push(self.parse_step()?);
                }
                _ => return Ok(()),
            }
        }
    }

    fn parse_step(&mut self) -> Result<Step, SelectorError> {
        let offset = self.offset();
        if self.eat(&Token::Dot) {
            return Ok(Step {
                axis: Axis::SelfAxis,
                test: NodeTest::Node,
                predicates: Vec::new(),
            });
        }
        if self.eat(&Token::DotDot) {
            return Ok(Step {
                axis: Axis::Parent,
                test: NodeTest::Node,
                predicates: Vec::new(),
            });
        }

        let axis = if self.eat(&Token::At) {
            Axis::Attribute
        } else if self.peek_at(1) == Some(&Token::ColonColon) {
            let Some(Token::Name(name)) = self.peek().cloned() else {
                return Err(syntax(offset, "expected axis name"));
            };
            self.pos += 2;
            Axis::from_name(&name).ok_or(SelectorError::UnsupportedAxis(name))?
        } else {
            Axis::Child
        };

        let test = match self.peek().cloned() {
            Some(Token::Star) => {
                self.pos += 1;
                NodeTest::Any
            }
            Some(Token::Name(name)) if self.peek_at(1) == Some(&Token::LParen) => {
                self.pos += 2;
                self.expect(&Token::RParen, "')'")?;
                match name.as_str() {
                    "text" => NodeTest::Text,
                    "node" => NodeTest::Node,
                    _ => return Err(syntax(offset, format!("unsupported node test {name}()"))),
                }
            }
            Some(Token::Name(name)) => {
                self.pos += 1;
                NodeTest::Name(name)
            }
            _ => return Err(syntax(offset, "expected a step")),
        };

        let mut predicates = Vec::new();
        while self.eat(&Token::LBracket) {
            predicates.push(self.parse_expr()?);
            self.expect(&Token::RBracket, "']'")?;
        }

        Ok(Step {
            axis,
            test,
            predicates,
        })
    }
}

fn is_node_type(name: &str) -> bool {
    matches!(name, "text" | "node" | "comment" | "processing-instruction")
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(text: &str) -> LocationPath {
        match parse(text).expect("parse") {
            Expr::Path(path) => path,
            other => panic!("not a path: {other:?}"),
        }
    }

    #[test]
    fn double_slash_expands_to_descendant_joint() {
        let p = path("//div//span");
        assert!(p.absolute);
        assert_eq!(p.steps.len(), 4);
        assert!(p.steps[0].is_descendant_joint());
        assert_eq!(p.steps[1].test, NodeTest::Name("div".into()));
        assert!(p.steps[2].is_descendant_joint());
    }

    #[test]
    fn axes_and_node_tests() {
        let p = path("//dt[.='Price']/following-sibling::dd[1]/text()");
        assert_eq!(p.steps[2].axis, Axis::FollowingSibling);
        assert_eq!(p.steps[3].test, NodeTest::Text);
        assert_eq!(p.steps[1].predicates.len(), 1);
    }

    #[test]
    fn hyphenated_names_and_numbers() {
        let p = path("//my-widget[@data-id='x-1'][2]");
        assert_eq!(p.steps[1].test, NodeTest::Name("my-widget".into()));
        assert_eq!(p.steps[1].predicates[1], Expr::Number(2.0));
    }

    #[test]
    fn keywords_as_element_names() {
        let p = path("//or/and");
        assert_eq!(p.steps[1].test, NodeTest::Name("or".into()));
        assert_eq!(p.steps[2].test, NodeTest::Name("and".into()));
    }

    #[test]
    fn filter_expression_with_steps() {
        let expr = parse("(//ul/li)[1]/a/@href").expect("parse");
        match expr {
            Expr::Filter {
                predicates, steps, ..
            } => {
                assert_eq!(predicates, vec![Expr::Number(1.0)]);
                assert_eq!(steps.len(), 2);
                assert_eq!(steps[1].axis, Axis::Attribute);
            }
            other => panic!("expected filter, got {other:?}"),
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(parse(""), Err(SelectorError::Syntax { .. })));
        assert!(matches!(parse("//div["), Err(SelectorError::Syntax { .. })));
        assert!(matches!(parse("//div[@a='x"), Err(SelectorError::Syntax { .. })));
        assert!(matches!(parse("//div)"), Err(SelectorError::Syntax { .. })));
        assert!(matches!(
            parse("//div[matches(@id,'x')]"),
            Err(SelectorError::UnsupportedFunction(name)) if name == "matches"
        ));
        assert!(matches!(
            parse("//namespace::x"),
            Err(SelectorError::UnsupportedAxis(name)) if name == "namespace"
        ));
    }
}
