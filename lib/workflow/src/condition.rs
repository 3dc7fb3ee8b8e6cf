//! Edge condition evaluation.
//!
//! Conditions are small boolean expressions over the data visible to an edge:
//!
//! ```text
//! expr    := or
//! or      := and ("||" and)*
//! and     := not ("&&" not)*
//! not     := "!" not | cmp
//! cmp     := primary (("==" | "!=" | "<" | "<=" | ">" | ">=") primary)?
//! primary := literal | path | "(" expr ")"
//! ```
//!
//! Literals are `true`, `false`, `null`, numbers and quoted strings. Paths are
//! dotted identifiers rooted at `input`, `vars` (or `variables`), `output` (the
//! source node's output) or `nodes.<id>`. A path with any other root looks in
//! the source output, then the variables, then the input. Missing paths
//! evaluate to `null`.
//!
//! `==` and `!=` use JSON equality, comparing numbers as floats. Ordering
//! operators accept two numbers or two strings. A value used as a boolean is
//! false when it is `null`, `false`, `0`, `""` or an empty array or object.
//! A blank expression is true. Operators nest at most 128 levels deep.

use crate::error::ConditionError;
use crate::node::{DataMap, NodeId};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Data an edge condition may read.
#[derive(Debug, Clone, Copy)]
pub struct ConditionScope<'a> {
    /// Output of the edge's source node.
    pub output: &'a DataMap,
    /// Run variables.
    pub variables: &'a DataMap,
    /// Run input.
    pub input: &'a DataMap,
    /// Outputs of every completed node.
    pub nodes: &'a HashMap<NodeId, DataMap>,
}

/// Decides whether a conditional edge fires.
pub trait ConditionEvaluator: Send + Sync {
    /// Checks an expression without evaluating it.
    ///
    /// # Errors
    ///
    /// Returns `ConditionError::Parse` if the expression is malformed.
    fn check(&self, _expression: &str) -> Result<(), ConditionError> {
        Ok(())
    }

    /// Evaluates an expression against the scope.
    ///
    /// # Errors
    ///
    /// Returns an error if the expression is malformed or compares
    /// incompatible values.
    fn evaluate(&self, expression: &str, scope: &ConditionScope<'_>)
    -> Result<bool, ConditionError>;
}

/// Evaluator for the built-in expression grammar.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionEvaluator;

impl ExpressionEvaluator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ConditionEvaluator for ExpressionEvaluator {
    fn check(&self, expression: &str) -> Result<(), ConditionError> {
        if expression.trim().is_empty() {
            return Ok(());
        }
        parse(expression).map(|_| ())
    }

    fn evaluate(
        &self,
        expression: &str,
        scope: &ConditionScope<'_>,
    ) -> Result<bool, ConditionError> {
        if expression.trim().is_empty() {
            return Ok(true);
        }
        let expr = parse(expression)?;
        let value = eval(&expr, scope).map_err(|reason| ConditionError::Type {
            expression: expression.to_string(),
            reason,
        })?;
        Ok(truthy(&value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Cmp(CmpOp),
    Literal(JsonValue),
    Path(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(JsonValue),
    Path(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

fn parse(expression: &str) -> Result<Expr, ConditionError> {
    let parse_error = |reason: String| ConditionError::Parse {
        expression: expression.to_string(),
        reason,
    };

    let tokens = tokenize(expression).map_err(parse_error)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.parse_or().map_err(parse_error)?;
    if let Some(token) = parser.peek() {
        return Err(parse_error(format!("unexpected token {token:?}")));
    }
    Ok(expr)
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' | '|' => {
                if next != Some(c) {
                    return Err(format!("expected '{c}{c}' at position {i}"));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '=' => {
                if next != Some('=') {
                    return Err(format!("expected '==' at position {i}"));
                }
                tokens.push(Token::Cmp(CmpOp::Eq));
                i += 2;
            }
            '<' | '>' => {
                let op = match (c, next == Some('=')) {
                    ('<', false) => CmpOp::Lt,
                    ('<', true) => CmpOp::Le,
                    (_, false) => CmpOp::Gt,
                    (_, true) => CmpOp::Ge,
                };
                tokens.push(Token::Cmp(op));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".to_string()),
                        Some('\\') => {
                            let escaped = chars
                                .get(i + 1)
                                .ok_or_else(|| "unterminated string literal".to_string())?;
                            text.push(*escaped);
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            text.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Literal(JsonValue::String(text)));
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while chars.get(i).is_some_and(|ch| ch.is_ascii_digit() || *ch == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Literal(parse_number(&text)?));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while chars
                    .get(i)
                    .is_some_and(|ch| ch.is_alphanumeric() || matches!(ch, '_' | '-' | '.' | '$'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Literal(JsonValue::Bool(true)),
                    "false" => Token::Literal(JsonValue::Bool(false)),
                    "null" => Token::Literal(JsonValue::Null),
                    _ => {
                        let segments: Vec<String> = word.split('.').map(str::to_string).collect();
                        if segments.iter().any(String::is_empty) {
                            return Err(format!("malformed path '{word}'"));
                        }
                        Token::Path(segments)
                    }
                });
            }
            other => return Err(format!("unexpected character '{other}' at position {i}")),
        }
    }

    Ok(tokens)
}

fn parse_number(text: &str) -> Result<JsonValue, String> {
    if let Ok(n) = text.parse::<i64>() {
        return Ok(JsonValue::from(n));
    }
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(JsonValue::Number)
        .ok_or_else(|| format!("invalid number '{text}'"))
}

/// Deepest operator nesting a condition may have.
const MAX_DEPTH: usize = 128;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    /// Every nested operand goes one level deeper, including each operator
    /// of a `&&`/`||` chain.
    fn descend(&mut self) -> Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(format!("expression nests deeper than {MAX_DEPTH} levels"));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let depth = self.depth;
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            self.descend()?;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        self.depth = depth;
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let depth = self.depth;
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            self.descend()?;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        self.depth = depth;
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.descend()?;
            let inner = self.parse_not()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr, String> {
        let left = self.parse_primary()?;
        if let Some(Token::Cmp(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_primary()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Literal(value)) => Ok(Expr::Literal(value)),
            Some(Token::Path(segments)) => Ok(Expr::Path(segments)),
            Some(Token::LParen) => {
                self.descend()?;
                let expr = self.parse_or()?;
                self.depth -= 1;
                match self.advance() {
                    Some(Token::RParen) => Ok(expr),
                    _ => Err("missing closing parenthesis".to_string()),
                }
            }
            Some(token) => Err(format!("expected a value, found {token:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

fn eval(expr: &Expr, scope: &ConditionScope<'_>) -> Result<JsonValue, String> {
    Ok(match expr {
        Expr::Literal(value) => value.clone(),
        Expr::Path(segments) => resolve(segments, scope),
        Expr::Not(inner) => JsonValue::Bool(!truthy(&eval(inner, scope)?)),
        Expr::And(left, right) => {
            JsonValue::Bool(truthy(&eval(left, scope)?) && truthy(&eval(right, scope)?))
        }
        Expr::Or(left, right) => {
            JsonValue::Bool(truthy(&eval(left, scope)?) || truthy(&eval(right, scope)?))
        }
        Expr::Compare(op, left, right) => {
            let left = eval(left, scope)?;
            let right = eval(right, scope)?;
            JsonValue::Bool(compare(*op, &left, &right)?)
        }
    })
}

fn resolve(segments: &[String], scope: &ConditionScope<'_>) -> JsonValue {
    let (root, rest): (Option<&DataMap>, &[String]) = match segments {
        [root, rest @ ..] if root == "input" => (Some(scope.input), rest),
        [root, rest @ ..] if root == "vars" || root == "variables" => (Some(scope.variables), rest),
        [root, rest @ ..] if root == "output" => (Some(scope.output), rest),
        [root, node, rest @ ..] if root == "nodes" => {
            (scope.nodes.get(&NodeId::new(node.as_str())), rest)
        }
        [first, rest @ ..] => {
            let value = scope
                .output
                .get(first)
                .or_else(|| scope.variables.get(first))
                .or_else(|| scope.input.get(first));
            return value.map_or(JsonValue::Null, |v| walk(v, rest));
        }
        [] => return JsonValue::Null,
    };

    match (root, rest) {
        (None, _) => JsonValue::Null,
        (Some(map), []) => JsonValue::Object(map.clone()),
        (Some(map), [key, rest @ ..]) => map.get(key).map_or(JsonValue::Null, |v| walk(v, rest)),
    }
}

fn walk(value: &JsonValue, path: &[String]) -> JsonValue {
    let mut current = value;
    for segment in path {
        let next = match current {
            JsonValue::Object(map) => map.get(segment),
            JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return JsonValue::Null,
        }
    }
    current.clone()
}

fn compare(op: CmpOp, left: &JsonValue, right: &JsonValue) -> Result<bool, String> {
    match op {
        CmpOp::Eq => Ok(json_eq(left, right)),
        CmpOp::Ne => Ok(!json_eq(left, right)),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ordering = match (left, right) {
                (JsonValue::Number(a), JsonValue::Number(b)) => {
                    let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
                    a.partial_cmp(&b)
                        .ok_or_else(|| format!("cannot order {a} and {b}"))?
                }
                (JsonValue::String(a), JsonValue::String(b)) => a.cmp(b),
                _ => {
                    return Err(format!(
                        "'{}' needs two numbers or two strings, got {} and {}",
                        op.symbol(),
                        type_name(left),
                        type_name(right)
                    ));
                }
            };
            Ok(match op {
                CmpOp::Lt => ordering == Ordering::Less,
                CmpOp::Le => ordering != Ordering::Greater,
                CmpOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            })
        }
    }
}

fn json_eq(left: &JsonValue, right: &JsonValue) -> bool {
    match (left, right) {
        (JsonValue::Number(a), JsonValue::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(items) => !items.is_empty(),
        JsonValue::Object(map) => !map.is_empty(),
    }
}
