//! Edge condition evaluation
//!
//! Conditions such as `${classify.score} > 0.5 && ${fetch.status} == "ok"` are
//! evaluated in two steps: `${nodeId.key}` markers are replaced by the JSON
//! literal of that node output (or `null`), then the text is parsed and
//! evaluated by a small recursive-descent evaluator. The evaluator only knows
//! literals, arithmetic, comparisons, boolean logic and member access, so a
//! condition can never run arbitrary code or touch anything but node outputs.

use crate::runtime::template::resolve_output_path;
use regex::{Captures, Regex};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use thiserror::Error;

static VARIABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\s*([^{}]+?)\s*\}").expect("condition variable pattern"));

/// Nesting limit for parenthesised and literal expressions
const MAX_DEPTH: usize = 64;

#[derive(Debug, Error, PartialEq)]
pub enum ConditionError {
    #[error("Condition parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("Condition type error: {0}")]
    Type(String),
}

type EvalResult<T> = std::result::Result<T, ConditionError>;

/// Replace `${nodeId.key}` markers with JSON literals
pub fn bind_variables(condition: &str, outputs: &BTreeMap<String, Value>) -> String {
    VARIABLE
        .replace_all(condition, |caps: &Captures| {
            let reference = &caps[1];
            let (node_id, path) = reference.split_once('.').unwrap_or((reference, "output"));
            outputs
                .get(node_id)
                .and_then(|output| resolve_output_path(output, path))
                .map(Value::to_string)
                .unwrap_or_else(|| "null".to_string())
        })
        .into_owned()
}

/// Evaluate a condition against accumulated node outputs
pub fn evaluate_condition(condition: &str, outputs: &BTreeMap<String, Value>) -> EvalResult<bool> {
    let bound = bind_variables(condition, outputs);
    tracing::debug!("🔀 Evaluating condition: {} => {}", condition, bound);
    let value = evaluate_expression(&bound)?;
    Ok(truthy(&value))
}

/// Evaluate an expression that contains no variable markers
pub fn evaluate_expression(expression: &str) -> EvalResult<Value> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser {
        tokens,
        position: 0,
        depth: 0,
    };
    let value = parser.expression()?;
    match parser.peek() {
        Token::End => Ok(value),
        other => Err(parser.error(format!("unexpected {:?}", other))),
    }
}

/// JavaScript-style truthiness
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    End,
}

const OPERATORS: &[&str] = &[
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "<", ">", "+", "-", "*", "/", "%", "!", "(",
    ")", "[", "]", "{", "}", ",", ":", ".",
];

fn tokenize(input: &str) -> EvalResult<Vec<(usize, Token)>> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                i += 1;
            }
            // Exponent, as produced by JSON encoding of large numbers
            if i < chars.len() && matches!(chars[i].1, 'e' | 'E') {
                i += 1;
                if i < chars.len() && matches!(chars[i].1, '+' | '-') {
                    i += 1;
                }
                while i < chars.len() && chars[i].1.is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
            let number = text.parse::<f64>().map_err(|_| ConditionError::Parse {
                offset,
                message: format!("invalid number '{}'", text),
            })?;
            tokens.push((offset, Token::Number(number)));
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            let mut text = String::new();
            i += 1;
            loop {
                let Some(&(_, ch)) = chars.get(i) else {
                    return Err(ConditionError::Parse {
                        offset,
                        message: "unterminated string".to_string(),
                    });
                };
                i += 1;
                match ch {
                    ch if ch == quote => break,
                    '\\' => {
                        let Some(&(_, escaped)) = chars.get(i) else {
                            return Err(ConditionError::Parse {
                                offset,
                                message: "unterminated escape".to_string(),
                            });
                        };
                        i += 1;
                        match escaped {
                            'n' => text.push('\n'),
                            't' => text.push('\t'),
                            'r' => text.push('\r'),
                            'u' => {
                                let hex: String = chars.iter().skip(i).take(4).map(|(_, c)| c).collect();
                                let code = u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32);
                                match code {
                                    Some(decoded) if hex.len() == 4 => {
                                        text.push(decoded);
                                        i += 4;
                                    }
                                    _ => {
                                        return Err(ConditionError::Parse {
                                            offset,
                                            message: format!("invalid unicode escape '\\u{}'", hex),
                                        })
                                    }
                                }
                            }
                            other => text.push(other),
                        }
                    }
                    other => text.push(other),
                }
            }
            tokens.push((offset, Token::Str(text)));
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_' || chars[i].1 == '$') {
                i += 1;
            }
            let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
            tokens.push((offset, Token::Ident(text)));
            continue;
        }

        let rest = &input[offset..];
        match OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            Some(op) => {
                tokens.push((offset, Token::Op(*op)));
                i += op.chars().count();
            }
            None => {
                return Err(ConditionError::Parse {
                    offset,
                    message: format!("unexpected character '{}'", c),
                })
            }
        }
    }

    tokens.push((input.len(), Token::End));
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    position: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.position.min(self.tokens.len() - 1)].1
    }

    fn offset(&self) -> usize {
        self.tokens[self.position.min(self.tokens.len() - 1)].0
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.position < self.tokens.len() - 1 {
            self.position += 1;
        }
        token
    }

    fn eat(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Token::Op(current) if *current == op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, op: &str) -> EvalResult<()> {
        if self.eat(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}', found {:?}", op, self.peek())))
        }
    }

    fn error(&self, message: String) -> ConditionError {
        ConditionError::Parse {
            offset: self.offset(),
            message,
        }
    }

    fn enter(&mut self) -> EvalResult<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error("expression nested too deeply".to_string()));
        }
        Ok(())
    }

    fn expression(&mut self) -> EvalResult<Value> {
        self.or()
    }

    fn or(&mut self) -> EvalResult<Value> {
        let mut left = self.and()?;
        while self.eat("||") {
            let right = self.and()?;
            left = if truthy(&left) { left } else { right };
        }
        Ok(left)
    }

    fn and(&mut self) -> EvalResult<Value> {
        let mut left = self.equality()?;
        while self.eat("&&") {
            let right = self.equality()?;
            left = if truthy(&left) { right } else { left };
        }
        Ok(left)
    }

    fn equality(&mut self) -> EvalResult<Value> {
        let mut left = self.comparison()?;
        loop {
            let negate = if self.eat("===") || self.eat("==") {
                false
            } else if self.eat("!==") || self.eat("!=") {
                true
            } else {
                return Ok(left);
            };
            let right = self.comparison()?;
            left = Value::Bool(values_equal(&left, &right) != negate);
        }
    }

    fn comparison(&mut self) -> EvalResult<Value> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Token::Op(op @ ("<" | "<=" | ">" | ">=")) => *op,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.additive()?;
            left = Value::Bool(compare(op, &left, &right)?);
        }
    }

    fn additive(&mut self) -> EvalResult<Value> {
        let mut left = self.multiplicative()?;
        loop {
            if self.eat("+") {
                let right = self.multiplicative()?;
                left = match (&left, &right) {
                    (Value::String(a), b) => Value::String(format!("{}{}", a, display(b))),
                    (a, Value::String(b)) => Value::String(format!("{}{}", display(a), b)),
                    _ => number(as_number(&left)? + as_number(&right)?),
                };
            } else if self.eat("-") {
                let right = self.multiplicative()?;
                left = number(as_number(&left)? - as_number(&right)?);
            } else {
                return Ok(left);
            }
        }
    }

    fn multiplicative(&mut self) -> EvalResult<Value> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Op(op @ ("*" | "/" | "%")) => *op,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            let (a, b) = (as_number(&left)?, as_number(&right)?);
            left = match op {
                "*" => number(a * b),
                "/" => number(a / b),
                _ => number(a % b),
            };
        }
    }

    fn unary(&mut self) -> EvalResult<Value> {
        if self.eat("!") {
            self.enter()?;
            let value = self.unary()?;
            self.depth -= 1;
            return Ok(Value::Bool(!truthy(&value)));
        }
        if self.eat("-") {
            self.enter()?;
            let value = self.unary()?;
            self.depth -= 1;
            return Ok(number(-as_number(&value)?));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> EvalResult<Value> {
        let mut value = self.primary()?;
        loop {
            if self.eat(".") {
                let name = match self.advance() {
                    Token::Ident(name) => name,
                    other => return Err(self.error(format!("expected property name, found {:?}", other))),
                };
                value = member(&value, &name);
            } else if self.eat("[") {
                self.enter()?;
                let key = self.expression()?;
                self.expect("]")?;
                self.depth -= 1;
                value = match key {
                    Value::Number(n) => n
                        .as_f64()
                        .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                        .and_then(|f| value.get(f as usize).cloned())
                        .unwrap_or(Value::Null),
                    Value::String(name) => member(&value, &name),
                    _ => Value::Null,
                };
            } else {
                return Ok(value);
            }
        }
    }

    fn primary(&mut self) -> EvalResult<Value> {
        match self.advance() {
            Token::Number(n) => Ok(number(n)),
            Token::Str(s) => Ok(Value::String(s)),
            Token::Ident(word) => match word.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                "null" | "undefined" => Ok(Value::Null),
                other => Err(self.error(format!(
                    "unknown identifier '{}'; reference node outputs as ${{nodeId.key}}",
                    other
                ))),
            },
            Token::Op("(") => {
                self.enter()?;
                let value = self.expression()?;
                self.expect(")")?;
                self.depth -= 1;
                Ok(value)
            }
            Token::Op("[") => {
                self.enter()?;
                let mut items = Vec::new();
                if !self.eat("]") {
                    loop {
                        items.push(self.expression()?);
                        if self.eat("]") {
                            break;
                        }
                        self.expect(",")?;
                    }
                }
                self.depth -= 1;
                Ok(Value::Array(items))
            }
            Token::Op("{") => {
                self.enter()?;
                let mut map = Map::new();
                if !self.eat("}") {
                    loop {
                        let key = match self.advance() {
                            Token::Str(key) | Token::Ident(key) => key,
                            other => return Err(self.error(format!("expected object key, found {:?}", other))),
                        };
                        self.expect(":")?;
                        let value = self.expression()?;
                        map.insert(key, value);
                        if self.eat("}") {
                            break;
                        }
                        self.expect(",")?;
                    }
                }
                self.depth -= 1;
                Ok(Value::Object(map))
            }
            Token::End => Err(self.error("unexpected end of condition".to_string())),
            other => Err(self.error(format!("unexpected {:?}", other))),
        }
    }
}

fn number(n: f64) -> Value {
    // Integral results stay integers so they print and compare like JSON input
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        return Value::from(n as i64);
    }
    Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

fn as_number(value: &Value) -> EvalResult<f64> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ConditionError::Type(format!("number out of range: {}", n))),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Null => Ok(0.0),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| ConditionError::Type(format!("'{}' is not a number", s))),
        other => Err(ConditionError::Type(format!("cannot use {} as a number", other))),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn member(value: &Value, name: &str) -> Value {
    match (value, name) {
        (Value::Array(items), "length") => Value::from(items.len()),
        (Value::String(s), "length") => Value::from(s.chars().count()),
        (Value::Object(map), _) => map.get(name).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn compare(op: &str, left: &Value, right: &Value) -> EvalResult<bool> {
    let ordering = match (left, right) {
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => {
            let (a, b) = (as_number(left)?, as_number(right)?);
            match a.partial_cmp(&b) {
                Some(ordering) => ordering,
                None => return Ok(false),
            }
        }
    };
    Ok(match op {
        "<" => ordering.is_lt(),
        "<=" => ordering.is_le(),
        ">" => ordering.is_gt(),
        _ => ordering.is_ge(),
    })
}
