//! Expression evaluation service for conditions, collection expressions,
//! and case selectors.
//!
//! The engine core is agnostic about how expressions are evaluated; it
//! only needs a narrow interface: given `(source, environment)` produce a
//! value or a parse/eval error. This module ships a small recursive-descent
//! interpreter over `serde_json::Value` that covers the needs of the
//! control-flow nodes:
//!
//! - literals (numbers, strings, booleans, null, `[..]` lists)
//! - identifier resolution through `local` → `input` → workflow variables
//! - explicit scopes: `input.x`, `local.x`, `global.x`, with `.` member
//!   access into nested objects
//! - accessor helpers: `GetGlobal("x")`, `SetGlobal("x", v)`,
//!   `GetInput("x")`, `GetLocal("x")`, `SetOutput("x", v)`, `Length(v)`
//! - comparison, boolean (`&&`, `||`, `!`), and arithmetic operators
//! - `;`-separated statement sequences evaluating to the last value
//!
//! Syntax errors surface at workflow-load time via [`parse`]; evaluation
//! errors during guard filtering are treated as `false` by the router.

use miette::Diagnostic;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::context::IoMap;

/// Errors raised by the expression service.
#[derive(Debug, Error, Diagnostic)]
pub enum ExpressionError {
    /// The source failed to parse.
    #[error("parse error at offset {offset}: {message}")]
    #[diagnostic(
        code(flowloom::expression::parse),
        help("Check the expression syntax near the reported offset.")
    )]
    Parse { message: String, offset: usize },

    /// The source parsed but could not be evaluated.
    #[error("evaluation error: {message}")]
    #[diagnostic(code(flowloom::expression::eval))]
    Eval { message: String },
}

impl ExpressionError {
    fn eval(message: impl Into<String>) -> Self {
        Self::Eval {
            message: message.into(),
        }
    }
}

// ============================================================================
// Environment
// ============================================================================

/// The data an expression can see and mutate.
///
/// Reads resolve bare identifiers through `local` → `input` → workflow
/// variables. Writes (`SetGlobal`, `SetOutput`) go through interior
/// mutability so that callers can keep borrowing the environment while a
/// script runs; collect writes afterwards with
/// [`take_output`](Self::take_output).
pub struct Environment {
    variables: Arc<RwLock<FxHashMap<String, Value>>>,
    input: IoMap,
    local: FxHashMap<String, Value>,
    output: Mutex<IoMap>,
}

impl Environment {
    #[must_use]
    pub fn new(
        variables: Arc<RwLock<FxHashMap<String, Value>>>,
        input: IoMap,
        local: FxHashMap<String, Value>,
    ) -> Self {
        Self {
            variables,
            input,
            local,
            output: Mutex::new(IoMap::new()),
        }
    }

    /// Environment with empty input/local scopes.
    #[must_use]
    pub fn with_variables(variables: Arc<RwLock<FxHashMap<String, Value>>>) -> Self {
        Self::new(variables, IoMap::new(), FxHashMap::default())
    }

    fn resolve(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.local.get(name) {
            return Some(v.clone());
        }
        if let Some(v) = self.input.get(name) {
            return Some(v.clone());
        }
        self.variables.read().get(name).cloned()
    }

    fn get_global(&self, name: &str) -> Value {
        self.variables.read().get(name).cloned().unwrap_or(Value::Null)
    }

    fn set_global(&self, name: &str, value: Value) {
        self.variables.write().insert(name.to_string(), value);
    }

    fn set_output(&self, name: &str, value: Value) {
        self.output.lock().insert(name.to_string(), value);
    }

    /// Drain the output map written by `SetOutput` calls.
    #[must_use]
    pub fn take_output(&self) -> IoMap {
        std::mem::take(&mut self.output.lock())
    }
}

// ============================================================================
// AST
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
enum Expr {
    Literal(Value),
    List(Vec<Expr>),
    Ident(String),
    Member(Box<Expr>, String),
    Scope(ScopeKind, String),
    Call(String, Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Sequence(Vec<Expr>),
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum ScopeKind {
    Input,
    Local,
    Global,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum UnaryOp {
    Not,
    Neg,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum BinaryOp {
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
    Mul,
    Div,
    Rem,
}

/// A parsed, reusable expression.
#[derive(Clone, Debug)]
pub struct CompiledExpression {
    root: Expr,
}

/// Parse an expression without evaluating it. Used at workflow-load time
/// to surface guard/condition syntax errors before the engine starts.
pub fn parse(source: &str) -> Result<CompiledExpression, ExpressionError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let root = parser.sequence()?;
    parser.expect_end()?;
    Ok(CompiledExpression { root })
}

/// Parse and evaluate in one step.
pub fn evaluate(source: &str, env: &Environment) -> Result<Value, ExpressionError> {
    parse(source)?.evaluate(env)
}

/// Evaluate a condition that must yield a boolean.
pub fn evaluate_bool(source: &str, env: &Environment) -> Result<bool, ExpressionError> {
    match evaluate(source, env)? {
        Value::Bool(b) => Ok(b),
        other => Err(ExpressionError::eval(format!(
            "condition did not return a boolean (got {other})"
        ))),
    }
}

impl CompiledExpression {
    pub fn evaluate(&self, env: &Environment) -> Result<Value, ExpressionError> {
        eval_expr(&self.root, env)
    }
}

// ============================================================================
// Tokenizer
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Number(f64, bool), // value, is_integer
    Str(String),
    Ident(String),
    Punct(&'static str),
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, ExpressionError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let (offset, c) = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '0'..='9' => {
                let start = i;
                let mut is_int = true;
                while i < chars.len() && chars[i].1.is_ascii_digit() {
                    i += 1;
                }
                if i + 1 < chars.len() && chars[i].1 == '.' && chars[i + 1].1.is_ascii_digit() {
                    is_int = false;
                    i += 1;
                    while i < chars.len() && chars[i].1.is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
                let value = text.parse::<f64>().map_err(|e| ExpressionError::Parse {
                    message: format!("invalid number `{text}`: {e}"),
                    offset,
                })?;
                tokens.push((Token::Number(value, is_int), offset));
            }
            '"' | '\'' => {
                let quote = c;
                i += 1;
                let mut text = String::new();
                loop {
                    if i >= chars.len() {
                        return Err(ExpressionError::Parse {
                            message: "unterminated string literal".into(),
                            offset,
                        });
                    }
                    let ch = chars[i].1;
                    i += 1;
                    if ch == quote {
                        break;
                    }
                    if ch == '\\' && i < chars.len() {
                        let esc = chars[i].1;
                        i += 1;
                        match esc {
                            'n' => text.push('\n'),
                            't' => text.push('\t'),
                            other => text.push(other),
                        }
                    } else {
                        text.push(ch);
                    }
                }
                tokens.push((Token::Str(text), offset));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_ascii_alphanumeric() || chars[i].1 == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().map(|(_, c)| c).collect();
                tokens.push((Token::Ident(ident), offset));
            }
            _ => {
                let next = chars.get(i + 1).map(|(_, c)| *c);
                let double = match (c, next) {
                    ('=', Some('=')) => Some("=="),
                    ('!', Some('=')) => Some("!="),
                    ('<', Some('=')) => Some("<="),
                    ('>', Some('=')) => Some(">="),
                    ('&', Some('&')) => Some("&&"),
                    ('|', Some('|')) => Some("||"),
                    _ => None,
                };
                if let Some(p) = double {
                    tokens.push((Token::Punct(p), offset));
                    i += 2;
                    continue;
                }
                let single = match c {
                    '<' => "<",
                    '>' => ">",
                    '+' => "+",
                    '-' => "-",
                    '*' => "*",
                    '/' => "/",
                    '%' => "%",
                    '!' => "!",
                    '(' => "(",
                    ')' => ")",
                    '[' => "[",
                    ']' => "]",
                    ',' => ",",
                    '.' => ".",
                    ';' => ";",
                    other => {
                        return Err(ExpressionError::Parse {
                            message: format!("unexpected character `{other}`"),
                            offset,
                        });
                    }
                };
                tokens.push((Token::Punct(single), offset));
                i += 1;
            }
        }
    }
    Ok(tokens)
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map_or_else(|| self.tokens.last().map_or(0, |(_, o)| *o + 1), |(_, o)| *o)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        self.pos += 1;
        t
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if matches!(self.peek(), Some(Token::Punct(q)) if *q == p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &'static str) -> Result<(), ExpressionError> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(ExpressionError::Parse {
                message: format!("expected `{p}`"),
                offset: self.offset(),
            })
        }
    }

    fn expect_end(&self) -> Result<(), ExpressionError> {
        if self.pos >= self.tokens.len() {
            Ok(())
        } else {
            Err(ExpressionError::Parse {
                message: "unexpected trailing input".into(),
                offset: self.offset(),
            })
        }
    }

    fn sequence(&mut self) -> Result<Expr, ExpressionError> {
        let mut exprs = vec![self.or_expr()?];
        while self.eat_punct(";") {
            if self.peek().is_none() {
                break; // trailing semicolon
            }
            exprs.push(self.or_expr()?);
        }
        if exprs.len() == 1 {
            Ok(exprs.pop().expect("one expression"))
        } else {
            Ok(Expr::Sequence(exprs))
        }
    }

    fn or_expr(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.and_expr()?;
        while self.eat_punct("||") {
            let right = self.and_expr()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.comparison()?;
        while self.eat_punct("&&") {
            let right = self.comparison()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.additive()?;
        let op = match self.peek() {
            Some(Token::Punct("==")) => Some(BinaryOp::Eq),
            Some(Token::Punct("!=")) => Some(BinaryOp::Ne),
            Some(Token::Punct("<")) => Some(BinaryOp::Lt),
            Some(Token::Punct("<=")) => Some(BinaryOp::Le),
            Some(Token::Punct(">")) => Some(BinaryOp::Gt),
            Some(Token::Punct(">=")) => Some(BinaryOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let right = self.additive()?;
            Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
        } else {
            Ok(left)
        }
    }

    fn additive(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Punct("+")) => BinaryOp::Add,
                Some(Token::Punct("-")) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Punct("*")) => BinaryOp::Mul,
                Some(Token::Punct("/")) => BinaryOp::Div,
                Some(Token::Punct("%")) => BinaryOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat_punct("!") {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.unary()?)));
        }
        if self.eat_punct("-") {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.primary()?;
        while self.eat_punct(".") {
            match self.advance() {
                Some(Token::Ident(member)) => {
                    expr = match expr {
                        Expr::Ident(name) => match name.as_str() {
                            "input" => Expr::Scope(ScopeKind::Input, member),
                            "local" => Expr::Scope(ScopeKind::Local, member),
                            "global" | "variables" => Expr::Scope(ScopeKind::Global, member),
                            _ => Expr::Member(Box::new(Expr::Ident(name)), member),
                        },
                        other => Expr::Member(Box::new(other), member),
                    };
                }
                _ => {
                    return Err(ExpressionError::Parse {
                        message: "expected member name after `.`".into(),
                        offset: self.offset(),
                    });
                }
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        let offset = self.offset();
        match self.advance() {
            Some(Token::Number(value, is_int)) => {
                let v = if is_int {
                    Value::from(value as i64)
                } else {
                    Value::from(value)
                };
                Ok(Expr::Literal(v))
            }
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ => {
                    if self.eat_punct("(") {
                        let mut args = Vec::new();
                        if !self.eat_punct(")") {
                            loop {
                                args.push(self.or_expr()?);
                                if self.eat_punct(")") {
                                    break;
                                }
                                self.expect_punct(",")?;
                            }
                        }
                        Ok(Expr::Call(name, args))
                    } else {
                        Ok(Expr::Ident(name))
                    }
                }
            },
            Some(Token::Punct("(")) => {
                let inner = self.or_expr()?;
                self.expect_punct(")")?;
                Ok(inner)
            }
            Some(Token::Punct("[")) => {
                let mut items = Vec::new();
                if !self.eat_punct("]") {
                    loop {
                        items.push(self.or_expr()?);
                        if self.eat_punct("]") {
                            break;
                        }
                        self.expect_punct(",")?;
                    }
                }
                Ok(Expr::List(items))
            }
            other => Err(ExpressionError::Parse {
                message: format!("unexpected token {other:?}"),
                offset,
            }),
        }
    }
}

// ============================================================================
// Evaluation
// ============================================================================

fn eval_expr(expr: &Expr, env: &Environment) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval_expr(item, env)?);
            }
            Ok(Value::Array(out))
        }
        Expr::Ident(name) => env
            .resolve(name)
            .ok_or_else(|| ExpressionError::eval(format!("unknown identifier `{name}`"))),
        Expr::Scope(kind, name) => {
            let v = match kind {
                ScopeKind::Input => env.input.get(name).cloned(),
                ScopeKind::Local => env.local.get(name).cloned(),
                ScopeKind::Global => env.variables.read().get(name).cloned(),
            };
            Ok(v.unwrap_or(Value::Null))
        }
        Expr::Member(base, member) => {
            let base = eval_expr(base, env)?;
            match base {
                Value::Object(map) => Ok(map.get(member).cloned().unwrap_or(Value::Null)),
                other => Err(ExpressionError::eval(format!(
                    "cannot access member `{member}` on {other}"
                ))),
            }
        }
        Expr::Call(name, args) => eval_call(name, args, env),
        Expr::Unary(op, inner) => {
            let v = eval_expr(inner, env)?;
            match op {
                UnaryOp::Not => match v {
                    Value::Bool(b) => Ok(Value::Bool(!b)),
                    other => Err(ExpressionError::eval(format!("cannot negate {other}"))),
                },
                UnaryOp::Neg => match v.as_i64() {
                    Some(int) => Ok(Value::from(-int)),
                    None => Ok(Value::from(-as_number(&v)?)),
                },
            }
        }
        Expr::Binary(op, left, right) => eval_binary(*op, left, right, env),
        Expr::Sequence(exprs) => {
            let mut last = Value::Null;
            for e in exprs {
                last = eval_expr(e, env)?;
            }
            Ok(last)
        }
    }
}

fn eval_call(name: &str, args: &[Expr], env: &Environment) -> Result<Value, ExpressionError> {
    let arity = |n: usize| -> Result<(), ExpressionError> {
        if args.len() == n {
            Ok(())
        } else {
            Err(ExpressionError::eval(format!(
                "{name} expects {n} argument(s), got {}",
                args.len()
            )))
        }
    };
    match name {
        "GetGlobal" => {
            arity(1)?;
            let key = eval_string(&args[0], env)?;
            Ok(env.get_global(&key))
        }
        "SetGlobal" => {
            arity(2)?;
            let key = eval_string(&args[0], env)?;
            let value = eval_expr(&args[1], env)?;
            env.set_global(&key, value.clone());
            Ok(value)
        }
        "GetInput" => {
            arity(1)?;
            let key = eval_string(&args[0], env)?;
            Ok(env.input.get(&key).cloned().unwrap_or(Value::Null))
        }
        "GetLocal" => {
            arity(1)?;
            let key = eval_string(&args[0], env)?;
            Ok(env.local.get(&key).cloned().unwrap_or(Value::Null))
        }
        "SetOutput" => {
            arity(2)?;
            let key = eval_string(&args[0], env)?;
            let value = eval_expr(&args[1], env)?;
            env.set_output(&key, value.clone());
            Ok(value)
        }
        "Length" => {
            arity(1)?;
            let v = eval_expr(&args[0], env)?;
            let len = match &v {
                Value::Array(a) => a.len(),
                Value::String(s) => s.chars().count(),
                Value::Object(m) => m.len(),
                other => {
                    return Err(ExpressionError::eval(format!(
                        "Length not defined for {other}"
                    )));
                }
            };
            Ok(Value::from(len as u64))
        }
        other => Err(ExpressionError::eval(format!("unknown function `{other}`"))),
    }
}

fn eval_string(expr: &Expr, env: &Environment) -> Result<String, ExpressionError> {
    match eval_expr(expr, env)? {
        Value::String(s) => Ok(s),
        other => Err(ExpressionError::eval(format!(
            "expected a string argument, got {other}"
        ))),
    }
}

fn eval_binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    env: &Environment,
) -> Result<Value, ExpressionError> {
    // Short-circuiting boolean operators first.
    match op {
        BinaryOp::And => {
            return match eval_expr(left, env)? {
                Value::Bool(false) => Ok(Value::Bool(false)),
                Value::Bool(true) => match eval_expr(right, env)? {
                    Value::Bool(b) => Ok(Value::Bool(b)),
                    other => Err(ExpressionError::eval(format!("`&&` needs booleans, got {other}"))),
                },
                other => Err(ExpressionError::eval(format!("`&&` needs booleans, got {other}"))),
            };
        }
        BinaryOp::Or => {
            return match eval_expr(left, env)? {
                Value::Bool(true) => Ok(Value::Bool(true)),
                Value::Bool(false) => match eval_expr(right, env)? {
                    Value::Bool(b) => Ok(Value::Bool(b)),
                    other => Err(ExpressionError::eval(format!("`||` needs booleans, got {other}"))),
                },
                other => Err(ExpressionError::eval(format!("`||` needs booleans, got {other}"))),
            };
        }
        _ => {}
    }

    let lv = eval_expr(left, env)?;
    let rv = eval_expr(right, env)?;
    match op {
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(&lv, &rv))),
        BinaryOp::Ne => Ok(Value::Bool(!loose_eq(&lv, &rv))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ord = compare(&lv, &rv)?;
            let b = match op {
                BinaryOp::Lt => ord.is_lt(),
                BinaryOp::Le => ord.is_le(),
                BinaryOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            };
            Ok(Value::Bool(b))
        }
        BinaryOp::Add => {
            if lv.is_string() || rv.is_string() {
                return Ok(Value::String(format!(
                    "{}{}",
                    render(&lv),
                    render(&rv)
                )));
            }
            numeric_op(&lv, &rv, |a, b| a + b, i64::checked_add)
        }
        BinaryOp::Sub => numeric_op(&lv, &rv, |a, b| a - b, i64::checked_sub),
        BinaryOp::Mul => numeric_op(&lv, &rv, |a, b| a * b, i64::checked_mul),
        BinaryOp::Div => {
            if as_number(&rv)? == 0.0 {
                return Err(ExpressionError::eval("division by zero"));
            }
            numeric_op(&lv, &rv, |a, b| a / b, i64::checked_div)
        }
        BinaryOp::Rem => {
            if as_number(&rv)? == 0.0 {
                return Err(ExpressionError::eval("division by zero"));
            }
            numeric_op(&lv, &rv, |a, b| a % b, i64::checked_rem)
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        // Numeric equality ignores int/float representation.
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Result<std::cmp::Ordering, ExpressionError> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y).ok_or_else(|| {
            ExpressionError::eval("numbers are not comparable (NaN)")
        });
    }
    if let (Value::String(x), Value::String(y)) = (a, b) {
        return Ok(x.cmp(y));
    }
    Err(ExpressionError::eval(format!(
        "cannot compare {a} with {b}"
    )))
}

fn as_number(v: &Value) -> Result<f64, ExpressionError> {
    v.as_f64()
        .ok_or_else(|| ExpressionError::eval(format!("expected a number, got {v}")))
}

fn numeric_op(
    a: &Value,
    b: &Value,
    float_op: fn(f64, f64) -> f64,
    int_op: fn(i64, i64) -> Option<i64>,
) -> Result<Value, ExpressionError> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(r) = int_op(x, y) {
            return Ok(Value::from(r));
        }
    }
    Ok(Value::from(float_op(as_number(a)?, as_number(b)?)))
}

fn render(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env_with(vars: &[(&str, Value)]) -> Environment {
        let map: FxHashMap<String, Value> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();
        Environment::with_variables(Arc::new(RwLock::new(map)))
    }

    #[test]
    fn arithmetic_and_comparison() {
        let env = env_with(&[]);
        assert_eq!(evaluate("1 + 2 * 3", &env).unwrap(), json!(7));
        assert_eq!(evaluate("(1 + 2) * 3", &env).unwrap(), json!(9));
        assert_eq!(evaluate("10 / 4", &env).unwrap(), json!(2));
        assert_eq!(evaluate("10.0 / 4", &env).unwrap(), json!(2.5));
        assert_eq!(evaluate("3 < 5 && 5 <= 5", &env).unwrap(), json!(true));
        assert_eq!(evaluate("1 == 1.0", &env).unwrap(), json!(true));
    }

    #[test]
    fn variable_resolution_order() {
        let variables = Arc::new(RwLock::new(FxHashMap::from_iter([(
            "x".to_string(),
            json!(1),
        )])));
        let mut input = IoMap::new();
        input.insert("x".into(), json!(2));
        let local = FxHashMap::from_iter([("x".to_string(), json!(3))]);
        let env = Environment::new(variables, input, local);
        // local shadows input shadows global
        assert_eq!(evaluate("x", &env).unwrap(), json!(3));
        assert_eq!(evaluate("input.x", &env).unwrap(), json!(2));
        assert_eq!(evaluate("global.x", &env).unwrap(), json!(1));
    }

    #[test]
    fn get_and_set_global() {
        let env = env_with(&[("count", json!(0))]);
        assert_eq!(evaluate("GetGlobal(\"count\") < 3", &env).unwrap(), json!(true));
        evaluate("SetGlobal(\"count\", GetGlobal(\"count\") + 1)", &env).unwrap();
        assert_eq!(evaluate("GetGlobal(\"count\")", &env).unwrap(), json!(1));
    }

    #[test]
    fn set_output_collects() {
        let env = env_with(&[]);
        evaluate("SetOutput(\"result\", 6 * 7)", &env).unwrap();
        let out = env.take_output();
        assert_eq!(out.get("result"), Some(&json!(42)));
    }

    #[test]
    fn sequences_yield_last_value() {
        let env = env_with(&[("x", json!(10))]);
        let v = evaluate(
            "SetGlobal(\"x\", GetGlobal(\"x\") * 2); GetGlobal(\"x\")",
            &env,
        )
        .unwrap();
        assert_eq!(v, json!(20));
    }

    #[test]
    fn member_access_into_objects() {
        let env = env_with(&[("cfg", json!({"retries": 5, "inner": {"flag": true}}))]);
        assert_eq!(evaluate("cfg.retries", &env).unwrap(), json!(5));
        assert_eq!(evaluate("cfg.inner.flag", &env).unwrap(), json!(true));
    }

    #[test]
    fn non_boolean_condition_is_an_error() {
        let env = env_with(&[]);
        let err = evaluate_bool("1 + 1", &env).unwrap_err();
        assert!(err.to_string().contains("did not return a boolean"));
    }

    #[test]
    fn parse_errors_report_offset() {
        let err = parse("1 + ").unwrap_err();
        assert!(matches!(err, ExpressionError::Parse { .. }));
        let err = parse("a ~ b").unwrap_err();
        assert!(err.to_string().contains("unexpected character"));
    }

    #[test]
    fn list_literals_and_length() {
        let env = env_with(&[]);
        assert_eq!(
            evaluate("[1, 2, 3]", &env).unwrap(),
            json!([1, 2, 3])
        );
        assert_eq!(evaluate("Length([1, 2, 3])", &env).unwrap(), json!(3));
        assert_eq!(evaluate("Length(\"abc\")", &env).unwrap(), json!(3));
    }

    #[test]
    fn unknown_identifier_errors() {
        let env = env_with(&[]);
        assert!(evaluate("missing", &env).is_err());
        // Scoped lookups are lenient: absent keys yield null.
        assert_eq!(evaluate("global.missing", &env).unwrap(), Value::Null);
    }

    #[test]
    fn division_by_zero_is_an_eval_error() {
        let env = env_with(&[]);
        assert!(evaluate("1 / 0", &env).is_err());
        assert!(evaluate("1 % 0", &env).is_err());
    }
}
