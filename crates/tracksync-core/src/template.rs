//! A small text-template language for action and trigger variables.
//!
//! Templates are plain text with `{{ ... }}` actions. An action is a
//! pipeline of commands separated by `|`; each stage's result is appended as
//! the last argument of the next stage.
//!
//! ```text
//! {{ .Update.Title }}
//! {{ env "JIRA_PROJECT" }}
//! {{ .Update.Fields | keys | seq }}
//! {{ eq .Update.Fields.label "bug" }}
//! ```
//!
//! Fields are looked up in a JSON context; a missing field evaluates to
//! `null` and renders as the empty string. Functions come from an explicit
//! [`Functions`] registry, and naming a function the registry does not hold
//! is a parse error.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TemplateError(pub String);

impl TemplateError {
    fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

type Outcome<T> = std::result::Result<T, TemplateError>;

// ---------------------------------------------------------------------------
// Function registry
// ---------------------------------------------------------------------------

pub type Function = Arc<dyn Fn(&[Value]) -> Outcome<Value> + Send + Sync>;

/// Immutable table of functions callable from templates.
#[derive(Clone, Default)]
pub struct Functions {
    table: Arc<HashMap<String, Function>>,
}

impl std::fmt::Debug for Functions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.table.keys().collect();
        names.sort();
        f.debug_struct("Functions").field("names", &names).finish()
    }
}

impl Functions {
    /// An empty registry.
    pub fn empty() -> Self {
        Self::default()
    }

    /// `env`, `keys`, `values`, `seq` plus the comparison helpers used by
    /// `if` conditions.
    pub fn standard() -> Self {
        Self::empty()
            .with("env", |args| {
                let name = string_arg("env", args, 0)?;
                Ok(Value::String(std::env::var(name).unwrap_or_default()))
            })
            .with("keys", |args| {
                expect_arity("keys", args, 1)?;
                match &args[0] {
                    Value::Object(m) => Ok(Value::Array(
                        m.keys().cloned().map(Value::String).collect(),
                    )),
                    Value::Null => Ok(Value::Array(Vec::new())),
                    other => Err(TemplateError::new(format!(
                        "keys: expected a map, got {}",
                        kind(other)
                    ))),
                }
            })
            .with("values", |args| {
                expect_arity("values", args, 1)?;
                match &args[0] {
                    Value::Object(m) => Ok(Value::Array(m.values().cloned().collect())),
                    Value::Null => Ok(Value::Array(Vec::new())),
                    other => Err(TemplateError::new(format!(
                        "values: expected a map, got {}",
                        kind(other)
                    ))),
                }
            })
            .with("seq", |args| {
                expect_arity("seq", args, 1)?;
                match &args[0] {
                    Value::Array(items) => Ok(Value::String(
                        items.iter().map(render).collect::<Vec<_>>().join(","),
                    )),
                    Value::Null => Ok(Value::String(String::new())),
                    other => Err(TemplateError::new(format!(
                        "seq: expected a list, got {}",
                        kind(other)
                    ))),
                }
            })
            .with("eq", |args| {
                if args.len() < 2 {
                    return Err(TemplateError::new("eq: expected at least 2 arguments"));
                }
                Ok(Value::Bool(args[1..].iter().any(|v| loosely_equal(&args[0], v))))
            })
            .with("ne", |args| {
                expect_arity("ne", args, 2)?;
                Ok(Value::Bool(!loosely_equal(&args[0], &args[1])))
            })
            .with("not", |args| {
                expect_arity("not", args, 1)?;
                Ok(Value::Bool(!truthy(&args[0])))
            })
            .with("and", |args| Ok(Value::Bool(args.iter().all(truthy))))
            .with("or", |args| Ok(Value::Bool(args.iter().any(truthy))))
            .with("contains", |args| {
                expect_arity("contains", args, 2)?;
                let found = match (&args[0], &args[1]) {
                    (Value::String(hay), needle) => hay.contains(render(needle).as_str()),
                    (Value::Array(items), needle) => {
                        items.iter().any(|v| loosely_equal(v, needle))
                    }
                    (Value::Object(m), needle) => m.contains_key(render(needle).as_str()),
                    (Value::Null, _) => false,
                    (other, _) => {
                        return Err(TemplateError::new(format!(
                            "contains: cannot search in {}",
                            kind(other)
                        )))
                    }
                };
                Ok(Value::Bool(found))
            })
            .with("default", |args| {
                expect_arity("default", args, 2)?;
                if truthy(&args[1]) {
                    Ok(args[1].clone())
                } else {
                    Ok(args[0].clone())
                }
            })
    }

    /// Return a registry that also (or instead) maps `name` to `f`.
    pub fn with<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&[Value]) -> Outcome<Value> + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.table).insert(name.to_string(), Arc::new(f));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Function> {
        self.table.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }
}

fn expect_arity(name: &str, args: &[Value], n: usize) -> Outcome<()> {
    if args.len() != n {
        return Err(TemplateError::new(format!(
            "{name}: expected {n} argument(s), got {}",
            args.len()
        )));
    }
    Ok(())
}

fn string_arg<'a>(name: &str, args: &'a [Value], idx: usize) -> Outcome<&'a str> {
    expect_arity(name, args, idx + 1)?;
    args[idx]
        .as_str()
        .ok_or_else(|| TemplateError::new(format!("{name}: expected a string argument")))
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

/// Equality that lets `"5"` match `5`, since tracker fields are strings.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
            s == &n.to_string()
        }
        _ => a == b,
    }
}

pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(m) => !m.is_empty(),
    }
}

/// Text form of a value inside rendered output.
pub fn render(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Action(Pipeline),
}

#[derive(Debug, Clone, PartialEq)]
struct Pipeline {
    commands: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Call { name: String, args: Vec<Term> },
    Term(Term),
}

#[derive(Debug, Clone, PartialEq)]
enum Term {
    Field(Vec<String>),
    Literal(Value),
    Sub(Pipeline),
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Field(Vec<String>),
    Str(String),
    Int(i64),
    Ident(String),
    LParen,
    RParen,
    Pipe,
}

fn lex(src: &str) -> Outcome<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
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
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '.' => {
                i += 1;
                let mut path = Vec::new();
                loop {
                    let start = i;
                    while i < chars.len() && is_field_char(chars[i]) {
                        i += 1;
                    }
                    if start == i {
                        break;
                    }
                    path.push(chars[start..i].iter().collect());
                    if i < chars.len() && chars[i] == '.' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Field(path));
            }
            '"' => {
                i += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err(TemplateError::new("unterminated quoted string")),
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = match chars.get(i + 1) {
                                Some('n') => '\n',
                                Some('t') => '\t',
                                Some('"') => '"',
                                Some('\\') => '\\',
                                Some(other) => {
                                    return Err(TemplateError::new(format!(
                                        "unknown escape sequence \\{other}"
                                    )))
                                }
                                None => {
                                    return Err(TemplateError::new("unterminated quoted string"))
                                }
                            };
                            s.push(escaped);
                            i += 2;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '`' => {
                let start = i + 1;
                let Some(len) = chars[start..].iter().position(|&ch| ch == '`') else {
                    return Err(TemplateError::new("unterminated raw string"));
                };
                tokens.push(Token::Str(chars[start..start + len].iter().collect()));
                i = start + len + 1;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<i64>()
                    .map_err(|e| TemplateError::new(format!("bad number {text}: {e}")))?;
                tokens.push(Token::Int(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(TemplateError::new(format!(
                    "unexpected character {other:?} in action"
                )))
            }
        }
    }
    Ok(tokens)
}

fn is_field_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    functions: &'a Functions,
}

impl<'a> Parser<'a> {
    fn parse(src: &str, functions: &'a Functions) -> Outcome<Pipeline> {
        let mut parser = Parser {
            tokens: lex(src)?,
            pos: 0,
            functions,
        };
        let pipeline = parser.pipeline()?;
        if let Some(tok) = parser.tokens.get(parser.pos) {
            return Err(TemplateError::new(format!("unexpected {tok:?} in action")));
        }
        Ok(pipeline)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn pipeline(&mut self) -> Outcome<Pipeline> {
        let mut commands = vec![self.command()?];
        while self.peek() == Some(&Token::Pipe) {
            self.pos += 1;
            let cmd = self.command()?;
            if !matches!(cmd, Command::Call { .. }) {
                return Err(TemplateError::new(
                    "non-function command in pipeline stage",
                ));
            }
            commands.push(cmd);
        }
        Ok(Pipeline { commands })
    }

    fn command(&mut self) -> Outcome<Command> {
        if let Some(Token::Ident(name)) = self.peek().cloned() {
            match name.as_str() {
                "true" | "false" => {}
                _ => {
                    self.pos += 1;
                    if !self.functions.contains(&name) {
                        return Err(TemplateError::new(format!(
                            "function {name:?} not defined"
                        )));
                    }
                    let mut args = Vec::new();
                    while let Some(term) = self.term()? {
                        args.push(term);
                    }
                    return Ok(Command::Call { name, args });
                }
            }
        }
        let Some(first) = self.term()? else {
            return Err(TemplateError::new("missing value for command"));
        };
        if let Some(tok) = self.peek() {
            if !matches!(tok, Token::Pipe | Token::RParen) {
                return Err(TemplateError::new(format!(
                    "can't give argument to non-function (found {tok:?})"
                )));
            }
        }
        Ok(Command::Term(first))
    }

    /// Parse one argument, or `None` at a command boundary.
    fn term(&mut self) -> Outcome<Option<Term>> {
        let Some(tok) = self.peek().cloned() else {
            return Ok(None);
        };
        let term = match tok {
            Token::Pipe | Token::RParen => return Ok(None),
            Token::Field(path) => Term::Field(path),
            Token::Str(s) => Term::Literal(Value::String(s)),
            Token::Int(n) => Term::Literal(Value::from(n)),
            Token::Ident(name) if name == "true" => Term::Literal(Value::Bool(true)),
            Token::Ident(name) if name == "false" => Term::Literal(Value::Bool(false)),
            Token::Ident(name) => {
                return Err(TemplateError::new(format!(
                    "function {name:?} used as argument; wrap it in parentheses"
                )))
            }
            Token::LParen => {
                self.pos += 1;
                let inner = self.pipeline()?;
                if self.peek() != Some(&Token::RParen) {
                    return Err(TemplateError::new("unclosed left paren"));
                }
                Term::Sub(inner)
            }
        };
        self.pos += 1;
        Ok(Some(term))
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn eval_pipeline(p: &Pipeline, ctx: &Value, functions: &Functions) -> Outcome<Value> {
    let mut prev: Option<Value> = None;
    for cmd in &p.commands {
        prev = Some(eval_command(cmd, ctx, functions, prev.take())?);
    }
    Ok(prev.unwrap_or(Value::Null))
}

fn eval_command(
    cmd: &Command,
    ctx: &Value,
    functions: &Functions,
    piped: Option<Value>,
) -> Outcome<Value> {
    match cmd {
        Command::Term(term) => eval_term(term, ctx, functions),
        Command::Call { name, args } => {
            let f = functions
                .get(name)
                .ok_or_else(|| TemplateError::new(format!("function {name:?} not defined")))?;
            let mut values = args
                .iter()
                .map(|a| eval_term(a, ctx, functions))
                .collect::<Outcome<Vec<_>>>()?;
            values.extend(piped);
            f(&values).map_err(|e| TemplateError::new(format!("error calling {name}: {e}")))
        }
    }
}

fn eval_term(term: &Term, ctx: &Value, functions: &Functions) -> Outcome<Value> {
    match term {
        Term::Literal(v) => Ok(v.clone()),
        Term::Sub(p) => eval_pipeline(p, ctx, functions),
        Term::Field(path) => {
            let mut cur = ctx;
            for seg in path {
                match cur {
                    Value::Object(m) => match m.get(seg) {
                        Some(v) => cur = v,
                        None => return Ok(Value::Null),
                    },
                    Value::Null => return Ok(Value::Null),
                    other => {
                        return Err(TemplateError::new(format!(
                            "can't evaluate field {seg} in type {}",
                            kind(other)
                        )))
                    }
                }
            }
            Ok(cur.clone())
        }
    }
}

// ---------------------------------------------------------------------------
// Template / Expression
// ---------------------------------------------------------------------------

/// A parsed text template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    nodes: Vec<Node>,
}

impl Template {
    pub fn parse(src: &str, functions: &Functions) -> Outcome<Self> {
        let mut nodes = Vec::new();
        let mut rest = src;
        while let Some(open) = rest.find("{{") {
            if open > 0 {
                nodes.push(Node::Text(rest[..open].to_string()));
            }
            let after = &rest[open + 2..];
            let close = find_close(after)?;
            nodes.push(Node::Action(Parser::parse(&after[..close], functions)?));
            rest = &after[close + 2..];
        }
        if !rest.is_empty() {
            nodes.push(Node::Text(rest.to_string()));
        }
        Ok(Self { nodes })
    }

    pub fn render(&self, ctx: &Value, functions: &Functions) -> Outcome<String> {
        let mut out = String::new();
        for node in &self.nodes {
            match node {
                Node::Text(t) => out.push_str(t),
                Node::Action(p) => out.push_str(&render(&eval_pipeline(p, ctx, functions)?)),
            }
        }
        Ok(out)
    }
}

/// Byte offset of the `}}` closing an action, skipping quoted strings.
fn find_close(s: &str) -> Outcome<usize> {
    let bytes = s.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' && q == b'"' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => {
                if b == b'"' || b == b'`' {
                    quote = Some(b);
                } else if b == b'}' && bytes.get(i + 1) == Some(&b'}') {
                    return Ok(i);
                }
            }
        }
        i += 1;
    }
    Err(TemplateError::new("unclosed action"))
}

/// A single pipeline evaluated to a value, used for `if` conditions.
///
/// The surrounding `{{ }}` is optional.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pipeline: Pipeline,
}

impl Expression {
    pub fn parse(src: &str, functions: &Functions) -> Outcome<Self> {
        let trimmed = src.trim();
        let inner = trimmed
            .strip_prefix("{{")
            .and_then(|s| s.strip_suffix("}}"))
            .unwrap_or(trimmed);
        Ok(Self {
            pipeline: Parser::parse(inner, functions)?,
        })
    }

    pub fn eval(&self, ctx: &Value, functions: &Functions) -> Outcome<Value> {
        eval_pipeline(&self.pipeline, ctx, functions)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
