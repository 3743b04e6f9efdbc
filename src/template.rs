use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::target::Target;

static RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{\{(?P<expr>[^}]+)\}\}").unwrap());

const TRUE: &str = "true";
const FALSE: &str = "false";

/// A function callable from a template expression. Receives the evaluated
/// arguments and produces the replacement text, or a reason the call
/// cannot succeed.
pub type TemplateFn = fn(&[String]) -> Result<String, String>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty template expression")]
    EmptyExpr,

    #[error("unknown template function {0:?}")]
    UnknownFunction(String),

    #[error("function {0:?} called without arguments")]
    MissingArguments(String),

    #[error("unterminated quote in expression {0:?}")]
    UnterminatedQuote(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("missing fields on target: {0:?}")]
    MissingFields(Vec<String>),

    #[error("function {func} failed: {reason}")]
    Func { func: &'static str, reason: String },
}

/// Table of functions available to template expressions.
///
/// The table is passed to [`Template::parse`] explicitly and owned by
/// whoever builds the rule engines; there is no global registry. The
/// default table carries the boolean helpers used by match expressions.
#[derive(Clone)]
pub struct Funcs {
    table: HashMap<&'static str, TemplateFn>,
}

impl Funcs {
    pub fn empty() -> Self {
        Funcs {
            table: HashMap::new(),
        }
    }

    pub fn with(mut self, name: &'static str, func: TemplateFn) -> Self {
        self.table.insert(name, func);
        self
    }

    fn get(&self, name: &str) -> Option<(&'static str, TemplateFn)> {
        self.table
            .get_key_value(name)
            .map(|(key, func)| (*key, *func))
    }
}

impl Default for Funcs {
    fn default() -> Self {
        Funcs::empty()
            .with("glob", glob_fn)
            .with("regexp", regexp_fn)
            .with("eq", eq_fn)
    }
}

/// A text template rendered against a target's exported fields.
///
/// `{{ name }}` substitutes a field (dotted map access allowed);
/// `{{ func arg... }}` calls a function from the table, with field
/// references and double-quoted literals as arguments. A reference to a
/// missing field is a render error, never a silent blank.
#[derive(Clone, Debug)]
pub struct Template {
    src: String,
    segments: Vec<Segment>,
}

#[derive(Clone, Debug)]
enum Segment {
    Literal(String),
    Field(String),
    Call {
        name: &'static str,
        func: TemplateFn,
        args: Vec<Arg>,
    },
}

#[derive(Clone, Debug)]
enum Arg {
    Field(String),
    Literal(String),
}

impl Template {
    pub fn parse(src: &str, funcs: &Funcs) -> Result<Self, ParseError> {
        let mut segments = Vec::new();
        let mut last = 0;

        for caps in RE.captures_iter(src) {
            let all = caps.get(0).expect("capture 0 always present");
            if all.start() > last {
                segments.push(Segment::Literal(src[last..all.start()].to_string()));
            }

            let expr = caps
                .name("expr")
                .expect("expr group always present")
                .as_str();
            segments.push(parse_expr(expr, funcs)?);

            last = all.end();
        }

        if last < src.len() {
            segments.push(Segment::Literal(src[last..].to_string()));
        }

        Ok(Template {
            src: src.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.src
    }

    pub fn render(&self, target: &dyn Target) -> Result<String, RenderError> {
        let mut out = String::with_capacity(self.src.len());
        let mut missing = Vec::new();

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(name) => match target.field(name) {
                    Some(value) => out.push_str(&value),
                    None => missing.push(name.clone()),
                },
                Segment::Call { name, func, args } => {
                    let mut values = Vec::with_capacity(args.len());
                    for arg in args {
                        match arg {
                            Arg::Literal(text) => values.push(text.clone()),
                            Arg::Field(field) => match target.field(field) {
                                Some(value) => values.push(value),
                                None => missing.push(field.clone()),
                            },
                        }
                    }

                    if missing.is_empty() {
                        match func(&values) {
                            Ok(value) => out.push_str(&value),
                            Err(reason) => return Err(RenderError::Func { func: name, reason }),
                        }
                    }
                }
            }
        }

        if !missing.is_empty() {
            return Err(RenderError::MissingFields(missing));
        }

        Ok(out)
    }
}

fn parse_expr(expr: &str, funcs: &Funcs) -> Result<Segment, ParseError> {
    let tokens = tokenize(expr)?;

    let Some((first, rest)) = tokens.split_first() else {
        return Err(ParseError::EmptyExpr);
    };

    if rest.is_empty() {
        return Ok(match first {
            Token::Bare(name) => {
                // a lone function name is a call without arguments, not a
                // field reference
                if funcs.get(name).is_some() {
                    return Err(ParseError::MissingArguments(name.clone()));
                }

                Segment::Field(name.clone())
            }
            Token::Quoted(text) => Segment::Literal(text.clone()),
        });
    }

    let Token::Bare(name) = first else {
        return Err(ParseError::UnknownFunction(expr.trim().to_string()));
    };

    let Some((name, func)) = funcs.get(name) else {
        return Err(ParseError::UnknownFunction(name.clone()));
    };

    let args = rest
        .iter()
        .map(|token| match token {
            Token::Bare(field) => Arg::Field(field.clone()),
            Token::Quoted(text) => Arg::Literal(text.clone()),
        })
        .collect::<Vec<_>>();

    Ok(Segment::Call { name, func, args })
}

enum Token {
    Bare(String),
    Quoted(String),
}

fn tokenize(expr: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch.is_whitespace() {
            continue;
        }

        if ch == '"' {
            let mut text = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some(ch) => text.push(ch),
                    None => return Err(ParseError::UnterminatedQuote(expr.trim().to_string())),
                }
            }
            tokens.push(Token::Quoted(text));
            continue;
        }

        let mut word = String::from(ch);
        while let Some(next) = chars.peek() {
            if next.is_whitespace() || *next == '"' {
                break;
            }
            word.push(chars.next().expect("peeked"));
        }
        tokens.push(Token::Bare(word));
    }

    if tokens.is_empty() {
        return Err(ParseError::EmptyExpr);
    }

    Ok(tokens)
}

fn bool_str(value: bool) -> String {
    if value { TRUE.into() } else { FALSE.into() }
}

fn operands<'a>(name: &str, args: &'a [String]) -> Result<(&'a str, &'a [String]), String> {
    if args.len() < 2 {
        return Err(format!("{name} expects a value and at least one operand"));
    }

    Ok((&args[0], &args[1..]))
}

fn glob_fn(args: &[String]) -> Result<String, String> {
    let (value, patterns) = operands("glob", args)?;

    for pattern in patterns {
        let pattern = glob::Pattern::new(pattern)
            .map_err(|err| format!("invalid glob pattern {pattern:?}: {err}"))?;

        if pattern.matches(value) {
            return Ok(bool_str(true));
        }
    }

    Ok(bool_str(false))
}

fn regexp_fn(args: &[String]) -> Result<String, String> {
    let (value, patterns) = operands("regexp", args)?;

    for pattern in patterns {
        let pattern = Regex::new(pattern)
            .map_err(|err| format!("invalid regular expression {pattern:?}: {err}"))?;

        if pattern.is_match(value) {
            return Ok(bool_str(true));
        }
    }

    Ok(bool_str(false))
}

fn eq_fn(args: &[String]) -> Result<String, String> {
    let (value, others) = operands("eq", args)?;

    Ok(bool_str(others.iter().any(|other| other == value)))
}
