//! Template tokenizer
//!
//! Splits a raw query template into literal text and template tokens in a
//! single left-to-right pass. Token kinds are decided here, once, so the
//! interpolation engine only dispatches on [`Token`] variants.
//!
//! # Recognized Syntax
//!
//! ```text
//! ${name}  ${name:format}            braced, matched first (greedy)
//! [[name]] [[name:format]]           legacy brackets
//! $name                              bare, ends at the first non-identifier char
//! $__timeFrom  $__timeTo             optional trailing "()"
//! $__timeFilter(column)
//! $__from  $__to                     epoch millis
//! ```
//!
//! A `$` that does not start a valid token (`$1`, `${`, `$ `) stays literal.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::char,
    combinator::{opt, recognize},
    sequence::{delimited, pair, preceded},
    IResult,
};

/// Built-in time macros
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeMacro<'a> {
    /// Range start as a quoted ISO-8601 literal
    TimeFrom,
    /// Range end as a quoted ISO-8601 literal
    TimeTo,
    /// `column >= from AND column <= to`
    TimeFilter { column: &'a str },
    /// Range start in epoch millis
    FromMillis,
    /// Range end in epoch millis
    ToMillis,
}

/// A piece of a tokenized template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token<'a> {
    /// Text copied to the output unchanged
    Literal(&'a str),
    /// Reference to a user variable
    Variable {
        name: &'a str,
        format: Option<&'a str>,
        raw: &'a str,
    },
    /// Time macro
    Macro { kind: TimeMacro<'a>, raw: &'a str },
}

impl<'a> Token<'a> {
    /// Source text of this token
    pub fn raw(&self) -> &'a str {
        match self {
            Token::Literal(text) => text,
            Token::Variable { raw, .. } | Token::Macro { raw, .. } => raw,
        }
    }
}

/// Split a template into tokens; concatenating every `raw()` yields the input
pub fn tokenize(input: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut literal_start = 0;
    let mut pos = 0;

    while pos < input.len() {
        let rest = &input[pos..];
        if rest.starts_with('$') || rest.starts_with("[[") {
            if let Some((token, consumed)) = parse_token(rest) {
                if literal_start < pos {
                    tokens.push(Token::Literal(&input[literal_start..pos]));
                }
                tokens.push(token);
                pos += consumed;
                literal_start = pos;
                continue;
            }
        }
        pos += rest.chars().next().map(char::len_utf8).unwrap_or(1);
    }

    if literal_start < input.len() {
        tokens.push(Token::Literal(&input[literal_start..]));
    }
    tokens
}

/// Names of user variables referenced by a template, in first-use order
pub fn referenced_variables(input: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for token in tokenize(input) {
        if let Token::Variable { name, .. } = token {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    names
}

/// Parse one token at the start of `input`, returning it with its byte length
fn parse_token(input: &str) -> Option<(Token<'_>, usize)> {
    if let Ok((rest, (name, format))) = alt((braced, bracketed))(input) {
        let raw = &input[..input.len() - rest.len()];
        let token = match (builtin(name), format) {
            (Some(kind), None) => Token::Macro { kind, raw },
            _ => Token::Variable { name, format, raw },
        };
        return Some((token, raw.len()));
    }

    let (rest, name) = bare(input).ok()?;
    let (rest, kind) = match name {
        "__timeFilter" => match parenthesized(rest) {
            Some((column, after)) => (after, Some(TimeMacro::TimeFilter { column })),
            None => (rest, None),
        },
        "__timeFrom" | "__timeTo" => {
            let after = rest.strip_prefix("()").unwrap_or(rest);
            (after, builtin(name))
        }
        _ => (rest, builtin(name)),
    };

    let raw = &input[..input.len() - rest.len()];
    let token = match kind {
        Some(kind) => Token::Macro { kind, raw },
        None => Token::Variable {
            name,
            format: None,
            raw,
        },
    };
    Some((token, raw.len()))
}

/// Macros that take no argument
fn builtin(name: &str) -> Option<TimeMacro<'static>> {
    match name {
        "__timeFrom" => Some(TimeMacro::TimeFrom),
        "__timeTo" => Some(TimeMacro::TimeTo),
        "__from" => Some(TimeMacro::FromMillis),
        "__to" => Some(TimeMacro::ToMillis),
        _ => None,
    }
}

/// `(column)` with balanced inner parentheses; returns the trimmed column
fn parenthesized(input: &str) -> Option<(&str, &str)> {
    let inner = input.strip_prefix('(')?;
    let mut depth = 1usize;
    for (i, c) in inner.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    let column = inner[..i].trim();
                    if column.is_empty() {
                        return None;
                    }
                    return Some((column, &inner[i + 1..]));
                }
            }
            _ => {}
        }
    }
    None
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

/// `${name}` or `${name:format}`
fn braced(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    delimited(
        tag("${"),
        pair(
            identifier,
            opt(preceded(char(':'), take_while1(|c: char| c != '}'))),
        ),
        char('}'),
    )(input)
}

/// `[[name]]` or `[[name:format]]`
fn bracketed(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    delimited(
        tag("[["),
        pair(
            identifier,
            opt(preceded(char(':'), take_while1(|c: char| c != ']'))),
        ),
        tag("]]"),
    )(input)
}

/// `$name`
fn bare(input: &str) -> IResult<&str, &str> {
    preceded(char('$'), identifier)(input)
}
