//! Interpolation Engine
//!
//! Rewrites a query template into executable SQL:
//!
//! ```text
//! template → tokenize → per-token expansion → SQL + diagnostics
//! ```
//!
//! Each token is expanded exactly once and the produced text is never
//! scanned again, so values containing `$` or quotes cannot trigger a second
//! substitution. Problems never abort a template: the offending token is
//! written back verbatim and a [`Diagnostic`] is recorded.

use crate::template::error::{Diagnostic, DiagnosticKind, TemplateResult};
use crate::template::format::Format;
use crate::template::registry::{Binding, VariableRegistry};
use crate::template::time::{ResolvedTimeRange, TimeRange};
use crate::template::token::{tokenize, TimeMacro, Token};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::iter::Peekable;
use std::sync::OnceLock;

/// Output of one interpolation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Interpolated {
    pub text: String,
    pub diagnostics: Vec<Diagnostic>,
}

impl Interpolated {
    /// True when every token resolved cleanly
    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

/// Interpolate a template against a registry and an unresolved time range
pub fn interpolate(
    template: &str,
    registry: &VariableRegistry,
    time_range: &TimeRange,
    now: DateTime<Utc>,
) -> Interpolated {
    Interpolator::new(registry, time_range.resolve(now)).interpolate(template)
}

/// Expands templates for one analysis run
pub struct Interpolator<'r> {
    registry: &'r VariableRegistry,
    time: TemplateResult<ResolvedTimeRange>,
}

impl<'r> Interpolator<'r> {
    /// Create an interpolator. A failed time resolution is kept and reported
    /// on every time macro instead of failing here.
    pub fn new(registry: &'r VariableRegistry, time: TemplateResult<ResolvedTimeRange>) -> Self {
        Self { registry, time }
    }

    /// Expand every token of `template`
    pub fn interpolate(&self, template: &str) -> Interpolated {
        let mut state = Expansion {
            out: String::with_capacity(template.len()),
            diagnostics: Vec::new(),
            strip_next: None,
        };
        let mut tokens = tokenize(template).into_iter().peekable();
        let mut offset = 0;

        while let Some(token) = tokens.next() {
            let preceding = &template[..offset];
            offset += token.raw().len();

            match token {
                Token::Literal(text) => state.push_literal(text),
                Token::Macro { kind, raw } => self.expand_macro(kind, raw, &mut state),
                Token::Variable { name, format, raw } => {
                    self.expand_variable(name, format, raw, preceding, &mut tokens, &mut state)
                }
            }
        }

        Interpolated {
            text: state.out,
            diagnostics: state.diagnostics,
        }
    }

    fn expand_macro(&self, kind: TimeMacro<'_>, raw: &str, state: &mut Expansion) {
        let range = match &self.time {
            Ok(range) => range,
            Err(e) => {
                state.out.push_str(raw);
                state.diagnose(DiagnosticKind::InvalidTimeSpec, raw, e.to_string());
                return;
            }
        };

        let expanded = match kind {
            TimeMacro::TimeFrom => format!("'{}'", range.from_iso()),
            TimeMacro::TimeTo => format!("'{}'", range.to_iso()),
            TimeMacro::TimeFilter { column } => format!(
                "{} >= '{}' AND {} <= '{}'",
                column,
                range.from_iso(),
                column,
                range.to_iso()
            ),
            TimeMacro::FromMillis => range.from_millis.to_string(),
            TimeMacro::ToMillis => range.to_millis.to_string(),
        };
        state.out.push_str(&expanded);
    }

    fn expand_variable<'t, I>(
        &self,
        name: &str,
        format: Option<&str>,
        raw: &str,
        preceding: &str,
        tokens: &mut Peekable<I>,
        state: &mut Expansion,
    ) where
        I: Iterator<Item = Token<'t>>,
    {
        let binding = match self.registry.binding(name) {
            Ok(binding) => binding,
            Err(e) => {
                state.out.push_str(raw);
                state.diagnose(DiagnosticKind::UnresolvedToken, raw, e.to_string());
                return;
            }
        };

        let format = format.and_then(|f| {
            let parsed = Format::parse(f);
            if parsed.is_none() {
                state.diagnose(
                    DiagnosticKind::UnknownFormat,
                    raw,
                    format!("unknown format '{}', using default formatting", f),
                );
            }
            parsed
        });

        match binding {
            Binding::Values { values, .. } if values.is_empty() => {
                state.out.push_str(raw);
                state.diagnose(
                    DiagnosticKind::UnresolvedToken,
                    raw,
                    format!("variable {} has no selected values", name),
                );
            }
            Binding::Values { values, multi } => {
                let format = format
                    .unwrap_or_else(|| default_format(preceding, multi || values.len() > 1));
                state.out.push_str(&format.apply(&values));
            }
            Binding::AllCustom(all_value) => state.out.push_str(&all_value),
            Binding::AllUnknown => {
                let next = match tokens.peek() {
                    Some(Token::Literal(text)) => Some(*text),
                    _ => None,
                };
                if state.rewrite_as_tautology(next) {
                    state.diagnose(
                        DiagnosticKind::AllValuesFallback,
                        raw,
                        format!(
                            "no candidate values known for {}, predicate replaced by a tautology",
                            name
                        ),
                    );
                } else {
                    state.out.push_str(raw);
                    state.diagnose(
                        DiagnosticKind::AllValuesFallback,
                        raw,
                        format!(
                            "no candidate values known for {} and no enclosing predicate to rewrite",
                            name
                        ),
                    );
                }
            }
        }
    }
}

/// Formatting used when a token names no format.
///
/// Single values are written as-is. Multiple values are quoted as SQL
/// strings directly after `IN (`, and comma-joined unquoted elsewhere.
fn default_format(preceding: &str, multi: bool) -> Format {
    if !multi {
        Format::Raw
    } else if in_clause_re().is_some_and(|re| re.is_match(preceding)) {
        Format::SqlString
    } else {
        Format::Csv
    }
}

fn in_clause_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bIN\s*\(\s*$").ok()).as_ref()
}

fn in_predicate_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)[A-Za-z_][\w."`\[\]]*\s+(NOT\s+)?IN\s*\(\s*$"#).ok())
        .as_ref()
}

fn eq_predicate_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)[A-Za-z_][\w."`\[\]]*\s*(=|\s+LIKE)\s*(')?$"#).ok())
        .as_ref()
}

/// Mutable output of one interpolation
struct Expansion {
    out: String,
    diagnostics: Vec<Diagnostic>,
    /// Closing text that the next literal must start with and that has
    /// already been accounted for by a rewrite
    strip_next: Option<char>,
}

impl Expansion {
    fn diagnose(&mut self, kind: DiagnosticKind, token: &str, message: impl Into<String>) {
        tracing::debug!(%kind, token, "interpolation diagnostic");
        self.diagnostics.push(Diagnostic::new(kind, token, message));
    }

    fn push_literal(&mut self, text: &str) {
        match self.strip_next.take() {
            Some(close) => {
                let trimmed = text.trim_start();
                self.out.push_str(trimmed.strip_prefix(close).unwrap_or(trimmed));
            }
            None => self.out.push_str(text),
        }
    }

    /// Replace the predicate that encloses an "All" token with `1=1`
    /// (`1=0` for `NOT IN`). Returns false when no supported predicate
    /// surrounds the token.
    fn rewrite_as_tautology(&mut self, next: Option<&str>) -> bool {
        let next = next.map(str::trim_start).unwrap_or("");

        if let Some(caps) = in_predicate_re().and_then(|re| re.captures(&self.out)) {
            if !next.starts_with(')') {
                return false;
            }
            let start = caps.get(0).map(|m| m.start()).unwrap_or(self.out.len());
            let negated = caps.get(1).is_some();
            self.out.truncate(start);
            self.out.push_str(if negated { "1=0" } else { "1=1" });
            self.strip_next = Some(')');
            return true;
        }

        if let Some(caps) = eq_predicate_re().and_then(|re| re.captures(&self.out)) {
            let quoted = caps.get(2).is_some();
            if quoted && !next.starts_with('\'') {
                return false;
            }
            let start = caps.get(0).map(|m| m.start()).unwrap_or(self.out.len());
            self.out.truncate(start);
            self.out.push_str("1=1");
            if quoted {
                self.strip_next = Some('\'');
            }
            return true;
        }

        false
    }
}
