//! Template error and diagnostic types
//!
//! Errors are returned by the registry and the time resolver. The
//! interpolation engine never fails: it turns these errors into
//! [`Diagnostic`]s and keeps going.

use serde::Serialize;
use thiserror::Error;

/// Errors that can occur while resolving template inputs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// Variable was never declared on the dashboard
    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    /// Time expression could not be parsed
    #[error("Invalid time spec: {0}")]
    InvalidTimeSpec(String),

    /// Resolved `from` lies after resolved `to`
    #[error("Invalid time range: from ({from}) is after to ({to})")]
    InvalidTimeRange { from: i64, to: i64 },

    /// The all-values sentinel is selected but no candidates are known
    #[error("No candidate values known for variable: {0}")]
    AllValuesUnavailable(String),
}

/// Result type for template operations
pub type TemplateResult<T> = Result<T, TemplateError>;

/// Kind of a non-fatal interpolation problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Token left verbatim because its variable is unknown
    UnresolvedToken,
    /// Time macro left verbatim because the time range did not resolve
    InvalidTimeSpec,
    /// All-values selection had no candidates and was rewritten or kept
    AllValuesFallback,
    /// `${name:format}` named a format that does not exist
    UnknownFormat,
}

impl std::fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnresolvedToken => write!(f, "unresolved_token"),
            Self::InvalidTimeSpec => write!(f, "invalid_time_spec"),
            Self::AllValuesFallback => write!(f, "all_values_fallback"),
            Self::UnknownFormat => write!(f, "unknown_format"),
        }
    }
}

/// A recorded interpolation problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// Raw token text as it appeared in the template
    pub token: String,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, token: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            token: token.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.token, self.message)
    }
}
