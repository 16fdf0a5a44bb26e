//! Query execution error types
//!
//! Engines report [`EngineError`]; the coordinator folds those into the
//! per-panel [`QueryError`] taxonomy. Neither is fatal to an analysis run.

use crate::execution::engine::QueryResult;
use serde::Serialize;
use thiserror::Error;

/// How an engine failure should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineErrorKind {
    /// Connection reset, throttling, 5xx, warehouse starting up
    Transient,
    /// The statement itself was rejected
    Syntax,
    /// Credentials missing or insufficient
    Permission,
    /// The engine gave up waiting on the statement
    Timeout,
    /// The engine cannot be reached at all
    Unreachable,
    Internal,
}

/// Failure reported by a [`crate::execution::SqlEngine`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Transient, message)
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Syntax, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Permission, message)
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Unreachable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Internal, message)
    }
}

/// Per-panel query failure
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryError {
    #[error("Query timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("Transient engine failure: {message}")]
    Transient { message: String },

    #[error("Query rejected: {message}")]
    Syntax { message: String },

    #[error("Permission denied: {message}")]
    Permission { message: String },

    /// The run was cancelled before this query finished
    #[error("Query cancelled")]
    Cancelled,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl QueryError {
    /// Only transient failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueryError::Transient { .. })
    }
}

impl From<EngineError> for QueryError {
    fn from(err: EngineError) -> Self {
        let message = err.message;
        match err.kind {
            EngineErrorKind::Transient | EngineErrorKind::Unreachable => {
                QueryError::Transient { message }
            }
            EngineErrorKind::Syntax => QueryError::Syntax { message },
            EngineErrorKind::Permission => QueryError::Permission { message },
            // Engine-side timeouts carry no duration; the coordinator's own
            // deadline is reported instead.
            EngineErrorKind::Timeout => QueryError::Timeout { after_ms: 0 },
            EngineErrorKind::Internal => QueryError::Internal { message },
        }
    }
}

/// Outcome of one panel query
pub type QueryOutcome = Result<QueryResult, QueryError>;
