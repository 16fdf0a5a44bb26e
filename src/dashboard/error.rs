//! Dashboard error types

use thiserror::Error;

/// Errors that make a dashboard definition unusable
#[derive(Error, Debug)]
pub enum DashboardError {
    /// Input is not valid JSON or does not match the dashboard shape
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// JSON parsed but is not a dashboard
    #[error("Invalid dashboard structure: {0}")]
    InvalidStructure(String),

    /// Reading the definition from disk failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for dashboard operations
pub type DashboardResult<T> = Result<T, DashboardError>;
