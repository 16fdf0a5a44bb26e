//! Query execution
//!
//! - **Engine**: the [`SqlEngine`] seam and tabular result types
//! - **Coordinator**: bounded-concurrency dispatch with per-query timeout/retry
//! - **SQLite / Databricks**: concrete engines
//! - **Cancel**: run-wide cancellation token

mod cancel;
mod coordinator;
mod databricks;
mod engine;
mod error;
mod sqlite;

pub use cancel::CancelToken;
pub use coordinator::{CoordinatorSettings, QueryCoordinator};
pub use databricks::DatabricksEngine;
pub use engine::{CellValue, ColumnSpec, ColumnType, QueryResult, ResolvedQuery, RowSet, SqlEngine};
pub use error::{EngineError, EngineErrorKind, QueryError, QueryOutcome};
pub use sqlite::SqliteEngine;
