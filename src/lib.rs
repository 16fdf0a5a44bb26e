//! # dashql
//!
//! Dashboard query resolution: turns the templated SQL panels of a dashboard
//! definition into executable queries, runs them against a SQL engine, and
//! summarizes the results for downstream reporting.
//!
//! ## Modules
//!
//! - [`template`]: variable registry, time ranges, and the interpolation engine
//! - [`dashboard`]: dashboard JSON model and query extraction
//! - [`execution`]: SQL engines and the query execution coordinator
//! - [`summary`]: per-column descriptive statistics
//! - [`analysis`]: one end-to-end analysis run
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dashql::{AnalysisRequest, Analyzer, CancelToken, Config, SqliteEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_default();
//!     let engine = Arc::new(SqliteEngine::open("costs.db".as_ref())?);
//!     let analyzer = Analyzer::new(engine, &config)?;
//!
//!     let json = std::fs::read_to_string("dashboard.json")?;
//!     let request = AnalysisRequest::new().select("env", ["prod", "staging"]);
//!     let report = analyzer.analyze_json(&json, &request, &CancelToken::new()).await?;
//!
//!     println!("{} of {} panels succeeded", report.succeeded(), report.panels.len());
//!     Ok(())
//! }
//! ```

pub mod analysis;
pub mod config;
pub mod dashboard;
pub mod execution;
pub mod summary;
pub mod template;

// Re-export top-level types for convenience
pub use analysis::{
    render, AnalysisError, AnalysisReport, AnalysisRequest, Analyzer, PanelAnalysis,
    RenderedDashboard, RenderedQuery, ReportDiagnostic,
};

pub use config::{generate_default_config, Config, ConfigError, DatabricksConfig, ExecutionConfig};

pub use dashboard::{extract_queries, Dashboard, DashboardError, QueryTemplate};

pub use execution::{
    CancelToken, CellValue, ColumnSpec, ColumnType, CoordinatorSettings, DatabricksEngine,
    EngineError, QueryCoordinator, QueryError, QueryOutcome, QueryResult, ResolvedQuery,
    SqlEngine, SqliteEngine,
};

pub use summary::{summarize, ColumnSummary};

pub use template::{
    interpolate, Diagnostic, DiagnosticKind, Interpolated, TemplateError, TimeRange, Variable,
    VariableRegistry,
};
