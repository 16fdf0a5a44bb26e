//! Analysis runs
//!
//! One run takes a dashboard through every stage:
//!
//! ```text
//! extract → registry + time range → interpolate → execute → summarize
//! ```
//!
//! Token problems and failing panels are reported inside the
//! [`AnalysisReport`]. Only an unusable dashboard, invalid run configuration,
//! or an unreachable engine fail the run as a whole.

use crate::config::Config;
use crate::dashboard::{extract_queries, Dashboard, DashboardError, QueryTemplate};
use crate::execution::{
    CancelToken, CoordinatorSettings, EngineError, QueryCoordinator, QueryError, QueryOutcome,
    QueryResult, ResolvedQuery, SqlEngine,
};
use crate::summary::{summarize, ColumnSummary};
use crate::template::{
    Diagnostic, DiagnosticKind, Interpolator, RegistryBuilder, ResolvedTimeRange, TimeRange,
};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

/// Errors that abort a whole run
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Dashboard error: {0}")]
    Dashboard(#[from] DashboardError),

    #[error("SQL engine unreachable: {0}")]
    EngineUnreachable(EngineError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Caller inputs for one run
#[derive(Debug, Clone, Default)]
pub struct AnalysisRequest {
    /// Overrides for variable selections, by variable name
    pub selections: HashMap<String, Vec<String>>,
    /// Overrides the dashboard's own time range
    pub time_range: Option<TimeRange>,
    /// Reference instant for relative time specs (defaults to the wall clock)
    pub now: Option<DateTime<Utc>>,
}

impl AnalysisRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selections
            .insert(name.into(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_time_range(mut self, range: TimeRange) -> Self {
        self.time_range = Some(range);
        self
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }
}

/// A template after interpolation
#[derive(Debug, Clone, Serialize)]
pub struct RenderedQuery {
    pub template: QueryTemplate,
    pub sql: String,
    pub diagnostics: Vec<Diagnostic>,
}

impl RenderedQuery {
    pub fn to_resolved(&self) -> ResolvedQuery {
        ResolvedQuery::new(&self.template.panel_id, &self.template.ref_id, &self.sql)
    }
}

/// Every SQL query of a dashboard, resolved for one set of inputs
#[derive(Debug, Clone, Serialize)]
pub struct RenderedDashboard {
    pub time_range: TimeRange,
    /// `None` when the range could not be resolved
    pub resolved_time_range: Option<ResolvedTimeRange>,
    pub queries: Vec<RenderedQuery>,
    /// Problems not tied to a single query
    pub diagnostics: Vec<Diagnostic>,
}

/// Resolve every query template of `dashboard`.
///
/// Time range precedence: the request, then the dashboard, then `fallback`.
pub fn render(dashboard: &Dashboard, request: &AnalysisRequest, fallback: &TimeRange) -> RenderedDashboard {
    let registry = RegistryBuilder::new()
        .register_all(dashboard.variables())
        .with_selections(&request.selections)
        .seal();

    let time_range = request
        .time_range
        .or_else(|| dashboard.default_time_range())
        .unwrap_or(*fallback);
    let now = request.now.unwrap_or_else(Utc::now);

    let resolved = time_range.resolve(now);
    let mut diagnostics = Vec::new();
    if let Err(e) = &resolved {
        tracing::warn!("Time range {} to {} is unusable: {}", time_range.from, time_range.to, e);
        diagnostics.push(Diagnostic::new(
            DiagnosticKind::InvalidTimeSpec,
            format!("{}..{}", time_range.from, time_range.to),
            e.to_string(),
        ));
    }
    let resolved_time_range = resolved.as_ref().ok().copied();

    let interpolator = Interpolator::new(&registry, resolved);
    let queries: Vec<RenderedQuery> = extract_queries(dashboard)
        .into_iter()
        .map(|template| {
            let out = interpolator.interpolate(&template.raw_text);
            RenderedQuery {
                template,
                sql: out.text,
                diagnostics: out.diagnostics,
            }
        })
        .collect();

    let degraded = queries.iter().filter(|q| !q.diagnostics.is_empty()).count();
    if degraded > 0 {
        tracing::warn!(queries = queries.len(), degraded, "Some queries resolved with diagnostics");
    }

    RenderedDashboard {
        time_range,
        resolved_time_range,
        queries,
        diagnostics,
    }
}

/// Per-panel part of a report
#[derive(Debug, Clone, Serialize)]
pub struct PanelAnalysis {
    pub panel_id: String,
    pub ref_id: String,
    pub title: String,
    pub datasource: String,
    pub sql: String,
    #[serde(serialize_with = "serialize_outcome")]
    pub outcome: QueryOutcome,
    pub summary: Vec<ColumnSummary>,
}

impl PanelAnalysis {
    pub fn result(&self) -> Option<&QueryResult> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&QueryError> {
        self.outcome.as_ref().err()
    }
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum OutcomeView<'a> {
    Ok { row_count: usize, result: &'a QueryResult },
    Error { error: &'a QueryError },
}

fn serialize_outcome<S: Serializer>(outcome: &QueryOutcome, serializer: S) -> Result<S::Ok, S::Error> {
    let view = match outcome {
        Ok(result) => OutcomeView::Ok {
            row_count: result.row_count(),
            result,
        },
        Err(error) => OutcomeView::Error { error },
    };
    view.serialize(serializer)
}

/// A diagnostic with the query it came from, if any
#[derive(Debug, Clone, Serialize)]
pub struct ReportDiagnostic {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub panel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,
    #[serde(flatten)]
    pub diagnostic: Diagnostic,
}

/// Output of one analysis run
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub run_id: Uuid,
    pub dashboard_uid: Option<String>,
    pub dashboard_title: String,
    pub time_range: Option<ResolvedTimeRange>,
    pub panels: Vec<PanelAnalysis>,
    pub diagnostics: Vec<ReportDiagnostic>,
}

impl AnalysisReport {
    pub fn succeeded(&self) -> usize {
        self.panels.iter().filter(|p| p.outcome.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.panels.len() - self.succeeded()
    }

    /// Look up a panel by `(panel_id, ref_id)`
    pub fn panel(&self, panel_id: &str, ref_id: &str) -> Option<&PanelAnalysis> {
        self.panels
            .iter()
            .find(|p| p.panel_id == panel_id && p.ref_id == ref_id)
    }
}

/// Runs analyses against one engine
pub struct Analyzer {
    engine: Arc<dyn SqlEngine>,
    coordinator: QueryCoordinator,
    default_range: TimeRange,
}

impl Analyzer {
    /// Build an analyzer from configuration
    pub fn new(engine: Arc<dyn SqlEngine>, config: &Config) -> Result<Self, AnalysisError> {
        let default_range =
            TimeRange::parse(&config.analysis.default_from, &config.analysis.default_to)
                .map_err(|e| AnalysisError::Config(format!("analysis default time range: {}", e)))?;

        if config.execution.concurrency_limit == 0 {
            return Err(AnalysisError::Config(
                "execution.concurrency_limit must be at least 1".to_string(),
            ));
        }

        Ok(Self::with_settings(
            engine,
            CoordinatorSettings::from(&config.execution),
            default_range,
        ))
    }

    pub fn with_settings(
        engine: Arc<dyn SqlEngine>,
        settings: CoordinatorSettings,
        default_range: TimeRange,
    ) -> Self {
        let coordinator = QueryCoordinator::new(Arc::clone(&engine), settings);
        Self {
            engine,
            coordinator,
            default_range,
        }
    }

    /// Parse a dashboard definition and analyze it
    pub async fn analyze_json(
        &self,
        json: &str,
        request: &AnalysisRequest,
        cancel: &CancelToken,
    ) -> Result<AnalysisReport, AnalysisError> {
        let dashboard = Dashboard::from_json(json)?;
        self.analyze(&dashboard, request, cancel).await
    }

    /// Run every SQL panel of `dashboard` and summarize the results
    pub async fn analyze(
        &self,
        dashboard: &Dashboard,
        request: &AnalysisRequest,
        cancel: &CancelToken,
    ) -> Result<AnalysisReport, AnalysisError> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("analysis", run_id = %run_id, dashboard = %dashboard.title);

        self.run(run_id, dashboard, request, cancel)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        run_id: Uuid,
        dashboard: &Dashboard,
        request: &AnalysisRequest,
        cancel: &CancelToken,
    ) -> Result<AnalysisReport, AnalysisError> {
        let rendered = render(dashboard, request, &self.default_range);
        tracing::info!(queries = rendered.queries.len(), "Resolved dashboard queries");

        let mut diagnostics: Vec<ReportDiagnostic> = rendered
            .diagnostics
            .iter()
            .cloned()
            .map(|diagnostic| ReportDiagnostic {
                panel_id: None,
                ref_id: None,
                diagnostic,
            })
            .collect();
        for query in &rendered.queries {
            diagnostics.extend(query.diagnostics.iter().cloned().map(|diagnostic| ReportDiagnostic {
                panel_id: Some(query.template.panel_id.clone()),
                ref_id: Some(query.template.ref_id.clone()),
                diagnostic,
            }));
        }

        let outcomes = if rendered.queries.is_empty() {
            Vec::new()
        } else {
            if let Err(e) = self.engine.health_check().await {
                tracing::error!(engine = self.engine.name(), "SQL engine unreachable: {}", e);
                return Err(AnalysisError::EngineUnreachable(e));
            }

            let resolved: Vec<ResolvedQuery> =
                rendered.queries.iter().map(RenderedQuery::to_resolved).collect();
            self.coordinator.execute(&resolved, cancel).await
        };

        let panels: Vec<PanelAnalysis> = rendered
            .queries
            .into_iter()
            .zip(outcomes)
            .map(|(query, outcome)| {
                let summary = outcome.as_ref().map(summarize).unwrap_or_default();
                PanelAnalysis {
                    panel_id: query.template.panel_id,
                    ref_id: query.template.ref_id,
                    title: query.template.title,
                    datasource: query.template.datasource_ref,
                    sql: query.sql,
                    outcome,
                    summary,
                }
            })
            .collect();

        let report = AnalysisReport {
            run_id,
            dashboard_uid: dashboard.uid.clone(),
            dashboard_title: dashboard.title.clone(),
            time_range: rendered.resolved_time_range,
            panels,
            diagnostics,
        };

        if report.failed() > 0 {
            tracing::warn!(
                succeeded = report.succeeded(),
                failed = report.failed(),
                "Analysis finished with partial results"
            );
        } else {
            tracing::info!(panels = report.panels.len(), "Analysis finished");
        }
        Ok(report)
    }
}
