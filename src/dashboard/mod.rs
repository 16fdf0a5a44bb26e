//! Dashboard definitions
//!
//! - **Model**: typed dashboard JSON (panels, rows, targets, variables)
//! - **Extract**: panel-tree walk yielding SQL query templates

mod error;
mod extract;
mod model;

pub use error::{DashboardError, DashboardResult};
pub use extract::{
    extract_queries, walk_dashboard, walk_panels, PanelPath, PanelVisitor, QueryTemplate,
    DEFAULT_DATASOURCE,
};
pub use model::{
    CurrentSelection, Dashboard, DatasourceRef, LegacyRow, Panel, PanelId, Target, Templating,
    TimeWindow, VariableDecl, VariableOption, SQL_FIELDS,
};
