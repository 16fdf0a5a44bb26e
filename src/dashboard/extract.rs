//! Query Extraction
//!
//! Walks the panel tree of a dashboard and yields one [`QueryTemplate`] per
//! SQL-bearing target. Rows are expanded recursively whether collapsed or
//! not; panels without SQL targets are skipped.

use crate::dashboard::model::{Dashboard, DatasourceRef, Panel};
use crate::template::referenced_variables;
use serde::Serialize;

/// Datasource reference used when neither target nor panel names one
pub const DEFAULT_DATASOURCE: &str = "default";

/// A raw query template taken from a dashboard panel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryTemplate {
    pub panel_id: String,
    /// Target ref id within the panel (`A`, `B`, ...)
    pub ref_id: String,
    pub title: String,
    pub raw_text: String,
    pub datasource_ref: String,
    /// Variables referenced by `raw_text`, in first-use order
    pub variables: Vec<String>,
}

/// Position of a panel in the tree
#[derive(Debug, Clone)]
pub struct PanelPath<'a> {
    /// Index at each nesting level
    pub indices: Vec<usize>,
    /// Nearest ancestor datasource, if any
    pub inherited_datasource: Option<&'a DatasourceRef>,
}

impl PanelPath<'_> {
    /// Positional id such as `p2.1`
    pub fn positional_id(&self) -> String {
        let parts: Vec<String> = self.indices.iter().map(|i| i.to_string()).collect();
        format!("p{}", parts.join("."))
    }
}

/// Visitor over the panel tree
pub trait PanelVisitor<'a> {
    fn visit_panel(&mut self, panel: &'a Panel, path: &PanelPath<'a>);
}

/// Depth-first walk of `panels`, children after their row
pub fn walk_panels<'a, V>(panels: &'a [Panel], path: &PanelPath<'a>, visitor: &mut V)
where
    V: PanelVisitor<'a> + ?Sized,
{
    for (index, panel) in panels.iter().enumerate() {
        let mut child_path = path.clone();
        child_path.indices.push(index);

        visitor.visit_panel(panel, &child_path);

        if !panel.panels.is_empty() {
            if panel.datasource.is_some() {
                child_path.inherited_datasource = panel.datasource.as_ref();
            }
            walk_panels(&panel.panels, &child_path, visitor);
        }
    }
}

/// Walk every panel of a dashboard, including legacy `rows[]`
pub fn walk_dashboard<'a, V>(dashboard: &'a Dashboard, visitor: &mut V)
where
    V: PanelVisitor<'a> + ?Sized,
{
    let root = PanelPath {
        indices: Vec::new(),
        inherited_datasource: None,
    };
    walk_panels(&dashboard.panels, &root, visitor);

    let offset = dashboard.panels.len();
    for (index, row) in dashboard.rows.iter().enumerate() {
        let row_path = PanelPath {
            indices: vec![offset + index],
            inherited_datasource: None,
        };
        walk_panels(&row.panels, &row_path, visitor);
    }
}

/// Collects query templates while walking
#[derive(Debug, Default)]
struct TemplateCollector {
    templates: Vec<QueryTemplate>,
    skipped_panels: usize,
}

impl<'a> PanelVisitor<'a> for TemplateCollector {
    fn visit_panel(&mut self, panel: &'a Panel, path: &PanelPath<'a>) {
        if panel.is_row() {
            return;
        }

        let panel_id = panel
            .id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| path.positional_id());

        let before = self.templates.len();
        for (index, target) in panel.targets.iter().enumerate() {
            if target.hide {
                continue;
            }
            let Some(sql) = target.sql() else {
                continue;
            };

            let datasource_ref = resolve_datasource(
                target.datasource.as_ref(),
                panel.datasource.as_ref(),
                path.inherited_datasource,
            );

            self.templates.push(QueryTemplate {
                panel_id: panel_id.clone(),
                ref_id: target
                    .ref_id
                    .clone()
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| default_ref_id(index)),
                title: panel.title.clone(),
                raw_text: sql.to_string(),
                datasource_ref,
                variables: referenced_variables(sql),
            });
        }

        if self.templates.len() == before {
            tracing::debug!(panel_id = %panel_id, kind = %panel.kind, "Panel has no SQL targets, skipping");
            self.skipped_panels += 1;
        }
    }
}

/// First non-mixed datasource among target, panel, and ancestors
fn resolve_datasource(
    target: Option<&DatasourceRef>,
    panel: Option<&DatasourceRef>,
    inherited: Option<&DatasourceRef>,
) -> String {
    [target, panel, inherited]
        .into_iter()
        .flatten()
        .filter(|ds| !ds.is_mixed())
        .find_map(|ds| ds.id())
        .unwrap_or(DEFAULT_DATASOURCE)
        .to_string()
}

/// `A`, `B`, ... `Z`, `AA`, `AB`, ...
fn default_ref_id(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// Extract every SQL query template from a dashboard
pub fn extract_queries(dashboard: &Dashboard) -> Vec<QueryTemplate> {
    let mut collector = TemplateCollector::default();
    walk_dashboard(dashboard, &mut collector);

    tracing::info!(
        templates = collector.templates.len(),
        skipped_panels = collector.skipped_panels,
        "Extracted query templates"
    );
    collector.templates
}
