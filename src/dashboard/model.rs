//! Dashboard definition model
//!
//! Typed view of a Grafana-style dashboard JSON document. Only the parts the
//! analysis needs are modelled; everything else is ignored on load. Missing
//! and `null` fields both fall back to defaults so that hand-edited and
//! exported dashboards load alike.

use crate::dashboard::error::{DashboardError, DashboardResult};
use crate::template::{TimeRange, Variable, VariableKind, ALL_SENTINEL};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::path::Path;

/// Target fields that may hold SQL, checked in this order
pub const SQL_FIELDS: &[&str] = &["rawSql", "rawSqlQuery", "rawQueryText", "sql", "query"];

/// Datasource name that delegates to each target's own datasource
const MIXED_DATASOURCE: &str = "-- Mixed --";

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A dashboard definition
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Dashboard {
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub panels: Vec<Panel>,
    /// Pre-panel-grid schema: panels grouped under rows
    #[serde(default, deserialize_with = "null_as_default")]
    pub rows: Vec<LegacyRow>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub templating: Templating,
    #[serde(default)]
    pub time: Option<TimeWindow>,
}

impl Dashboard {
    /// Parse a dashboard, accepting either the bare object or the API
    /// envelope `{"dashboard": {...}, "meta": {...}}`
    pub fn from_json(input: &str) -> DashboardResult<Self> {
        let value: Value = serde_json::from_str(input)?;
        Self::from_value(value)
    }

    /// Build a dashboard from an already-parsed JSON value
    pub fn from_value(value: Value) -> DashboardResult<Self> {
        let mut object = match value {
            Value::Object(object) => object,
            other => {
                return Err(DashboardError::InvalidStructure(format!(
                    "expected a JSON object, found {}",
                    json_type_name(&other)
                )))
            }
        };

        if let Some(Value::Object(inner)) = object.remove("dashboard") {
            object = inner;
        }

        Ok(serde_json::from_value(Value::Object(object))?)
    }

    /// Read and parse a dashboard file
    pub fn load(path: &Path) -> DashboardResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Template variables in declaration order
    pub fn variables(&self) -> Vec<Variable> {
        self.templating
            .list
            .iter()
            .filter(|decl| !decl.name.is_empty())
            .map(VariableDecl::to_variable)
            .collect()
    }

    /// Default time range, if the dashboard declares a parseable one
    pub fn default_time_range(&self) -> Option<TimeRange> {
        let window = self.time.as_ref()?;
        match TimeRange::parse(&window.from, &window.to) {
            Ok(range) => Some(range),
            Err(e) => {
                tracing::warn!("Ignoring dashboard time range: {}", e);
                None
            }
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Dashboard-level time window
#[derive(Debug, Clone, Deserialize)]
pub struct TimeWindow {
    pub from: String,
    pub to: String,
}

/// Row in the legacy `rows[]` schema
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LegacyRow {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub panels: Vec<Panel>,
}

/// Panel id as it appears in JSON
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PanelId {
    Number(i64),
    Text(String),
}

impl std::fmt::Display for PanelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PanelId::Number(n) => write!(f, "{}", n),
            PanelId::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Datasource reference: a plain name or a `{type, uid}` object
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum DatasourceRef {
    Name(String),
    Object {
        #[serde(default)]
        uid: Option<String>,
        #[serde(default, rename = "type")]
        kind: Option<String>,
    },
}

impl DatasourceRef {
    /// Identifier used downstream (uid, else type, else name)
    pub fn id(&self) -> Option<&str> {
        match self {
            DatasourceRef::Name(name) if !name.is_empty() => Some(name.as_str()),
            DatasourceRef::Name(_) => None,
            DatasourceRef::Object { uid, kind } => uid
                .as_deref()
                .filter(|s| !s.is_empty())
                .or(kind.as_deref().filter(|s| !s.is_empty())),
        }
    }

    /// True for the mixed-datasource placeholder
    pub fn is_mixed(&self) -> bool {
        self.id() == Some(MIXED_DATASOURCE)
    }
}

/// A panel; rows are panels whose children live in `panels`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Panel {
    #[serde(default)]
    pub id: Option<PanelId>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, rename = "type", deserialize_with = "null_as_default")]
    pub kind: String,
    #[serde(default)]
    pub datasource: Option<DatasourceRef>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub targets: Vec<Target>,
    /// Children of a row panel (present when the row is collapsed)
    #[serde(default, deserialize_with = "null_as_default")]
    pub panels: Vec<Panel>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub collapsed: bool,
}

impl Panel {
    pub fn is_row(&self) -> bool {
        self.kind == "row"
    }
}

/// One query target of a panel
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(default)]
    pub ref_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub hide: bool,
    #[serde(default)]
    pub datasource: Option<DatasourceRef>,
    /// Remaining target fields, datasource specific
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Target {
    /// SQL text of this target, if it carries any
    pub fn sql(&self) -> Option<&str> {
        SQL_FIELDS.iter().find_map(|field| {
            self.fields
                .get(*field)
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
        })
    }
}

/// `templating` section
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Templating {
    #[serde(default, deserialize_with = "null_as_default")]
    pub list: Vec<VariableDecl>,
}

/// A variable as declared in dashboard JSON
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDecl {
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub current: Option<CurrentSelection>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub options: Vec<VariableOption>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub multi: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub include_all: bool,
    #[serde(default)]
    pub all_value: Option<String>,
    #[serde(default)]
    pub query: Option<Value>,
}

/// `current` selection of a variable
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CurrentSelection {
    #[serde(default)]
    pub text: Option<Value>,
    #[serde(default)]
    pub value: Option<Value>,
}

/// One entry of a variable's `options`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VariableOption {
    #[serde(default)]
    pub text: Option<Value>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub selected: bool,
}

impl VariableDecl {
    /// Convert to a registry variable
    pub fn to_variable(&self) -> Variable {
        let kind = VariableKind::parse(self.kind.as_deref().unwrap_or("query"));
        let query = self.query_text();

        let mut options: Vec<String> = self
            .options
            .iter()
            .flat_map(|o| o.value.as_ref().map(value_strings).unwrap_or_default())
            .filter(|v| v != ALL_SENTINEL)
            .collect();
        if options.is_empty() && kind == VariableKind::Custom {
            options = query.as_deref().map(parse_custom_options).unwrap_or_default();
        }

        let mut current_values = self
            .current
            .as_ref()
            .and_then(|c| c.value.as_ref())
            .map(value_strings)
            .unwrap_or_default();
        if current_values.is_empty() {
            current_values = self
                .options
                .iter()
                .filter(|o| o.selected)
                .flat_map(|o| o.value.as_ref().map(value_strings).unwrap_or_default())
                .collect();
        }
        if current_values.is_empty() && matches!(kind, VariableKind::Constant | VariableKind::Textbox) {
            current_values = query.into_iter().collect();
        }
        if current_values.is_empty() {
            current_values = options.first().cloned().into_iter().collect();
        }

        Variable {
            name: self.name.clone(),
            kind,
            current_values,
            allow_all: self.include_all,
            all_value: self.all_value.clone().filter(|v| !v.is_empty()),
            multi_value: self.multi,
            options,
        }
    }

    fn query_text(&self) -> Option<String> {
        match self.query.as_ref()? {
            Value::String(s) => Some(s.clone()),
            Value::Object(obj) => obj.get("query").and_then(Value::as_str).map(str::to_string),
            _ => None,
        }
    }
}

/// Flatten a string, number, or array JSON value into strings
fn value_strings(value: &Value) -> Vec<String> {
    match value {
        Value::Null => Vec::new(),
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items.iter().flat_map(value_strings).collect(),
        other => vec![other.to_string()],
    }
}

/// Parse a custom variable definition like `a, b, "c,d", Label : value`
fn parse_custom_options(query: &str) -> Vec<String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(query.as_bytes());

    let mut options = Vec::new();
    for record in reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Failed to parse custom variable options: {}", e);
                break;
            }
        };
        for field in record.iter() {
            let value = match field.split_once(" : ") {
                Some((_, value)) => value.trim(),
                None => field,
            };
            if !value.is_empty() {
                options.push(value.to_string());
            }
        }
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_envelope() {
        let dashboard = Dashboard::from_json(
            r#"{"dashboard": {"uid": "abc", "title": "Costs", "panels": []}, "meta": {"url": "/d/abc"}}"#,
        )
        .unwrap();
        assert_eq!(dashboard.uid.as_deref(), Some("abc"));
        assert_eq!(dashboard.title, "Costs");
    }

    #[test]
    fn test_parse_bare_object_with_nulls() {
        let dashboard =
            Dashboard::from_json(r#"{"title": null, "panels": null, "templating": null}"#).unwrap();
        assert!(dashboard.title.is_empty());
        assert!(dashboard.panels.is_empty());
    }

    #[test]
    fn test_non_object_rejected() {
        let err = Dashboard::from_json("[1, 2]").unwrap_err();
        assert!(matches!(err, DashboardError::InvalidStructure(_)));

        let err = Dashboard::from_json("{not json").unwrap_err();
        assert!(matches!(err, DashboardError::Parse(_)));
    }

    #[test]
    fn test_panel_ids_and_datasources() {
        let panel: Panel = serde_json::from_value(json!({
            "id": 7,
            "type": "timeseries",
            "datasource": {"type": "databricks", "uid": "dbx-1"},
            "targets": [{"refId": "A", "rawSql": "SELECT 1", "datasource": "warehouse"}]
        }))
        .unwrap();

        assert_eq!(panel.id, Some(PanelId::Number(7)));
        assert_eq!(panel.datasource.as_ref().and_then(|d| d.id()), Some("dbx-1"));
        assert_eq!(panel.targets[0].sql(), Some("SELECT 1"));
        assert_eq!(panel.targets[0].datasource.as_ref().and_then(|d| d.id()), Some("warehouse"));
    }

    #[test]
    fn test_target_sql_field_order() {
        let target: Target = serde_json::from_value(json!({
            "query": "SELECT 2",
            "rawSql": "SELECT 1"
        }))
        .unwrap();
        assert_eq!(target.sql(), Some("SELECT 1"));

        let target: Target = serde_json::from_value(json!({"expr": "rate(x[5m])"})).unwrap();
        assert_eq!(target.sql(), None);

        let target: Target = serde_json::from_value(json!({"query": {"nested": true}})).unwrap();
        assert_eq!(target.sql(), None);
    }

    #[test]
    fn test_variable_conversion() {
        let decl: VariableDecl = serde_json::from_value(json!({
            "name": "region",
            "type": "query",
            "multi": true,
            "includeAll": true,
            "allValue": null,
            "current": {"text": ["All"], "value": ["$__all"]},
            "options": [
                {"text": "All", "value": "$__all"},
                {"text": "us", "value": "us-east-1"},
                {"text": "eu", "value": "eu-west-1"}
            ]
        }))
        .unwrap();

        let variable = decl.to_variable();
        assert_eq!(variable.kind, VariableKind::Query);
        assert!(variable.multi_value);
        assert!(variable.is_all_selected());
        assert_eq!(variable.options, vec!["us-east-1", "eu-west-1"]);
        assert_eq!(variable.all_value, None);
    }

    #[test]
    fn test_custom_variable_options_from_query() {
        let decl: VariableDecl = serde_json::from_value(json!({
            "name": "tier",
            "type": "custom",
            "query": "gold, silver,\"bronze,plus\", Free tier : free",
            "current": {"value": "gold"}
        }))
        .unwrap();

        let variable = decl.to_variable();
        assert_eq!(variable.options, vec!["gold", "silver", "bronze,plus", "free"]);
        assert_eq!(variable.current_values, vec!["gold"]);
    }

    #[test]
    fn test_constant_uses_query_value() {
        let decl: VariableDecl = serde_json::from_value(json!({
            "name": "catalog",
            "type": "constant",
            "query": "main"
        }))
        .unwrap();

        assert_eq!(decl.to_variable().current_values, vec!["main"]);
    }

    #[test]
    fn test_default_time_range() {
        let dashboard =
            Dashboard::from_json(r#"{"time": {"from": "now-30d", "to": "now"}}"#).unwrap();
        assert!(dashboard.default_time_range().is_some());

        let dashboard =
            Dashboard::from_json(r#"{"time": {"from": "last month", "to": "now"}}"#).unwrap();
        assert!(dashboard.default_time_range().is_none());
    }
}
