//! SQL engine seam and result types

use crate::execution::error::EngineError;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;

/// An external SQL engine
#[async_trait]
pub trait SqlEngine: Send + Sync {
    /// Short engine name for logs
    fn name(&self) -> &str;

    /// Run one statement, giving up after `timeout`
    async fn run_query(&self, sql: &str, timeout: Duration) -> Result<RowSet, EngineError>;

    /// Cheap reachability probe made once before a run dispatches queries
    async fn health_check(&self) -> Result<(), EngineError>;
}

/// Declared or inferred column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Float,
    Boolean,
    Text,
    Timestamp,
    Unknown,
}

impl ColumnType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Float)
    }

    /// Map an engine type name (`BIGINT`, `double`, `VARCHAR(32)`, ...)
    pub fn from_type_name(name: &str) -> Self {
        let upper = name.trim().to_ascii_uppercase();
        let base = upper.split('(').next().unwrap_or("").trim();
        match base {
            "INT" | "INTEGER" | "BIGINT" | "SMALLINT" | "TINYINT" | "LONG" | "SHORT" | "BYTE" => {
                ColumnType::Integer
            }
            "REAL" | "FLOAT" | "DOUBLE" | "DECIMAL" | "NUMERIC" => ColumnType::Float,
            "BOOLEAN" | "BOOL" => ColumnType::Boolean,
            "TEXT" | "STRING" | "VARCHAR" | "CHAR" | "CLOB" => ColumnType::Text,
            "TIMESTAMP" | "TIMESTAMP_NTZ" | "DATE" | "DATETIME" => ColumnType::Timestamp,
            _ => ColumnType::Unknown,
        }
    }
}

/// One result column
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// A single cell
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Numeric view of the cell; numeric text is accepted
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Int(n) => Some(*n as f64),
            CellValue::Float(f) if f.is_finite() => Some(*f),
            CellValue::Text(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            _ => None,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            CellValue::Null => Value::Null,
            CellValue::Bool(b) => Value::Bool(*b),
            CellValue::Int(n) => Value::from(*n),
            CellValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            CellValue::Text(s) => Value::String(s.clone()),
        }
    }
}

impl std::fmt::Display for CellValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellValue::Null => write!(f, "NULL"),
            CellValue::Bool(b) => write!(f, "{}", b),
            CellValue::Int(n) => write!(f, "{}", n),
            CellValue::Float(x) => write!(f, "{}", x),
            CellValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Rows as returned by an engine
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RowSet {
    pub columns: Vec<ColumnSpec>,
    pub rows: Vec<Vec<CellValue>>,
}

/// A query ready to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedQuery {
    pub panel_id: String,
    pub ref_id: String,
    pub sql: String,
}

impl ResolvedQuery {
    pub fn new(panel_id: impl Into<String>, ref_id: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            panel_id: panel_id.into(),
            ref_id: ref_id.into(),
            sql: sql.into(),
        }
    }
}

/// Tabular result of one panel query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub panel_id: String,
    pub ref_id: String,
    pub columns: Vec<ColumnSpec>,
    pub rows: Vec<Vec<CellValue>>,
}

impl QueryResult {
    pub fn new(query: &ResolvedQuery, rows: RowSet) -> Self {
        Self {
            panel_id: query.panel_id.clone(),
            ref_id: query.ref_id.clone(),
            columns: rows.columns,
            rows: rows.rows,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Rows as JSON objects keyed by column name
    pub fn to_records(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row.iter())
                    .map(|(column, cell)| (column.name.clone(), cell.to_json()))
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names() {
        assert_eq!(ColumnType::from_type_name("BIGINT"), ColumnType::Integer);
        assert_eq!(ColumnType::from_type_name("decimal(10,2)"), ColumnType::Float);
        assert_eq!(ColumnType::from_type_name("VARCHAR(32)"), ColumnType::Text);
        assert_eq!(ColumnType::from_type_name("timestamp"), ColumnType::Timestamp);
        assert_eq!(ColumnType::from_type_name("ARRAY<INT>"), ColumnType::Unknown);
    }

    #[test]
    fn test_cell_as_f64() {
        assert_eq!(CellValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(CellValue::Text(" 2.5 ".into()).as_f64(), Some(2.5));
        assert_eq!(CellValue::Text("abc".into()).as_f64(), None);
        assert_eq!(CellValue::Float(f64::NAN).as_f64(), None);
        assert_eq!(CellValue::Null.as_f64(), None);
    }

    #[test]
    fn test_to_records() {
        let query = ResolvedQuery::new("1", "A", "SELECT env, cost FROM t");
        let result = QueryResult::new(
            &query,
            RowSet {
                columns: vec![
                    ColumnSpec::new("env", ColumnType::Text),
                    ColumnSpec::new("cost", ColumnType::Float),
                ],
                rows: vec![
                    vec![CellValue::Text("prod".into()), CellValue::Float(12.5)],
                    vec![CellValue::Text("dev".into()), CellValue::Null],
                ],
            },
        );

        let records = result.to_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["env"], "prod");
        assert_eq!(records[0]["cost"], 12.5);
        assert!(records[1]["cost"].is_null());
    }
}
