//! Result Summarizer
//!
//! Reduces a [`QueryResult`] to one [`ColumnSummary`] per column. Numeric
//! columns get min/max/mean; everything else gets a bounded distinct count.
//! Both kinds report nulls. Statistics are accumulated in a single pass.

mod column;

pub use column::DISTINCT_SAMPLE_LIMIT;

use crate::execution::{ColumnType, QueryResult};
use column::ColumnAccumulator;
use serde::Serialize;

/// Which statistics a column received
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryKind {
    Numeric,
    Categorical,
}

/// Descriptive statistics of one result column
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnSummary {
    pub name: String,
    pub column_type: ColumnType,
    pub kind: SummaryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    pub null_count: u64,
    /// Non-null cells of a numeric column that did not parse as numbers
    #[serde(skip_serializing_if = "is_zero")]
    pub non_numeric_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distinct_count_estimate: Option<u64>,
    /// Distinct count stopped at [`DISTINCT_SAMPLE_LIMIT`]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub distinct_capped: bool,
}

/// Summarize every column of a result. Empty results give an empty summary.
pub fn summarize(result: &QueryResult) -> Vec<ColumnSummary> {
    if result.rows.is_empty() {
        return Vec::new();
    }

    result
        .columns
        .iter()
        .enumerate()
        .map(|(index, column)| {
            let mut acc = ColumnAccumulator::new(column.column_type);
            for cell in result.rows.iter().filter_map(|row| row.get(index)) {
                acc.push(cell);
            }
            acc.finish(column.name.clone())
        })
        .collect()
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}
