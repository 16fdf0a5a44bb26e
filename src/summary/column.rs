//! Per-column accumulators

use super::{ColumnSummary, SummaryKind};
use crate::execution::{CellValue, ColumnType};
use std::collections::HashSet;

/// Distinct values tracked per categorical column before the count is
/// reported as a lower-bound estimate
pub const DISTINCT_SAMPLE_LIMIT: usize = 1000;

/// Streaming min/max/mean over numeric cells
#[derive(Debug, Clone, Default)]
pub(crate) struct NumericAccumulator {
    count: u64,
    nulls: u64,
    invalid: u64,
    min: Option<f64>,
    max: Option<f64>,
    mean: f64,
}

impl NumericAccumulator {
    pub fn push(&mut self, cell: &CellValue) {
        if cell.is_null() {
            self.nulls += 1;
            return;
        }
        let Some(value) = cell.as_f64() else {
            self.invalid += 1;
            return;
        };

        self.count += 1;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
        // Incremental mean avoids summing into overflow on large columns
        self.mean += (value - self.mean) / self.count as f64;
    }

    pub fn nulls(&self) -> u64 {
        self.nulls
    }

    /// Non-null cells that did not parse as a number
    pub fn invalid(&self) -> u64 {
        self.invalid
    }

    pub fn min(&self) -> Option<f64> {
        self.min
    }

    pub fn max(&self) -> Option<f64> {
        self.max
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }
}

/// Null count and bounded distinct count over non-numeric cells
#[derive(Debug, Clone, Default)]
pub(crate) struct CategoricalAccumulator {
    nulls: u64,
    seen: HashSet<String>,
    saturated: bool,
}

impl CategoricalAccumulator {
    pub fn push(&mut self, cell: &CellValue) {
        if cell.is_null() {
            self.nulls += 1;
            return;
        }
        if self.saturated {
            return;
        }

        let key = cell.to_string();
        if !self.seen.contains(&key) {
            if self.seen.len() >= DISTINCT_SAMPLE_LIMIT {
                self.saturated = true;
                return;
            }
            self.seen.insert(key);
        }
    }

    pub fn nulls(&self) -> u64 {
        self.nulls
    }

    pub fn distinct(&self) -> u64 {
        self.seen.len() as u64
    }

    /// True when more distinct values exist than were counted
    pub fn saturated(&self) -> bool {
        self.saturated
    }
}

/// Type inference for columns the engine reported as `Unknown`
#[derive(Debug, Clone)]
struct TypeInference {
    any_value: bool,
    all_integer: bool,
    /// First boolean or non-numeric text cell settles the column
    settled: Option<ColumnType>,
}

impl Default for TypeInference {
    fn default() -> Self {
        Self {
            any_value: false,
            all_integer: true,
            settled: None,
        }
    }
}

impl TypeInference {
    fn push(&mut self, cell: &CellValue) {
        if self.settled.is_some() {
            return;
        }
        match cell {
            CellValue::Null => {}
            CellValue::Int(_) => self.any_value = true,
            CellValue::Float(_) => {
                self.any_value = true;
                self.all_integer = false;
            }
            CellValue::Text(s) if s.trim().parse::<f64>().is_ok() => {
                self.any_value = true;
                if s.trim().parse::<i64>().is_err() {
                    self.all_integer = false;
                }
            }
            CellValue::Bool(_) => self.settled = Some(ColumnType::Boolean),
            CellValue::Text(_) => self.settled = Some(ColumnType::Text),
        }
    }

    fn column_type(&self) -> ColumnType {
        match (self.settled, self.any_value, self.all_integer) {
            (Some(settled), _, _) => settled,
            (None, false, _) => ColumnType::Unknown,
            (None, true, true) => ColumnType::Integer,
            (None, true, false) => ColumnType::Float,
        }
    }
}

/// One pass over a column: numeric and categorical statistics are gathered
/// side by side until the column's type is known at the end
#[derive(Debug, Clone)]
pub(crate) struct ColumnAccumulator {
    declared: ColumnType,
    inference: TypeInference,
    numeric: NumericAccumulator,
    categorical: Option<CategoricalAccumulator>,
}

impl ColumnAccumulator {
    pub fn new(declared: ColumnType) -> Self {
        Self {
            declared,
            inference: TypeInference::default(),
            numeric: NumericAccumulator::default(),
            categorical: (!declared.is_numeric()).then(CategoricalAccumulator::default),
        }
    }

    pub fn push(&mut self, cell: &CellValue) {
        if self.declared == ColumnType::Unknown {
            self.inference.push(cell);
        }
        self.numeric.push(cell);
        if let Some(categorical) = self.categorical.as_mut() {
            categorical.push(cell);
        }
    }

    /// Declared type, or the inferred one when the engine did not say
    pub fn column_type(&self) -> ColumnType {
        if self.declared == ColumnType::Unknown {
            self.inference.column_type()
        } else {
            self.declared
        }
    }

    pub fn finish(self, name: String) -> ColumnSummary {
        let column_type = self.column_type();

        match self.categorical {
            Some(categorical) if !column_type.is_numeric() => ColumnSummary {
                name,
                column_type,
                kind: SummaryKind::Categorical,
                min: None,
                max: None,
                mean: None,
                null_count: categorical.nulls(),
                non_numeric_count: 0,
                distinct_count_estimate: Some(categorical.distinct()),
                distinct_capped: categorical.saturated(),
            },
            _ => ColumnSummary {
                name,
                column_type,
                kind: SummaryKind::Numeric,
                min: self.numeric.min(),
                max: self.numeric.max(),
                mean: self.numeric.mean(),
                null_count: self.numeric.nulls(),
                non_numeric_count: self.numeric.invalid(),
                distinct_count_estimate: None,
                distinct_capped: false,
            },
        }
    }
}
