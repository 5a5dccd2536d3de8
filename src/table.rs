use crate::process::ImputeError;

/// A single trait measurement. Text sentinels are resolved by the loader,
/// so this is the only place "missing" exists in memory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Known(f64),
    Missing,
}

impl Value {
    pub fn known(self) -> Option<f64> {
        match self {
            Value::Known(x) => Some(x),
            Value::Missing => None,
        }
    }

    pub fn is_missing(self) -> bool {
        matches!(self, Value::Missing)
    }
}

impl From<Option<f64>> for Value {
    fn from(v: Option<f64>) -> Self {
        match v {
            Some(x) => Value::Known(x),
            None => Value::Missing,
        }
    }
}

/// Per-cell measurements for one replicate group (or one strain).
///
/// Column order is significant: it is preserved from the input header through
/// every transformation and back out to the written file.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementTable {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl MeasurementTable {
    /// Builds a table, checking that every row matches the header width and
    /// that column names are unique.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self, ImputeError> {
        for (i, name) in columns.iter().enumerate() {
            if columns[..i].contains(name) {
                return Err(ImputeError::MalformedInput {
                    path: None,
                    row: None,
                    reason: format!("duplicate column name '{}' in header", name),
                });
            }
        }
        for (row_idx, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(ImputeError::MalformedInput {
                    path: None,
                    row: Some(row_idx),
                    reason: format!(
                        "expected {} cells to match the header, found {}",
                        columns.len(),
                        row.len()
                    ),
                });
            }
        }
        Ok(MeasurementTable { columns, rows })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn value(&self, row: usize, column: usize) -> Value {
        self.rows[row][column]
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Looks a cell up by trait name.
    pub fn get(&self, row: usize, name: &str) -> Option<Value> {
        let column = self.column_index(name)?;
        self.rows.get(row).map(|r| r[column])
    }

    pub fn missing_count(&self) -> usize {
        self.rows
            .iter()
            .map(|r| r.iter().filter(|v| v.is_missing()).count())
            .sum()
    }

    /// Known values of one row, in column order.
    pub fn row_known(&self, row: usize) -> impl Iterator<Item = f64> + '_ {
        self.rows[row].iter().filter_map(|v| v.known())
    }

    /// Known values of one column, in row order.
    pub fn column_known(&self, column: usize) -> impl Iterator<Item = f64> + '_ {
        self.rows.iter().filter_map(move |r| r[column].known())
    }
}

/// A measurement table with a leading text label per row, e.g. the
/// strain-mean table (`name trait1 trait2 ...`, one row per strain).
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledTable {
    pub label_header: String,
    pub labels: Vec<String>,
    pub table: MeasurementTable,
}

impl LabeledTable {
    pub fn new(
        label_header: String,
        labels: Vec<String>,
        table: MeasurementTable,
    ) -> Result<Self, ImputeError> {
        if labels.len() != table.n_rows() {
            return Err(ImputeError::ShapeMismatch {
                expected: table.n_rows(),
                found: labels.len(),
            });
        }
        Ok(LabeledTable {
            label_header,
            labels,
            table,
        })
    }
}

/// Which cells of a table were synthesized rather than measured.
#[derive(Debug, Clone, PartialEq)]
pub struct ImputationMask {
    flags: Vec<Vec<bool>>,
}

impl ImputationMask {
    pub fn empty(n_rows: usize, n_columns: usize) -> Self {
        ImputationMask {
            flags: vec![vec![false; n_columns]; n_rows],
        }
    }

    pub fn mark(&mut self, row: usize, column: usize) {
        self.flags[row][column] = true;
    }

    pub fn is_imputed(&self, row: usize, column: usize) -> bool {
        self.flags[row][column]
    }

    /// Flags every cell that is flagged in `other` as well. Masks of
    /// different shapes are combined over their common cells.
    pub fn union(&mut self, other: &ImputationMask) {
        for (row, other_row) in self.flags.iter_mut().zip(&other.flags) {
            for (flag, other_flag) in row.iter_mut().zip(other_row) {
                *flag |= *other_flag;
            }
        }
    }

    pub fn count(&self) -> usize {
        self.flags
            .iter()
            .map(|r| r.iter().filter(|&&f| f).count())
            .sum()
    }
}

/// Counters for the deterministic fallbacks taken while imputing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImputationReport {
    pub imputed_cells: usize,
    /// Row pairs whose correlation was undefined and stored as 0.0.
    pub undefined_correlations: usize,
    /// Rows with no known value at all; their baseline is 0.0.
    pub undefined_baselines: usize,
    /// Cells with no other row known in that column.
    pub no_donor: usize,
    /// Cells whose donors all had zero correlation weight.
    pub zero_weight: usize,
}

/// A fully populated table plus the record of which cells were filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct ImputedTable {
    pub table: MeasurementTable,
    pub mask: ImputationMask,
    pub report: ImputationReport,
}

impl ImputedTable {
    /// Numeric value of a cell. Every cell of an imputed table is known;
    /// a stray `Missing` reads as NaN.
    pub fn value(&self, row: usize, column: usize) -> f64 {
        self.table.value(row, column).known().unwrap_or(f64::NAN)
    }

    pub fn is_imputed(&self, row: usize, column: usize) -> bool {
        self.mask.is_imputed(row, column)
    }
}
