use crate::process::ImputeError;
use crate::progress::{log, LogLevel};
use crate::table::{MeasurementTable, Value};
use ndarray::Array2;

/// Count, mean and population standard deviation of a set of values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Moments {
    pub count: usize,
    pub mean: f64,
    pub sd: f64,
}

/// Computes mean and population standard deviation (divide by n).
/// Returns None when there are no values.
pub fn population_moments<I>(values: I) -> Option<Moments>
where
    I: IntoIterator<Item = f64>,
{
    let values: Vec<f64> = values.into_iter().collect();
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    // Two passes; sqrt(E[x^2] - mean^2) can go negative through rounding.
    let variance = values.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
    Some(Moments {
        count: values.len(),
        mean,
        sd: variance.sqrt(),
    })
}

// Rounding in the mean leaves a constant set of values with an sd of a few
// ulps of the mean rather than exactly zero.
const SPREAD_TOLERANCE: f64 = 16.0 * f64::EPSILON;

/// True when `sd` is indistinguishable from zero relative to `mean`.
pub fn negligible_spread(sd: f64, mean: f64) -> bool {
    sd <= SPREAD_TOLERANCE * mean.abs()
}

impl Moments {
    pub fn is_constant(&self) -> bool {
        negligible_spread(self.sd, self.mean)
    }
}

/// Moments of one row over its own known cells.
pub fn row_moments(table: &MeasurementTable, row: usize) -> Option<Moments> {
    population_moments(table.row_known(row))
}

/// Row-to-row Pearson correlations for one replicate group.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationMatrix {
    coefficients: Array2<f64>,
    undefined_pairs: usize,
}

impl CorrelationMatrix {
    /// Wraps a precomputed square matrix.
    pub fn from_array(coefficients: Array2<f64>) -> Result<Self, ImputeError> {
        let (rows, cols) = coefficients.dim();
        if rows != cols {
            return Err(ImputeError::ShapeMismatch {
                expected: rows,
                found: cols,
            });
        }
        Ok(CorrelationMatrix {
            coefficients,
            undefined_pairs: 0,
        })
    }

    pub fn dim(&self) -> usize {
        self.coefficients.nrows()
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.coefficients[[i, j]]
    }

    /// Number of unordered pairs (i <= j) whose coefficient was undefined
    /// and stored as 0.0.
    pub fn undefined_pairs(&self) -> usize {
        self.undefined_pairs
    }

    pub fn as_array(&self) -> &Array2<f64> {
        &self.coefficients
    }
}

/// Pearson correlation between two rows.
///
/// The covariance sums over columns where both rows are known, while each
/// row's mean and standard deviation come from all of its own known cells.
/// The sum is normalized once by `shared * sd_a * sd_b`.
///
/// Returns None when the coefficient is undefined: either row has no known
/// cells or zero spread, or the rows share no known column.
fn pearson_over_shared(
    row_a: &[Value],
    row_b: &[Value],
    a: Option<Moments>,
    b: Option<Moments>,
) -> Option<f64> {
    let (a, b) = (a?, b?);
    if a.is_constant() || b.is_constant() {
        return None;
    }

    let mut covariance = 0.0;
    let mut shared = 0usize;
    for (x, y) in row_a.iter().zip(row_b) {
        if let (Value::Known(x), Value::Known(y)) = (x, y) {
            covariance += (x - a.mean) * (y - b.mean);
            shared += 1;
        }
    }
    if shared == 0 {
        return None;
    }

    let r = covariance / (shared as f64 * a.sd * b.sd);
    if r.is_finite() {
        Some(r)
    } else {
        None
    }
}

/// Builds the N x N correlation matrix over the rows of `table`.
///
/// Each unordered pair is computed once and mirrored, so the matrix is
/// exactly symmetric. Undefined coefficients are stored as 0.0, which gives
/// that pair no weight during imputation.
pub fn compute_correlation_matrix(table: &MeasurementTable) -> CorrelationMatrix {
    let n = table.n_rows();
    let moments: Vec<Option<Moments>> = (0..n).map(|i| row_moments(table, i)).collect();
    let rows = table.rows();

    let mut coefficients = Array2::<f64>::zeros((n, n));
    let mut undefined_pairs = 0usize;

    for i in 0..n {
        for j in i..n {
            let r = match pearson_over_shared(&rows[i], &rows[j], moments[i], moments[j]) {
                Some(r) => r,
                None => {
                    undefined_pairs += 1;
                    0.0
                }
            };
            coefficients[[i, j]] = r;
            coefficients[[j, i]] = r;
        }
    }

    if undefined_pairs > 0 {
        log(
            LogLevel::Debug,
            &format!(
                "{} of {} row pairs have an undefined correlation; stored as 0.0",
                undefined_pairs,
                n * (n + 1) / 2
            ),
        );
    }

    CorrelationMatrix {
        coefficients,
        undefined_pairs,
    }
}

/// Per-column statistics over known values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnSummary {
    pub count: usize,
    pub mean: Option<f64>,
    pub sd: Option<f64>,
}

impl ColumnSummary {
    pub fn is_constant(&self) -> bool {
        match (self.sd, self.mean) {
            (Some(sd), Some(mean)) => negligible_spread(sd, mean),
            _ => false,
        }
    }
}

pub fn column_summaries(table: &MeasurementTable) -> Vec<ColumnSummary> {
    (0..table.n_columns())
        .map(|column| match population_moments(table.column_known(column)) {
            Some(m) => ColumnSummary {
                count: m.count,
                mean: Some(m.mean),
                sd: Some(m.sd),
            },
            None => ColumnSummary {
                count: 0,
                mean: None,
                sd: None,
            },
        })
        .collect()
}

/// Column-wise z-scoring fitted on one table and applied to others with the
/// same columns.
#[derive(Debug, Clone, PartialEq)]
pub struct ZScoreScaler {
    columns: Vec<String>,
    summaries: Vec<ColumnSummary>,
}

impl ZScoreScaler {
    pub fn fit(table: &MeasurementTable) -> Self {
        let summaries = column_summaries(table);
        for (name, summary) in table.columns().iter().zip(&summaries) {
            if summary.mean.is_none() {
                log(
                    LogLevel::Warning,
                    &format!("Column '{}' has no known values; it will be left unscaled", name),
                );
            } else if summary.is_constant() {
                log(
                    LogLevel::Warning,
                    &format!("Column '{}' has zero spread; its values will be scaled to 0.0", name),
                );
            }
        }
        ZScoreScaler {
            columns: table.columns().to_vec(),
            summaries,
        }
    }

    pub fn summaries(&self) -> &[ColumnSummary] {
        &self.summaries
    }

    /// Maps every known value to `(x - mean) / sd`. Missing cells stay
    /// missing. Known values of a zero-spread column become 0.0; columns
    /// the scaler has no mean for are copied through.
    pub fn transform(&self, table: &MeasurementTable) -> Result<MeasurementTable, ImputeError> {
        if table.n_columns() != self.columns.len() {
            return Err(ImputeError::ShapeMismatch {
                expected: self.columns.len(),
                found: table.n_columns(),
            });
        }
        if let Some((expected, found)) = self
            .columns
            .iter()
            .zip(table.columns())
            .find(|(expected, found)| expected != found)
        {
            return Err(ImputeError::MalformedInput {
                path: None,
                row: None,
                reason: format!("column '{}' does not match fitted column '{}'", found, expected),
            });
        }

        let rows: Vec<Vec<Value>> = table
            .rows()
            .iter()
            .map(|row| {
                row.iter()
                    .zip(&self.summaries)
                    .map(|(value, summary)| match (*value, summary.mean) {
                        (Value::Known(x), Some(mean)) => match summary.sd {
                            Some(sd) if !summary.is_constant() => Value::Known((x - mean) / sd),
                            _ => Value::Known(0.0),
                        },
                        (other, _) => other,
                    })
                    .collect()
            })
            .collect();

        MeasurementTable::new(table.columns().to_vec(), rows)
    }
}
