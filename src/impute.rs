use crate::process::ImputeError;
use crate::progress::{log, LogLevel};
use crate::stats::{column_summaries, row_moments, CorrelationMatrix};
use crate::table::{ImputationMask, ImputationReport, ImputedTable, MeasurementTable, Value};

/// Per-row anchors for imputation: each row's mean over its own known cells.
/// A row with nothing known gets 0.0, which is counted in the report.
fn row_baselines(table: &MeasurementTable, report: &mut ImputationReport) -> Vec<f64> {
    (0..table.n_rows())
        .map(|i| match row_moments(table, i) {
            Some(m) => m.mean,
            None => {
                report.undefined_baselines += 1;
                0.0
            }
        })
        .collect()
}

/// Fills every missing cell with its row baseline plus a correlation-weighted
/// correction from the other rows known in that column:
///
/// ```text
/// value(i,k) = baseline_i + Σ_j (value(j,k) - baseline_j) * corr(i,j) / Σ_j |corr(i,j)|
/// ```
///
/// Falls back to `baseline_i` when no other row is known in column k or when
/// all donor weights are zero. Inputs are left untouched.
pub fn impute_replicate(
    table: &MeasurementTable,
    correlations: &CorrelationMatrix,
) -> Result<ImputedTable, ImputeError> {
    if correlations.dim() != table.n_rows() {
        return Err(ImputeError::ShapeMismatch {
            expected: table.n_rows(),
            found: correlations.dim(),
        });
    }

    let n = table.n_rows();
    let m = table.n_columns();
    let mut report = ImputationReport {
        undefined_correlations: correlations.undefined_pairs(),
        ..Default::default()
    };
    let baselines = row_baselines(table, &mut report);
    let mut mask = ImputationMask::empty(n, m);
    let mut rows: Vec<Vec<Value>> = table.rows().to_vec();

    for i in 0..n {
        for k in 0..m {
            if !table.value(i, k).is_missing() {
                continue;
            }

            let mut correction = 0.0;
            let mut weight = 0.0;
            let mut donors = 0usize;
            for j in (0..n).filter(|&j| j != i) {
                if let Value::Known(x) = table.value(j, k) {
                    let r = correlations.get(i, j);
                    correction += (x - baselines[j]) * r;
                    weight += r.abs();
                    donors += 1;
                }
            }

            let estimate = if donors == 0 {
                report.no_donor += 1;
                baselines[i]
            } else if weight == 0.0 {
                report.zero_weight += 1;
                baselines[i]
            } else {
                baselines[i] + correction / weight
            };

            rows[i][k] = Value::Known(estimate);
            mask.mark(i, k);
            report.imputed_cells += 1;
        }
    }

    if report.undefined_baselines > 0 {
        log(
            LogLevel::Warning,
            &format!(
                "{} row(s) have no known values; their cells were filled with 0.0",
                report.undefined_baselines
            ),
        );
    }
    log(
        LogLevel::Debug,
        &format!(
            "Imputed {} cells ({} without donors, {} with zero weight)",
            report.imputed_cells, report.no_donor, report.zero_weight
        ),
    );

    Ok(ImputedTable {
        table: MeasurementTable::new(table.columns().to_vec(), rows)?,
        mask,
        report,
    })
}

/// Replaces every missing cell with the mean of the known values in its
/// column. A column with no known values is filled with 0.0.
pub fn mean_fill(table: &MeasurementTable) -> Result<ImputedTable, ImputeError> {
    let summaries = column_summaries(table);
    let mut mask = ImputationMask::empty(table.n_rows(), table.n_columns());
    let mut report = ImputationReport::default();

    for (name, summary) in table.columns().iter().zip(&summaries) {
        if summary.mean.is_none() {
            log(
                LogLevel::Warning,
                &format!("Column '{}' has no known values; filling with 0.0", name),
            );
        }
    }

    let rows: Vec<Vec<Value>> = table
        .rows()
        .iter()
        .enumerate()
        .map(|(i, row)| {
            row.iter()
                .enumerate()
                .map(|(k, value)| match value {
                    Value::Known(x) => Value::Known(*x),
                    Value::Missing => {
                        mask.mark(i, k);
                        report.imputed_cells += 1;
                        Value::Known(summaries[k].mean.unwrap_or(0.0))
                    }
                })
                .collect()
        })
        .collect();

    Ok(ImputedTable {
        table: MeasurementTable::new(table.columns().to_vec(), rows)?,
        mask,
        report,
    })
}
