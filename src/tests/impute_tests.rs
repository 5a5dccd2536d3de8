#[cfg(test)]
mod tests {
    use crate::impute::{impute_replicate, mean_fill};
    use crate::process::ImputeError;
    use crate::stats::{compute_correlation_matrix, CorrelationMatrix};
    use crate::table::{MeasurementTable, Value};
    use ndarray::Array2;

    const NA: Option<f64> = None;

    /// Helper function to build a table from optional cells
    fn make_table(columns: &[&str], rows: Vec<Vec<Option<f64>>>) -> MeasurementTable {
        MeasurementTable::new(
            columns.iter().map(|c| c.to_string()).collect(),
            rows.into_iter()
                .map(|r| r.into_iter().map(Value::from).collect())
                .collect(),
        )
        .expect("valid test table")
    }

    fn impute(table: &MeasurementTable) -> crate::table::ImputedTable {
        let correlations = compute_correlation_matrix(table);
        impute_replicate(table, &correlations).expect("imputation succeeds")
    }

    #[test]
    fn test_single_known_row_falls_back_to_baseline() {
        // Row 0 has a single known value, so its spread is zero and every
        // correlation involving it is undefined. The donors for (0, 1) exist
        // but carry zero weight.
        let table = make_table(
            &["a", "b"],
            vec![vec![Some(1.0), NA], vec![Some(2.0), Some(4.0)], vec![Some(3.0), Some(5.0)]],
        );
        let correlations = compute_correlation_matrix(&table);

        assert_eq!(correlations.get(0, 1), 0.0);
        assert_eq!(correlations.get(0, 2), 0.0);
        assert!((correlations.get(1, 2) - 1.0).abs() < 1e-12);
        assert_eq!(correlations.undefined_pairs(), 3);

        let imputed = impute_replicate(&table, &correlations).unwrap();
        assert_eq!(imputed.value(0, 1), 1.0);
        assert!(imputed.is_imputed(0, 1));
        assert_eq!(imputed.report.imputed_cells, 1);
        assert_eq!(imputed.report.zero_weight, 1);
        assert_eq!(imputed.report.no_donor, 0);
    }

    #[test]
    fn test_weighted_correction_matches_hand_computation() {
        // Row 0: mean 1.5, sd 0.5
        // Row 1: mean 4,   sd sqrt(8/3)
        // Row 2: mean 2,   sd sqrt(2/3)
        // corr(0,1) = 1 / sqrt(8/3) = sqrt(3/8)
        // corr(0,2) = -1 / sqrt(2/3) = -sqrt(3/2) = -2 * sqrt(3/8)
        // (0,2) = 1.5 + [(6 - 4) * sqrt(3/8) + (2 - 2) * corr(0,2)] / (3 * sqrt(3/8)) = 1.5 + 2/3
        let table = make_table(
            &["a", "b", "c"],
            vec![
                vec![Some(1.0), Some(2.0), NA],
                vec![Some(2.0), Some(4.0), Some(6.0)],
                vec![Some(3.0), Some(1.0), Some(2.0)],
            ],
        );
        let correlations = compute_correlation_matrix(&table);
        let r01 = (3.0f64 / 8.0).sqrt();
        assert!((correlations.get(0, 1) - r01).abs() < 1e-12);
        assert!((correlations.get(0, 2) + 1.5f64.sqrt()).abs() < 1e-12);

        let imputed = impute_replicate(&table, &correlations).unwrap();
        assert!((imputed.value(0, 2) - 13.0 / 6.0).abs() < 1e-12);
        assert_eq!(imputed.report.imputed_cells, 1);
        assert_eq!(imputed.report.zero_weight, 0);
    }

    #[test]
    fn test_complete_table_is_returned_unchanged() {
        let table = make_table(
            &["a", "b", "c"],
            vec![
                vec![Some(0.5), Some(-1.25), Some(3.0)],
                vec![Some(2.0), Some(4.0), Some(6.0)],
            ],
        );
        let imputed = impute(&table);

        assert_eq!(imputed.table, table);
        assert_eq!(imputed.mask.count(), 0);
        assert_eq!(imputed.report.imputed_cells, 0);
    }

    #[test]
    fn test_column_missing_everywhere_uses_baselines() {
        let table = make_table(
            &["a", "b", "c"],
            vec![
                vec![Some(1.0), Some(3.0), NA],
                vec![Some(2.0), Some(6.0), NA],
                vec![Some(5.0), Some(1.0), NA],
            ],
        );
        let imputed = impute(&table);

        assert_eq!(imputed.value(0, 2), 2.0);
        assert_eq!(imputed.value(1, 2), 4.0);
        assert_eq!(imputed.value(2, 2), 3.0);
        assert_eq!(imputed.report.no_donor, 3);
    }

    #[test]
    fn test_row_without_known_values_fills_with_zero() {
        let table = make_table(
            &["a", "b"],
            vec![
                vec![NA, NA],
                vec![Some(2.0), Some(4.0)],
                vec![Some(3.0), Some(7.0)],
            ],
        );
        let imputed = impute(&table);

        assert_eq!(imputed.report.undefined_baselines, 1);
        assert_eq!(imputed.value(0, 0), 0.0);
        assert_eq!(imputed.value(0, 1), 0.0);
        assert!(imputed.is_imputed(0, 0) && imputed.is_imputed(0, 1));
        assert_eq!(imputed.value(1, 0), 2.0);
    }

    #[test]
    fn test_single_donor_is_used() {
        // Only row 1 knows column c; rows 0 and 2 borrow from it.
        let table = make_table(
            &["a", "b", "c"],
            vec![
                vec![Some(1.0), Some(2.0), NA],
                vec![Some(2.0), Some(4.0), Some(9.0)],
                vec![Some(4.0), Some(2.0), NA],
            ],
        );
        let correlations = compute_correlation_matrix(&table);
        let imputed = impute_replicate(&table, &correlations).unwrap();

        // Row 1 baseline is 5; correction = (9 - 5) * r / |r| = 4 * sign(r)
        let r01 = correlations.get(0, 1);
        let r21 = correlations.get(2, 1);
        assert!(r01 > 0.0);
        assert!(r21 < 0.0);
        assert!((imputed.value(0, 2) - (1.5 + 4.0)).abs() < 1e-12);
        assert!((imputed.value(2, 2) - (3.0 - 4.0)).abs() < 1e-12);
    }

    #[test]
    fn test_inputs_are_not_mutated_and_output_is_deterministic() {
        let table = make_table(
            &["a", "b", "c", "d"],
            vec![
                vec![Some(0.3), NA, Some(1.7), Some(-0.2)],
                vec![Some(1.1), Some(0.4), NA, Some(0.9)],
                vec![NA, Some(-1.3), Some(0.8), Some(2.2)],
                vec![Some(0.6), Some(0.1), Some(0.2), NA],
            ],
        );
        let before = table.clone();
        let correlations = compute_correlation_matrix(&table);
        let correlations_before = correlations.clone();

        let first = impute_replicate(&table, &correlations).unwrap();
        let second = impute_replicate(&table, &correlations).unwrap();

        assert_eq!(table, before);
        assert_eq!(correlations, correlations_before);
        assert_eq!(first, second);
        for (a, b) in first.table.rows().iter().flatten().zip(second.table.rows().iter().flatten()) {
            assert_eq!(a.known().unwrap().to_bits(), b.known().unwrap().to_bits());
        }
        assert_eq!(first.table.missing_count(), 0);
        assert_eq!(first.mask.count(), before.missing_count());
        assert_eq!(first.table.columns(), before.columns());
    }

    #[test]
    fn test_constant_row_falls_back_to_baseline() {
        let table = make_table(
            &["a", "b", "c", "d"],
            vec![
                vec![Some(0.1), Some(0.1), Some(0.1), NA],
                vec![Some(1.0), Some(2.0), Some(3.0), Some(10.0)],
                vec![Some(2.0), Some(1.0), Some(5.0), Some(4.0)],
            ],
        );
        let imputed = impute(&table);

        assert!((imputed.value(0, 3) - 0.1).abs() < 1e-12);
        assert_eq!(imputed.report.zero_weight, 1);
        assert_eq!(imputed.report.undefined_correlations, 3);
    }

    #[test]
    fn test_matrix_size_mismatch_is_rejected() {
        let table = make_table(
            &["a"],
            vec![vec![Some(1.0)], vec![NA], vec![Some(3.0)]],
        );
        let matrix = CorrelationMatrix::from_array(Array2::zeros((2, 2))).unwrap();

        match impute_replicate(&table, &matrix) {
            Err(ImputeError::ShapeMismatch { expected, found }) => {
                assert_eq!(expected, 3);
                assert_eq!(found, 2);
            }
            other => panic!("expected ShapeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_mean_fill_uses_column_means() {
        let table = make_table(
            &["a", "b", "c"],
            vec![
                vec![Some(1.0), NA, NA],
                vec![Some(3.0), Some(4.0), NA],
                vec![NA, Some(6.0), NA],
            ],
        );
        let filled = mean_fill(&table).unwrap();

        assert_eq!(filled.value(0, 1), 5.0);
        assert_eq!(filled.value(2, 0), 2.0);
        // Column with nothing known
        assert_eq!(filled.value(1, 2), 0.0);
        assert!(filled.is_imputed(0, 1));
        assert!(!filled.is_imputed(0, 0));
        assert_eq!(filled.report.imputed_cells, 5);
        assert_eq!(filled.table.missing_count(), 0);
    }
}
