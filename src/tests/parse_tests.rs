#[cfg(test)]
mod tests {
    use crate::parse::*;
    use crate::process::{ImputeError, TableFormat};
    use crate::table::Value;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs::{self, File};
    use std::io::Write;
    use std::path::Path;
    use tempfile::tempdir;

    fn parse_str(text: &str, format: &TableFormat) -> Result<ParsedTable, ImputeError> {
        parse_table(text.as_bytes(), format, false, None)
    }

    #[test]
    fn test_parse_cell_tokens() {
        let format = TableFormat::default();
        assert_eq!(parse_cell("NA", &format).unwrap(), (Value::Missing, false));
        assert_eq!(parse_cell("-2.5", &format).unwrap(), (Value::Known(-2.5), false));
        assert_eq!(parse_cell("1e-3", &format).unwrap(), (Value::Known(0.001), false));
        assert!(parse_cell("abc", &format).is_err());
        assert!(parse_cell("", &format).is_err());

        let err = parse_cell("inf", &format).unwrap_err();
        assert!(err.contains("non-finite"));
        assert!(parse_cell("NaN", &format).is_err());

        let lenient = TableFormat {
            non_finite_as_missing: true,
            ..TableFormat::default()
        };
        assert_eq!(parse_cell("inf", &lenient).unwrap(), (Value::Missing, false));
        assert_eq!(parse_cell("-inf", &lenient).unwrap(), (Value::Missing, false));
    }

    #[test]
    fn test_parse_cell_imputed_prefix() {
        let format = TableFormat {
            imputed_prefix: Some("~".to_string()),
            ..TableFormat::default()
        };
        assert_eq!(parse_cell("~1.5", &format).unwrap(), (Value::Known(1.5), true));
        assert_eq!(parse_cell("1.5", &format).unwrap(), (Value::Known(1.5), false));
        assert!(parse_cell("~", &format).is_err());
    }

    #[test]
    fn test_numeric_missing_token() {
        let format = TableFormat {
            missing_token: "-1.0".to_string(),
            ..TableFormat::default()
        };
        assert_eq!(parse_cell("-1.0", &format).unwrap(), (Value::Missing, false));
        // Only the exact token is missing
        assert_eq!(parse_cell("-1", &format).unwrap(), (Value::Known(-1.0), false));
    }

    #[test]
    fn test_parse_table_basic() {
        let parsed = parse_str("a b c\n1 NA 3\n\n4 5 6 \n", &TableFormat::default()).unwrap();
        let table = parsed.table;

        assert_eq!(table.columns(), &["a", "b", "c"]);
        assert_eq!(table.n_rows(), 2);
        assert_eq!(table.value(0, 1), Value::Missing);
        assert_eq!(table.get(1, "c"), Some(Value::Known(6.0)));
        assert_eq!(table.missing_count(), 1);
        assert!(parsed.label_header.is_none());
        assert_eq!(parsed.mask.count(), 0);
    }

    #[test]
    fn test_parse_table_header_only() {
        let parsed = parse_str("a b\n", &TableFormat::default()).unwrap();
        assert_eq!(parsed.table.n_rows(), 0);
        assert_eq!(parsed.table.n_columns(), 2);
    }

    #[test]
    fn test_parse_table_rejects_ragged_rows() {
        let err = parse_str("a b c\n1 2 3\n4 5\n", &TableFormat::default()).unwrap_err();
        match err {
            ImputeError::MalformedInput { row, reason, .. } => {
                assert_eq!(row, Some(1));
                assert!(reason.contains("expected 3"));
            }
            other => panic!("expected MalformedInput, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_table_rejects_bad_values() {
        let err = parse_str("a b\n1 x\n", &TableFormat::default()).unwrap_err();
        assert!(matches!(err, ImputeError::MalformedInput { row: Some(0), .. }));

        let err = parse_str("a b\n1 inf\n", &TableFormat::default()).unwrap_err();
        assert!(err.to_string().contains("non-finite"));
    }

    #[test]
    fn test_parse_table_rejects_empty_and_duplicate_headers() {
        assert!(matches!(
            parse_str("", &TableFormat::default()),
            Err(ImputeError::MalformedInput { row: None, .. })
        ));
        assert!(matches!(
            parse_str("a a\n1 2\n", &TableFormat::default()),
            Err(ImputeError::MalformedInput { row: None, .. })
        ));
    }

    #[test]
    fn test_parse_table_with_labels_and_tabs() {
        let format = TableFormat {
            delimiter: b'\t',
            ..TableFormat::default()
        };
        let parsed = parse_table("name\tx\ty\nBY\t1\tNA\nRM\t2\t3\n".as_bytes(), &format, true, None).unwrap();

        assert_eq!(parsed.label_header.as_deref(), Some("name"));
        assert_eq!(parsed.labels, vec!["BY".to_string(), "RM".to_string()]);
        assert_eq!(parsed.table.columns(), &["x", "y"]);
        assert_eq!(parsed.table.value(0, 1), Value::Missing);
    }

    #[test]
    fn test_read_table_gz_and_path_in_errors() {
        let dir = tempdir().unwrap();
        let gz_path = dir.path().join("strain_1.txt.gz");
        let mut encoder = GzEncoder::new(File::create(&gz_path).unwrap(), Compression::default());
        encoder.write_all(b"a b\n1 2\nNA 4\n").unwrap();
        encoder.finish().unwrap();

        let table = read_table(&gz_path, &TableFormat::default()).unwrap();
        assert_eq!(table.n_rows(), 2);
        assert_eq!(table.value(1, 0), Value::Missing);

        let bad = dir.path().join("bad.txt");
        fs::write(&bad, "a b\n1 2 3\n").unwrap();
        let err = read_table(&bad, &TableFormat::default()).unwrap_err();
        assert!(err.to_string().contains("bad.txt"));
    }

    #[test]
    fn test_read_imputed_table_recovers_mask() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("imputed.txt");
        fs::write(&path, "a b\n1 ~2.5\n3 4\n").unwrap();
        let format = TableFormat {
            imputed_prefix: Some("~".to_string()),
            ..TableFormat::default()
        };

        let imputed = read_imputed_table(&path, &format).unwrap();
        assert!(imputed.is_imputed(0, 1));
        assert!(!imputed.is_imputed(1, 1));
        assert_eq!(imputed.value(0, 1), 2.5);
        assert_eq!(imputed.report.imputed_cells, 1);

        fs::write(&path, "a b\n1 NA\n").unwrap();
        assert!(read_imputed_table(&path, &format).is_err());
    }

    #[test]
    fn test_parse_strain_names() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("strains.txt");
        fs::write(&path, "BY\n\n  RM  \nYJM789\n").unwrap();
        assert_eq!(parse_strain_names(&path).unwrap(), vec!["BY", "RM", "YJM789"]);

        fs::write(&path, "\n\n").unwrap();
        assert!(matches!(parse_strain_names(&path), Err(ImputeError::InvalidConfig(_))));
    }

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), "a\n1\n").unwrap();
    }

    #[test]
    fn test_find_replicate_files() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "centered_scaled_BY_2.txt");
        touch(dir.path(), "centered_scaled_BY_1.txt.gz");
        touch(dir.path(), "centered_scaled_BY_10.txt");
        touch(dir.path(), "centered_scaled_BY_merged.txt");
        touch(dir.path(), "centered_scaled_BYX_3.txt");
        touch(dir.path(), "centered_scaled_RM_1.txt");

        let found = find_replicate_files(dir.path(), "centered_scaled_", "BY").unwrap();
        let reps: Vec<u32> = found.iter().map(|(rep, _)| *rep).collect();
        assert_eq!(reps, vec![1, 2, 10]);
        assert!(found[0].1.to_string_lossy().ends_with("centered_scaled_BY_1.txt.gz"));

        touch(dir.path(), "centered_scaled_BY_2.txt.gz");
        assert!(matches!(
            find_replicate_files(dir.path(), "centered_scaled_", "BY"),
            Err(ImputeError::InvalidConfig(_))
        ));

        assert!(find_replicate_files(dir.path(), "centered_scaled_", "SK1").unwrap().is_empty());
    }

    #[test]
    fn test_replicate_path_prefers_plain_file() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "BY_1.txt.gz");
        assert!(replicate_path(dir.path(), "", "BY", 1).to_string_lossy().ends_with("BY_1.txt.gz"));

        touch(dir.path(), "BY_1.txt");
        assert!(replicate_path(dir.path(), "", "BY", 1).to_string_lossy().ends_with("BY_1.txt"));
        // Neither exists: the plain name is reported
        assert!(replicate_path(dir.path(), "", "BY", 7).to_string_lossy().ends_with("BY_7.txt"));
    }

    #[test]
    fn test_read_experiment_export() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("BY_1_actin_biological.csv");
        fs::write(
            &path,
            "image_number\tcell_id\tA101\tA102\n1\tc1\t0.5\tNA\n1\tc2\t1.5\t2\n",
        )
        .unwrap();

        let export = read_experiment_export(
            &path,
            "cell_id",
            &["image_number".to_string()],
            &TableFormat::default(),
        )
        .unwrap();

        assert_eq!(export.columns, vec!["A101", "A102"]);
        assert_eq!(export.rows.len(), 2);
        assert_eq!(export.rows[0].0, "c1");
        assert_eq!(export.rows[0].1, vec![Value::Known(0.5), Value::Missing]);

        let missing_id = read_experiment_export(&path, "cell", &[], &TableFormat::default());
        assert!(matches!(missing_id, Err(ImputeError::MalformedInput { row: None, .. })));
    }
}
