use crate::process::{ImputeError, TableFormat};
use crate::progress::{log, LogLevel};
use crate::table::{ImputationMask, ImputationReport, ImputedTable, LabeledTable, MeasurementTable, Value};

use flate2::read::MultiGzDecoder;
use regex::Regex;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

/// Opens a table for reading, decompressing `.gz` files transparently.
pub fn open_table_reader(path: &Path) -> Result<Box<dyn BufRead>, ImputeError> {
    let file = File::open(path)?;

    if path.extension().and_then(|s| s.to_str()) == Some("gz") {
        let decoder = MultiGzDecoder::new(file);
        Ok(Box::new(BufReader::new(decoder)))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Everything the loader recovers from one file.
#[derive(Debug, Clone)]
pub struct ParsedTable {
    pub label_header: Option<String>,
    pub labels: Vec<String>,
    pub table: MeasurementTable,
    pub mask: ImputationMask,
}

// Lines ending in a delimiter produce one empty trailing field per delimiter.
fn strip_trailing_empty(record: &csv::StringRecord) -> Vec<String> {
    let mut fields: Vec<String> = record.iter().map(String::from).collect();
    while fields.last().map_or(false, |f| f.is_empty()) {
        fields.pop();
    }
    fields
}

/// Resolves one text cell. The boolean is true when the cell carried the
/// imputed-value prefix.
pub fn parse_cell(token: &str, format: &TableFormat) -> Result<(Value, bool), String> {
    if token == format.missing_token {
        return Ok((Value::Missing, false));
    }

    let (number, imputed) = match format.imputed_prefix.as_deref() {
        Some(prefix) if !prefix.is_empty() && token.starts_with(prefix) => {
            (&token[prefix.len()..], true)
        }
        _ => (token, false),
    };

    if number.is_empty() {
        return Err("empty cell".to_string());
    }
    let x: f64 = number
        .parse()
        .map_err(|_| format!("unparseable value '{}'", token))?;
    if !x.is_finite() {
        if format.non_finite_as_missing {
            return Ok((Value::Missing, false));
        }
        return Err(format!("non-finite value '{}'", token));
    }
    Ok((Value::Known(x), imputed))
}

/// Parses a header line plus data rows. With `label_column`, the first field
/// of every line is a text label rather than a measurement.
pub fn parse_table<R: Read>(
    reader: R,
    format: &TableFormat,
    label_column: bool,
    path: Option<&Path>,
) -> Result<ParsedTable, ImputeError> {
    let malformed = |row: Option<usize>, reason: String| ImputeError::MalformedInput {
        path: path.map(Path::to_path_buf),
        row,
        reason,
    };

    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(format.delimiter)
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut records = csv_reader.records();

    let header = match records.next() {
        Some(record) => strip_trailing_empty(&record?),
        None => return Err(malformed(None, "file is empty; expected a header line".to_string())),
    };

    let (label_header, columns) = if label_column {
        match header.split_first() {
            Some((label, rest)) => (Some(label.clone()), rest.to_vec()),
            None => return Err(malformed(None, "header has no label column".to_string())),
        }
    } else {
        (None, header)
    };
    if columns.is_empty() {
        return Err(malformed(None, "header has no trait columns".to_string()));
    }

    let mut labels = Vec::new();
    let mut rows = Vec::new();
    let mut imputed_cells = Vec::new();

    for result in records {
        let fields = strip_trailing_empty(&result?);
        if fields.is_empty() {
            continue;
        }
        let row_idx = rows.len();

        let cells = if label_column {
            labels.push(fields[0].clone());
            &fields[1..]
        } else {
            &fields[..]
        };

        if cells.len() != columns.len() {
            return Err(malformed(
                Some(row_idx),
                format!(
                    "expected {} cells to match the header, found {}",
                    columns.len(),
                    cells.len()
                ),
            ));
        }

        let mut row = Vec::with_capacity(cells.len());
        for (k, token) in cells.iter().enumerate() {
            let (value, imputed) = parse_cell(token, format)
                .map_err(|reason| malformed(Some(row_idx), format!("column '{}': {}", columns[k], reason)))?;
            if imputed {
                imputed_cells.push((row_idx, k));
            }
            row.push(value);
        }
        rows.push(row);
    }

    let n_rows = rows.len();
    let n_columns = columns.len();
    let table = MeasurementTable::new(columns, rows).map_err(|e| e.with_path(path))?;

    let mut mask = ImputationMask::empty(n_rows, n_columns);
    for (i, k) in imputed_cells {
        mask.mark(i, k);
    }

    Ok(ParsedTable {
        label_header,
        labels,
        table,
        mask,
    })
}

/// Loads one measurement table (header + rows).
pub fn read_table(path: &Path, format: &TableFormat) -> Result<MeasurementTable, ImputeError> {
    let reader = open_table_reader(path)?;
    Ok(parse_table(reader, format, false, Some(path))?.table)
}

/// Loads a previously written imputed table, recovering the imputed-cell
/// mask from the configured prefix. Any cell still missing is an error.
pub fn read_imputed_table(path: &Path, format: &TableFormat) -> Result<ImputedTable, ImputeError> {
    let reader = open_table_reader(path)?;
    let parsed = parse_table(reader, format, false, Some(path))?;

    for (i, row) in parsed.table.rows().iter().enumerate() {
        if let Some(k) = row.iter().position(|v| v.is_missing()) {
            return Err(ImputeError::MalformedInput {
                path: Some(path.to_path_buf()),
                row: Some(i),
                reason: format!("column '{}' is missing in an imputed table", parsed.table.columns()[k]),
            });
        }
    }

    let report = ImputationReport {
        imputed_cells: parsed.mask.count(),
        ..Default::default()
    };
    Ok(ImputedTable {
        table: parsed.table,
        mask: parsed.mask,
        report,
    })
}

/// Loads a table whose first column holds row labels (e.g. `mean.txt`).
pub fn read_labeled_table(path: &Path, format: &TableFormat) -> Result<LabeledTable, ImputeError> {
    let reader = open_table_reader(path)?;
    let parsed = parse_table(reader, format, true, Some(path))?;
    LabeledTable::new(
        parsed.label_header.unwrap_or_default(),
        parsed.labels,
        parsed.table,
    )
}

/// Reads the strain list: one name per line, blank lines ignored.
pub fn parse_strain_names(path: &Path) -> Result<Vec<String>, ImputeError> {
    let reader = open_table_reader(path)?;
    let mut strains = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let name = line.trim();
        if !name.is_empty() {
            strains.push(name.to_string());
        }
    }
    if strains.is_empty() {
        return Err(ImputeError::InvalidConfig(format!(
            "strain list {} is empty",
            path.display()
        )));
    }
    Ok(strains)
}

/// Path of one replicate file, preferring the plain file over a `.gz` twin.
pub fn replicate_path(dir: &Path, prefix: &str, strain: &str, replicate: u32) -> PathBuf {
    let plain = dir.join(format!("{}{}_{}.txt", prefix, strain, replicate));
    if plain.exists() {
        return plain;
    }
    let compressed = dir.join(format!("{}{}_{}.txt.gz", prefix, strain, replicate));
    if compressed.exists() {
        compressed
    } else {
        plain
    }
}

/// Finds `<dir>/<prefix><strain>_<rep>.txt[.gz]` files, sorted by replicate
/// number.
pub fn find_replicate_files(
    dir: &Path,
    prefix: &str,
    strain: &str,
) -> Result<Vec<(u32, PathBuf)>, ImputeError> {
    let stem = format!("{}{}", prefix, strain);
    let pattern = dir.join(format!("{}_*.txt*", glob::Pattern::escape(&stem)));
    let pattern = pattern
        .to_str()
        .ok_or_else(|| ImputeError::Pattern(format!("non UTF-8 path {}", dir.display())))?;
    let name_re = Regex::new(&format!(r"^{}_(\d+)\.txt(\.gz)?$", regex::escape(&stem)))
        .map_err(|e| ImputeError::Pattern(e.to_string()))?;

    let mut found: Vec<(u32, PathBuf)> = Vec::new();
    for entry in glob::glob(pattern).map_err(|e| ImputeError::Pattern(e.to_string()))? {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                log(LogLevel::Warning, &format!("Skipping unreadable entry: {}", e));
                continue;
            }
        };
        let file_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        let replicate = match name_re
            .captures(&file_name)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
        {
            Some(rep) => rep,
            None => continue,
        };
        if let Some((_, existing)) = found.iter().find(|(rep, _)| *rep == replicate) {
            return Err(ImputeError::InvalidConfig(format!(
                "replicate {} of strain {} is present twice: {} and {}",
                replicate,
                strain,
                existing.display(),
                path.display()
            )));
        }
        found.push((replicate, path));
    }

    found.sort_by_key(|(rep, _)| *rep);
    Ok(found)
}

/// One tab-separated experiment export: per-cell rows keyed by the id column.
#[derive(Debug, Clone)]
pub struct ExperimentExport {
    pub columns: Vec<String>,
    pub rows: Vec<(String, Vec<Value>)>,
}

/// Reads an experiment export, dropping the id column and every column
/// named in `ignored`.
pub fn read_experiment_export(
    path: &Path,
    id_column: &str,
    ignored: &[String],
    format: &TableFormat,
) -> Result<ExperimentExport, ImputeError> {
    let malformed = |row: Option<usize>, reason: String| ImputeError::MalformedInput {
        path: Some(path.to_path_buf()),
        row,
        reason,
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(open_table_reader(path)?);
    let mut records = reader.records();

    let header = match records.next() {
        Some(record) => strip_trailing_empty(&record?),
        None => return Err(malformed(None, "export is empty".to_string())),
    };
    let id_idx = header
        .iter()
        .position(|c| c == id_column)
        .ok_or_else(|| malformed(None, format!("id column '{}' not found in header", id_column)))?;
    let kept: Vec<usize> = (0..header.len())
        .filter(|&i| i != id_idx && !ignored.contains(&header[i]))
        .collect();

    let mut rows = Vec::new();
    for result in records {
        let fields = strip_trailing_empty(&result?);
        if fields.is_empty() {
            continue;
        }
        let row_idx = rows.len();
        if fields.len() != header.len() {
            return Err(malformed(
                Some(row_idx),
                format!("expected {} fields, found {}", header.len(), fields.len()),
            ));
        }
        let mut values = Vec::with_capacity(kept.len());
        for &i in &kept {
            let (value, _) = parse_cell(&fields[i], format)
                .map_err(|reason| malformed(Some(row_idx), format!("column '{}': {}", header[i], reason)))?;
            values.push(value);
        }
        rows.push((fields[id_idx].clone(), values));
    }

    Ok(ExperimentExport {
        columns: kept.into_iter().map(|i| header[i].clone()).collect(),
        rows,
    })
}
