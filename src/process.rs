use crate::impute::{impute_replicate, mean_fill};
use crate::parse::{
    find_replicate_files, open_table_reader, parse_strain_names, parse_table, read_experiment_export,
    read_labeled_table, read_table, replicate_path,
};
use crate::progress::{
    create_item_bar, create_spinner, display_status_box, log, set_stage, LogLevel, ProcessingStage,
    StatusBox,
};
use crate::stats::{column_summaries, compute_correlation_matrix, ColumnSummary, CorrelationMatrix, ZScoreScaler};
use crate::table::{ImputationMask, ImputedTable, LabeledTable, MeasurementTable, Value};

use clap::{Parser, Subcommand};
use colored::*;
use csv::WriterBuilder;
use itertools::{iproduct, Itertools};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};

// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Intrastrain replicate imputation for phenomics trait tables", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub format: FormatArgs,

    /// Worker threads used for per-strain and per-replicate parallelism
    #[arg(short, long, global = true, default_value_t = num_cpus::get())]
    pub threads: usize,

    /// Increase logging verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// How tables are read and written.
#[derive(clap::Args, Debug, Clone)]
pub struct FormatArgs {
    /// Field delimiter: a single character, or "space" / "tab"
    #[arg(long, global = true, default_value = "space")]
    pub delimiter: String,

    /// Token marking a missing value
    #[arg(long = "missing", global = true, default_value = "NA", allow_hyphen_values = true)]
    pub missing_token: String,

    /// Write imputed cells as <PREFIX><value>, and read such cells back as imputed
    #[arg(long = "mark-imputed", global = true, allow_hyphen_values = true)]
    pub imputed_prefix: Option<String>,

    /// Treat inf/nan cells as missing instead of rejecting the file
    #[arg(long = "inf-as-missing", global = true)]
    pub inf_as_missing: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Impute the missing cells of a single replicate table
    Impute {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        /// Also write the row correlation matrix used for imputation
        #[arg(long = "matrix-output")]
        matrix_output: Option<PathBuf>,
    },

    /// Impute every replicate group of every strain in the strain list
    ImputeStrains {
        #[arg(long)]
        strains: PathBuf,

        #[arg(long = "input-dir")]
        input_dir: PathBuf,

        #[arg(long = "output-dir", default_value = "interpolated")]
        output_dir: PathBuf,

        /// File name prefix in front of <strain>_<rep>.txt
        #[arg(long = "input-prefix", default_value = "centered_scaled_")]
        input_prefix: String,

        /// Replicate numbers to use; discovered from file names when omitted
        #[arg(long, value_delimiter = ',')]
        replicates: Option<Vec<u32>>,

        /// Remove the output directory before writing
        #[arg(long)]
        clean: bool,

        /// Merge each strain's imputed replicates into <strain>_merged.txt
        #[arg(long)]
        merge: bool,
    },

    /// Concatenate <strain>_<rep>.txt files into <strain>_merged.txt
    MergeReplicates {
        #[arg(long)]
        strains: PathBuf,

        #[arg(long, default_value = "interpolated")]
        dir: PathBuf,

        #[arg(long, value_delimiter = ',')]
        replicates: Option<Vec<u32>>,
    },

    /// Join per-experiment tab-separated exports into one table per strain
    MergeExperiments {
        #[command(flatten)]
        experiment: ExperimentArgs,

        #[arg(long = "output-dir", default_value = "merged")]
        output_dir: PathBuf,
    },

    /// Join per-experiment exports into one table per strain and replicate
    GenerateReplicates {
        #[command(flatten)]
        experiment: ExperimentArgs,

        #[arg(long = "output-dir", default_value = "replicates")]
        output_dir: PathBuf,
    },

    /// Write per-strain column means and standard deviations (mean.txt, sdev.txt)
    StrainStats {
        #[arg(long)]
        strains: PathBuf,

        #[arg(long = "merged-dir", default_value = "merged")]
        merged_dir: PathBuf,

        #[arg(long = "output-dir", default_value = "interstrain_means")]
        output_dir: PathBuf,
    },

    /// Fill missing cells of each strain table with the strain's column means
    MeanFill {
        #[arg(long)]
        strains: PathBuf,

        #[arg(long = "merged-dir", default_value = "merged")]
        merged_dir: PathBuf,

        #[arg(long = "output-dir", default_value = "corrected")]
        output_dir: PathBuf,
    },

    /// Z-score the strain-mean table, then the corrected strain tables
    /// and/or the per-replicate tables with the same column statistics
    CenterScale {
        #[arg(long)]
        strains: PathBuf,

        #[arg(long, default_value = "interstrain_means/mean.txt")]
        means: PathBuf,

        /// Directory of <strain>.txt tables
        #[arg(long = "corrected-dir")]
        corrected_dir: Option<PathBuf>,

        /// Directory of <strain>_<rep>.txt tables
        #[arg(long = "replicates-dir")]
        replicates_dir: Option<PathBuf>,

        /// Replicate numbers to scale; discovered from file names when omitted
        #[arg(long, value_delimiter = ',')]
        replicates: Option<Vec<u32>>,
    },
}

/// Where the experiment exports live and which parts of them to keep.
#[derive(clap::Args, Debug, Clone)]
pub struct ExperimentArgs {
    #[arg(long)]
    pub strains: PathBuf,

    #[arg(long = "csv-dir", default_value = "csv")]
    pub csv_dir: PathBuf,

    #[arg(long, value_delimiter = ',', default_values_t = [1u32, 2, 3, 4, 5])]
    pub replicates: Vec<u32>,

    #[arg(
        long,
        value_delimiter = ',',
        default_values = ["actin_biological", "conA_biological", "dapi_biological"]
    )]
    pub experiments: Vec<String>,

    /// Columns dropped from every export
    #[arg(
        long,
        value_delimiter = ',',
        default_values = ["image_number", "Cgroup", "Agroup", "Dgroup", "D115", "D111"]
    )]
    pub ignore: Vec<String>,

    #[arg(long = "id-column", default_value = "cell_id")]
    pub id_column: String,
}

impl ExperimentArgs {
    fn into_options(self, output_dir: PathBuf) -> (PathBuf, ExperimentMergeOptions) {
        let options = ExperimentMergeOptions {
            csv_dir: self.csv_dir,
            output_dir,
            replicates: self.replicates,
            experiments: self.experiments,
            ignored: self.ignore,
            id_column: self.id_column,
        };
        (self.strains, options)
    }
}

// Custom error types
#[derive(Debug, thiserror::Error)]
pub enum ImputeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Malformed input{}: {reason}", describe_location(.path, .row))]
    MalformedInput {
        path: Option<PathBuf>,
        row: Option<usize>,
        reason: String,
    },
    #[error("Shape mismatch: expected {expected}, found {found}")]
    ShapeMismatch { expected: usize, found: usize },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("No replicate files found for strain {strain}")]
    NoReplicates { strain: String },
    #[error("Invalid file pattern: {0}")]
    Pattern(String),
}

fn describe_location(path: &Option<PathBuf>, row: &Option<usize>) -> String {
    match (path, row) {
        (Some(p), Some(r)) => format!(" in {} at data row {}", p.display(), r),
        (Some(p), None) => format!(" in {}", p.display()),
        (None, Some(r)) => format!(" at data row {}", r),
        (None, None) => String::new(),
    }
}

impl ImputeError {
    /// Attaches a file path to a `MalformedInput` that was raised without one.
    pub fn with_path(self, file: Option<&Path>) -> Self {
        match self {
            ImputeError::MalformedInput { path: None, row, reason } => ImputeError::MalformedInput {
                path: file.map(Path::to_path_buf),
                row,
                reason,
            },
            other => other,
        }
    }
}

/// Resolved table format shared by the loader and the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFormat {
    pub delimiter: u8,
    pub missing_token: String,
    pub imputed_prefix: Option<String>,
    pub non_finite_as_missing: bool,
}

impl Default for TableFormat {
    fn default() -> Self {
        TableFormat {
            delimiter: b' ',
            missing_token: "NA".to_string(),
            imputed_prefix: None,
            non_finite_as_missing: false,
        }
    }
}

impl TableFormat {
    pub fn from_args(args: &FormatArgs) -> Result<Self, ImputeError> {
        let delimiter = match args.delimiter.as_str() {
            "space" => b' ',
            "tab" | "\\t" => b'\t',
            other if other.len() == 1 && other.is_ascii() => other.as_bytes()[0],
            other => {
                return Err(ImputeError::InvalidConfig(format!(
                    "delimiter must be a single ASCII character, got '{}'",
                    other
                )))
            }
        };
        if args.missing_token.is_empty() {
            return Err(ImputeError::InvalidConfig("missing-value token must not be empty".to_string()));
        }
        if args.missing_token.as_bytes().contains(&delimiter) {
            return Err(ImputeError::InvalidConfig(
                "missing-value token must not contain the delimiter".to_string(),
            ));
        }
        if let Some(prefix) = &args.imputed_prefix {
            if prefix.is_empty() || prefix.as_bytes().contains(&delimiter) {
                return Err(ImputeError::InvalidConfig(format!(
                    "imputed-value prefix '{}' must be non-empty and free of the delimiter",
                    prefix
                )));
            }
            if prefix == &args.missing_token {
                return Err(ImputeError::InvalidConfig(
                    "imputed-value prefix must differ from the missing-value token".to_string(),
                ));
            }
        }
        Ok(TableFormat {
            delimiter,
            missing_token: args.missing_token.clone(),
            imputed_prefix: args.imputed_prefix.clone(),
            non_finite_as_missing: args.inf_as_missing,
        })
    }
}

fn create_and_setup_table_writer(
    output_file: &Path,
    delimiter: u8,
) -> Result<csv::Writer<BufWriter<File>>, ImputeError> {
    if let Some(parent) = output_file.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = File::create(output_file)?;
    let buf_writer = BufWriter::new(file);
    let writer = WriterBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(buf_writer);
    Ok(writer)
}

/// Text form of one cell. f64 Display is the shortest string that parses
/// back to the same value.
pub fn format_cell(value: Value, imputed: bool, format: &TableFormat) -> String {
    match value {
        Value::Known(x) => match (&format.imputed_prefix, imputed) {
            (Some(prefix), true) => format!("{}{}", prefix, x),
            _ => x.to_string(),
        },
        Value::Missing => format.missing_token.clone(),
    }
}

fn write_rows<W: Write>(
    writer: &mut csv::Writer<W>,
    labels: Option<&[String]>,
    table: &MeasurementTable,
    mask: Option<&ImputationMask>,
    format: &TableFormat,
) -> Result<(), ImputeError> {
    for (i, row) in table.rows().iter().enumerate() {
        let mut record: Vec<String> = Vec::with_capacity(row.len() + 1);
        if let Some(labels) = labels {
            record.push(labels[i].clone());
        }
        for (k, value) in row.iter().enumerate() {
            let imputed = mask.map_or(false, |m| m.is_imputed(i, k));
            record.push(format_cell(*value, imputed, format));
        }
        writer.write_record(&record)?;
    }
    Ok(())
}

/// Writes a header line and one line per row, in column order. Cells flagged
/// in `mask` carry the imputed-value prefix when one is configured.
pub fn write_table(
    path: &Path,
    table: &MeasurementTable,
    mask: Option<&ImputationMask>,
    format: &TableFormat,
) -> Result<(), ImputeError> {
    let mut writer = create_and_setup_table_writer(path, format.delimiter)?;
    writer.write_record(table.columns())?;
    write_rows(&mut writer, None, table, mask, format)?;
    writer.flush()?;
    Ok(())
}

pub fn write_imputed_table(path: &Path, imputed: &ImputedTable, format: &TableFormat) -> Result<(), ImputeError> {
    write_table(path, &imputed.table, Some(&imputed.mask), format)
}

pub fn write_labeled_table(path: &Path, labeled: &LabeledTable, format: &TableFormat) -> Result<(), ImputeError> {
    let mut writer = create_and_setup_table_writer(path, format.delimiter)?;
    let header: Vec<&str> = std::iter::once(labeled.label_header.as_str())
        .chain(labeled.table.columns().iter().map(String::as_str))
        .collect();
    writer.write_record(&header)?;
    write_rows(&mut writer, Some(&labeled.labels), &labeled.table, None, format)?;
    writer.flush()?;
    Ok(())
}

/// Writes the N x N coefficients, one matrix row per line, no header.
pub fn write_correlation_matrix(
    path: &Path,
    matrix: &CorrelationMatrix,
    format: &TableFormat,
) -> Result<(), ImputeError> {
    let mut writer = create_and_setup_table_writer(path, format.delimiter)?;
    for row in matrix.as_array().rows() {
        writer.write_record(row.iter().map(|x| x.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

/// Loads one table and imputes it. Cells already flagged as imputed in the
/// input stay flagged in the result.
pub fn impute_table_file(
    path: &Path,
    format: &TableFormat,
) -> Result<(ImputedTable, CorrelationMatrix), ImputeError> {
    let parsed = parse_table(open_table_reader(path)?, format, false, Some(path))?;
    let correlations = compute_correlation_matrix(&parsed.table);
    let mut imputed = impute_replicate(&parsed.table, &correlations)?;
    imputed.mask.union(&parsed.mask);
    Ok((imputed, correlations))
}

/// Loads one table, imputes it and writes the result.
pub fn run_impute_file(
    input: &Path,
    output: &Path,
    matrix_output: Option<&Path>,
    format: &TableFormat,
) -> Result<ImputedTable, ImputeError> {
    set_stage(ProcessingStage::Imputation);
    log(LogLevel::Info, &format!("Loading {}", input.display()));

    let spinner = create_spinner("Imputing missing cells");
    let (imputed, correlations) = impute_table_file(input, format)?;
    spinner.finish_and_clear();
    let table = &imputed.table;

    write_imputed_table(output, &imputed, format)?;
    if let Some(matrix_path) = matrix_output {
        write_correlation_matrix(matrix_path, &correlations, format)?;
        log(LogLevel::Info, &format!("Correlation matrix written to {}", matrix_path.display()));
    }

    let report = &imputed.report;
    display_status_box(StatusBox {
        title: format!("Imputation of {}", input.display()),
        stats: vec![
            ("Rows".to_string(), table.n_rows().to_string()),
            ("Columns".to_string(), table.n_columns().to_string()),
            ("Imputed cells".to_string(), report.imputed_cells.to_string()),
            ("Undefined correlations".to_string(), report.undefined_correlations.to_string()),
            ("Rows without known values".to_string(), report.undefined_baselines.to_string()),
            ("Cells without donors".to_string(), report.no_donor.to_string()),
            ("Cells with zero donor weight".to_string(), report.zero_weight.to_string()),
        ],
    });
    log(LogLevel::Info, &format!("Imputed table written to {}", output.display()));

    Ok(imputed)
}

/// One replicate file of one strain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicateGroup {
    pub strain: String,
    pub replicate: u32,
    pub path: PathBuf,
}

/// Summary of one imputed replicate group.
#[derive(Debug, Clone)]
pub struct GroupOutcome {
    pub strain: String,
    pub replicate: u32,
    pub output: PathBuf,
    pub rows: usize,
    pub imputed_cells: usize,
    pub fallbacks: usize,
}

/// Lists the replicate files of every strain, either the explicit replicate
/// numbers or whatever matches `<prefix><strain>_<rep>.txt[.gz]` in `dir`.
pub fn collect_replicate_groups(
    strains: &[String],
    dir: &Path,
    prefix: &str,
    replicates: Option<&[u32]>,
) -> Result<Vec<ReplicateGroup>, ImputeError> {
    let mut groups = Vec::new();
    for strain in strains {
        let files: Vec<(u32, PathBuf)> = match replicates {
            Some(reps) => reps
                .iter()
                .map(|&rep| (rep, replicate_path(dir, prefix, strain, rep)))
                .collect(),
            None => find_replicate_files(dir, prefix, strain)?,
        };
        if files.is_empty() {
            return Err(ImputeError::NoReplicates { strain: strain.clone() });
        }
        log(
            LogLevel::Debug,
            &format!(
                "Strain {}: replicates {}",
                strain,
                files.iter().map(|(rep, _)| rep).join(",")
            ),
        );
        groups.extend(files.into_iter().map(|(replicate, path)| ReplicateGroup {
            strain: strain.clone(),
            replicate,
            path,
        }));
    }
    Ok(groups)
}

pub fn impute_replicate_group(
    group: &ReplicateGroup,
    output_dir: &Path,
    format: &TableFormat,
) -> Result<GroupOutcome, ImputeError> {
    let (imputed, _) = impute_table_file(&group.path, format)?;
    let table = &imputed.table;

    let output = output_dir.join(format!("{}_{}.txt", group.strain, group.replicate));
    write_imputed_table(&output, &imputed, format)?;

    let report = &imputed.report;
    log(
        LogLevel::Debug,
        &format!(
            "{}-{}: {} rows, {} cells imputed",
            group.strain,
            group.replicate,
            table.n_rows(),
            report.imputed_cells
        ),
    );
    Ok(GroupOutcome {
        strain: group.strain.clone(),
        replicate: group.replicate,
        output,
        rows: table.n_rows(),
        imputed_cells: report.imputed_cells,
        fallbacks: report.no_donor + report.zero_weight,
    })
}

#[derive(Debug, Clone)]
pub struct ImputeStrainsOptions {
    pub input_dir: PathBuf,
    pub input_prefix: String,
    pub output_dir: PathBuf,
    pub replicates: Option<Vec<u32>>,
    pub clean: bool,
    pub merge: bool,
}

/// Imputes every replicate group in parallel. Groups share nothing; the first
/// failing group aborts the run with its error.
pub fn run_impute_strains(
    strains: &[String],
    options: &ImputeStrainsOptions,
    format: &TableFormat,
) -> Result<Vec<GroupOutcome>, ImputeError> {
    set_stage(ProcessingStage::Imputation);
    println!("{}", "Starting intrastrain imputation...".green());

    let groups = collect_replicate_groups(
        strains,
        &options.input_dir,
        &options.input_prefix,
        options.replicates.as_deref(),
    )?;

    if options.clean && options.output_dir.exists() {
        log(LogLevel::Info, &format!("Removing {}", options.output_dir.display()));
        fs::remove_dir_all(&options.output_dir)?;
    }
    fs::create_dir_all(&options.output_dir)?;

    log(
        LogLevel::Info,
        &format!("Imputing {} replicate groups of {} strains", groups.len(), strains.len()),
    );
    let bar = create_item_bar(groups.len() as u64, "Imputing replicate groups");

    let results: Vec<Result<GroupOutcome, ImputeError>> = groups
        .par_iter()
        .map(|group| {
            let outcome = impute_replicate_group(group, &options.output_dir, format);
            bar.inc(1);
            outcome
        })
        .collect();
    bar.finish_with_message("Imputation complete");

    let outcomes = results.into_iter().collect::<Result<Vec<_>, _>>()?;

    display_status_box(StatusBox {
        title: "Intrastrain imputation".to_string(),
        stats: vec![
            ("Strains".to_string(), strains.len().to_string()),
            ("Replicate groups".to_string(), outcomes.len().to_string()),
            ("Rows".to_string(), outcomes.iter().map(|o| o.rows).sum::<usize>().to_string()),
            (
                "Imputed cells".to_string(),
                outcomes.iter().map(|o| o.imputed_cells).sum::<usize>().to_string(),
            ),
            (
                "Baseline fallbacks".to_string(),
                outcomes.iter().map(|o| o.fallbacks).sum::<usize>().to_string(),
            ),
        ],
    });

    if options.merge {
        run_merge_replicates(strains, &options.output_dir, options.replicates.as_deref())?;
    }

    Ok(outcomes)
}

/// Writes the header of the first file followed by the data lines of every
/// file. Returns the number of data lines written.
pub fn merge_replicate_files(files: &[PathBuf], output: &Path) -> Result<usize, ImputeError> {
    let mut writer = BufWriter::new(File::create(output)?);
    let mut header: Option<String> = None;
    let mut rows = 0usize;

    for file in files {
        let mut lines = open_table_reader(file)?.lines();
        let file_header = match lines.next() {
            Some(line) => line?.trim_end().to_string(),
            None => {
                return Err(ImputeError::MalformedInput {
                    path: Some(file.clone()),
                    row: None,
                    reason: "file is empty; expected a header line".to_string(),
                })
            }
        };
        match &header {
            None => {
                writeln!(writer, "{}", file_header)?;
                header = Some(file_header);
            }
            Some(first) if *first != file_header => {
                return Err(ImputeError::MalformedInput {
                    path: Some(file.clone()),
                    row: None,
                    reason: "header differs from the first replicate's header".to_string(),
                })
            }
            Some(_) => {}
        }
        for line in lines {
            let line = line?;
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            writeln!(writer, "{}", line)?;
            rows += 1;
        }
    }

    writer.flush()?;
    Ok(rows)
}

/// Merges `<dir>/<strain>_<rep>.txt` into `<dir>/<strain>_merged.txt` for
/// every strain, in replicate order.
pub fn run_merge_replicates(
    strains: &[String],
    dir: &Path,
    replicates: Option<&[u32]>,
) -> Result<Vec<(String, usize)>, ImputeError> {
    set_stage(ProcessingStage::ReplicateMerge);
    let groups = collect_replicate_groups(strains, dir, "", replicates)?;

    let mut merged = Vec::with_capacity(strains.len());
    for strain in strains {
        let files: Vec<PathBuf> = groups
            .iter()
            .filter(|g| &g.strain == strain)
            .map(|g| g.path.clone())
            .collect();
        let output = dir.join(format!("{}_merged.txt", strain));
        let rows = merge_replicate_files(&files, &output)?;
        log(
            LogLevel::Info,
            &format!("Merged {} replicates of {} ({} rows) into {}", files.len(), strain, rows, output.display()),
        );
        merged.push((strain.clone(), rows));
    }
    Ok(merged)
}

#[derive(Debug, Clone)]
pub struct ExperimentMergeOptions {
    pub csv_dir: PathBuf,
    pub output_dir: PathBuf,
    pub replicates: Vec<u32>,
    pub experiments: Vec<String>,
    pub ignored: Vec<String>,
    pub id_column: String,
}

/// Joins every experiment export of the given replicates of one strain on
/// `<cell_id>_<rep>`. The first value seen for a (cell, trait) pair wins;
/// columns and cells keep first-seen order. Non-finite export values are
/// read as missing.
pub fn merge_strain_experiments(
    strain: &str,
    replicates: &[u32],
    options: &ExperimentMergeOptions,
    format: &TableFormat,
) -> Result<MeasurementTable, ImputeError> {
    let format = TableFormat {
        non_finite_as_missing: true,
        ..format.clone()
    };
    let mut columns: Vec<String> = Vec::new();
    let mut column_index: HashMap<String, usize> = HashMap::new();
    let mut cells: Vec<HashMap<usize, Value>> = Vec::new();
    let mut cell_index: HashMap<String, usize> = HashMap::new();

    for (rep, experiment) in iproduct!(replicates.iter(), options.experiments.iter()) {
        let path = options
            .csv_dir
            .join(format!("{}_{}_{}.csv", strain, rep, experiment));
        let export = read_experiment_export(&path, &options.id_column, &options.ignored, &format)?;

        let export_columns: Vec<usize> = export
            .columns
            .iter()
            .map(|name| {
                *column_index.entry(name.clone()).or_insert_with(|| {
                    columns.push(name.clone());
                    columns.len() - 1
                })
            })
            .collect();

        for (cell_id, values) in export.rows {
            let key = format!("{}_{}", cell_id, rep);
            let idx = *cell_index.entry(key).or_insert_with(|| {
                cells.push(HashMap::new());
                cells.len() - 1
            });
            for (&column, value) in export_columns.iter().zip(values) {
                cells[idx].entry(column).or_insert(value);
            }
        }
    }

    let rows: Vec<Vec<Value>> = cells
        .iter()
        .map(|cell| {
            (0..columns.len())
                .map(|k| cell.get(&k).copied().unwrap_or(Value::Missing))
                .collect()
        })
        .collect();
    MeasurementTable::new(columns, rows)
}

pub fn run_merge_experiments(
    strains: &[String],
    options: &ExperimentMergeOptions,
    format: &TableFormat,
) -> Result<(), ImputeError> {
    set_stage(ProcessingStage::ExperimentMerge);
    fs::create_dir_all(&options.output_dir)?;
    let bar = create_item_bar(strains.len() as u64, "Merging experiment exports");

    let results: Vec<Result<(String, usize), ImputeError>> = strains
        .par_iter()
        .map(|strain| -> Result<(String, usize), ImputeError> {
            let table = merge_strain_experiments(strain, &options.replicates, options, format)?;
            write_table(&options.output_dir.join(format!("{}.txt", strain)), &table, None, format)?;
            bar.inc(1);
            Ok((strain.clone(), table.n_rows()))
        })
        .collect();
    bar.finish_with_message("Experiment merge complete");

    for result in results {
        let (strain, rows) = result?;
        log(LogLevel::Info, &format!("Merged {} cells for {}", rows, strain));
    }
    Ok(())
}

/// Writes one joined table per strain and replicate,
/// `<output_dir>/<strain>_<rep>.txt`.
pub fn run_generate_replicates(
    strains: &[String],
    options: &ExperimentMergeOptions,
    format: &TableFormat,
) -> Result<Vec<ReplicateGroup>, ImputeError> {
    set_stage(ProcessingStage::ExperimentMerge);
    fs::create_dir_all(&options.output_dir)?;
    let pairs: Vec<(&String, u32)> = iproduct!(strains.iter(), options.replicates.iter().copied()).collect();
    let bar = create_item_bar(pairs.len() as u64, "Writing replicate tables");

    let results: Vec<Result<ReplicateGroup, ImputeError>> = pairs
        .par_iter()
        .map(|&(strain, rep)| -> Result<ReplicateGroup, ImputeError> {
            let table = merge_strain_experiments(strain, &[rep], options, format)?;
            let path = options.output_dir.join(format!("{}_{}.txt", strain, rep));
            write_table(&path, &table, None, format)?;
            bar.inc(1);
            log(
                LogLevel::Debug,
                &format!("{}-{}: {} cells, {} missing", strain, rep, table.n_rows(), table.missing_count()),
            );
            Ok(ReplicateGroup {
                strain: strain.clone(),
                replicate: rep,
                path,
            })
        })
        .collect();
    bar.finish_with_message("Replicate tables written");

    results.into_iter().collect()
}

/// Per-strain column means and standard deviations, one row per strain.
pub fn summarize_strains(
    strains: &[String],
    merged_dir: &Path,
    format: &TableFormat,
) -> Result<(LabeledTable, LabeledTable), ImputeError> {
    let results: Vec<Result<(Vec<String>, Vec<ColumnSummary>), ImputeError>> = strains
        .par_iter()
        .map(|strain| -> Result<(Vec<String>, Vec<ColumnSummary>), ImputeError> {
            let path = merged_dir.join(format!("{}.txt", strain));
            let table = read_table(&path, format)?;
            log(LogLevel::Debug, &format!("Computing column statistics for {}", strain));
            Ok((table.columns().to_vec(), column_summaries(&table)))
        })
        .collect();

    let mut columns: Option<Vec<String>> = None;
    let mut mean_rows: Vec<Vec<Value>> = Vec::with_capacity(strains.len());
    let mut sdev_rows: Vec<Vec<Value>> = Vec::with_capacity(strains.len());
    for (strain, result) in strains.iter().zip(results) {
        let (strain_columns, summaries) = result?;
        match &columns {
            None => columns = Some(strain_columns),
            Some(first) if *first != strain_columns => {
                return Err(ImputeError::MalformedInput {
                    path: Some(merged_dir.join(format!("{}.txt", strain))),
                    row: None,
                    reason: format!("columns differ from those of strain {}", strains[0]),
                })
            }
            Some(_) => {}
        }
        mean_rows.push(summaries.iter().map(|s| Value::from(s.mean)).collect());
        sdev_rows.push(summaries.iter().map(|s| Value::from(s.sd)).collect());
    }

    let columns = columns.unwrap_or_default();
    let means = LabeledTable::new(
        "name".to_string(),
        strains.to_vec(),
        MeasurementTable::new(columns.clone(), mean_rows)?,
    )?;
    let sdevs = LabeledTable::new(
        "name".to_string(),
        strains.to_vec(),
        MeasurementTable::new(columns, sdev_rows)?,
    )?;
    Ok((means, sdevs))
}

pub fn run_strain_stats(
    strains: &[String],
    merged_dir: &Path,
    output_dir: &Path,
    format: &TableFormat,
) -> Result<(LabeledTable, LabeledTable), ImputeError> {
    set_stage(ProcessingStage::StrainStatistics);
    let spinner = create_spinner("Computing per-strain means and standard deviations");
    let (means, sdevs) = summarize_strains(strains, merged_dir, format)?;
    spinner.finish_and_clear();

    write_labeled_table(&output_dir.join("mean.txt"), &means, format)?;
    write_labeled_table(&output_dir.join("sdev.txt"), &sdevs, format)?;

    display_status_box(StatusBox {
        title: "Strain statistics".to_string(),
        stats: vec![
            ("Strains".to_string(), strains.len().to_string()),
            ("Traits".to_string(), means.table.n_columns().to_string()),
            ("Undefined means".to_string(), means.table.missing_count().to_string()),
            ("Output".to_string(), output_dir.display().to_string()),
        ],
    });
    Ok((means, sdevs))
}

/// Fills each strain table's missing cells with that strain's column means.
pub fn run_mean_fill(
    strains: &[String],
    merged_dir: &Path,
    output_dir: &Path,
    format: &TableFormat,
) -> Result<Vec<(String, usize)>, ImputeError> {
    set_stage(ProcessingStage::MeanCorrection);
    fs::create_dir_all(output_dir)?;

    let results: Vec<Result<(String, usize), ImputeError>> = strains
        .par_iter()
        .map(|strain| -> Result<(String, usize), ImputeError> {
            let table = read_table(&merged_dir.join(format!("{}.txt", strain)), format)?;
            let filled = mean_fill(&table)?;
            write_imputed_table(&output_dir.join(format!("{}.txt", strain)), &filled, format)?;
            Ok((strain.clone(), filled.report.imputed_cells))
        })
        .collect();

    let filled = results.into_iter().collect::<Result<Vec<_>, _>>()?;
    for (strain, count) in &filled {
        log(LogLevel::Info, &format!("Corrected {} cells for {}", count, strain));
    }
    Ok(filled)
}

#[derive(Debug, Clone)]
pub struct CenterScaleOptions {
    pub means_path: PathBuf,
    pub corrected_dir: Option<PathBuf>,
    pub replicates_dir: Option<PathBuf>,
    pub replicates: Option<Vec<u32>>,
}

// Scales one table file, keeping the imputed flags it was read with.
fn scale_table_file(
    scaler: &ZScoreScaler,
    input: &Path,
    output: &Path,
    format: &TableFormat,
) -> Result<(), ImputeError> {
    let parsed = parse_table(open_table_reader(input)?, format, false, Some(input))?;
    let scaled = scaler.transform(&parsed.table).map_err(|e| e.with_path(Some(input)))?;
    write_table(output, &scaled, Some(&parsed.mask), format)?;
    log(LogLevel::Debug, &format!("Centered and scaled {}", input.display()));
    Ok(())
}

/// Fits a z-score scaler on the strain-mean table and writes the scaled
/// mean table next to it. The same column statistics then scale
/// `<corrected_dir>/<strain>.txt` into `centered_scaled_<strain>.txt` and
/// `<replicates_dir>/<strain>_<rep>.txt` into
/// `centered_scaled_<strain>_<rep>.txt`.
pub fn run_center_scale(
    strains: &[String],
    options: &CenterScaleOptions,
    format: &TableFormat,
) -> Result<ZScoreScaler, ImputeError> {
    set_stage(ProcessingStage::CenterScale);
    if options.corrected_dir.is_none() && options.replicates_dir.is_none() {
        return Err(ImputeError::InvalidConfig(
            "center-scale needs --corrected-dir, --replicates-dir or both".to_string(),
        ));
    }
    let means_path = options.means_path.as_path();
    let means = read_labeled_table(means_path, format)?;
    let scaler = ZScoreScaler::fit(&means.table);

    let scaled_means = LabeledTable::new(
        means.label_header.clone(),
        means.labels.clone(),
        scaler.transform(&means.table)?,
    )?;
    let scaled_means_path = means_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("centered_scaled_mean.txt");
    write_labeled_table(&scaled_means_path, &scaled_means, format)?;
    log(LogLevel::Info, &format!("Scaled strain means written to {}", scaled_means_path.display()));

    let mut jobs: Vec<(PathBuf, PathBuf)> = Vec::new();
    if let Some(dir) = &options.corrected_dir {
        jobs.extend(strains.iter().map(|strain| {
            (
                dir.join(format!("{}.txt", strain)),
                dir.join(format!("centered_scaled_{}.txt", strain)),
            )
        }));
    }
    if let Some(dir) = &options.replicates_dir {
        let groups = collect_replicate_groups(strains, dir, "", options.replicates.as_deref())?;
        jobs.extend(groups.into_iter().map(|group| {
            let output = dir.join(format!("centered_scaled_{}_{}.txt", group.strain, group.replicate));
            (group.path, output)
        }));
    }

    let bar = create_item_bar(jobs.len() as u64, "Centering and scaling tables");
    let results: Vec<Result<(), ImputeError>> = jobs
        .par_iter()
        .map(|(input, output)| -> Result<(), ImputeError> {
            scale_table_file(&scaler, input, output, format)?;
            bar.inc(1);
            Ok(())
        })
        .collect();
    bar.finish_with_message("Scaling complete");

    for result in results {
        result?;
    }
    log(LogLevel::Info, &format!("Centered and scaled {} tables", jobs.len()));
    Ok(scaler)
}

/// Dispatches one parsed command line.
pub fn run(args: Args) -> Result<(), ImputeError> {
    let format = TableFormat::from_args(&args.format)?;

    match args.command {
        Command::Impute {
            input,
            output,
            matrix_output,
        } => {
            run_impute_file(&input, &output, matrix_output.as_deref(), &format)?;
        }
        Command::ImputeStrains {
            strains,
            input_dir,
            output_dir,
            input_prefix,
            replicates,
            clean,
            merge,
        } => {
            let strains = parse_strain_names(&strains)?;
            let options = ImputeStrainsOptions {
                input_dir,
                input_prefix,
                output_dir,
                replicates,
                clean,
                merge,
            };
            run_impute_strains(&strains, &options, &format)?;
        }
        Command::MergeReplicates {
            strains,
            dir,
            replicates,
        } => {
            let strains = parse_strain_names(&strains)?;
            run_merge_replicates(&strains, &dir, replicates.as_deref())?;
        }
        Command::MergeExperiments { experiment, output_dir } => {
            let (strains, options) = experiment.into_options(output_dir);
            let strains = parse_strain_names(&strains)?;
            run_merge_experiments(&strains, &options, &format)?;
        }
        Command::GenerateReplicates { experiment, output_dir } => {
            let (strains, options) = experiment.into_options(output_dir);
            let strains = parse_strain_names(&strains)?;
            let groups = run_generate_replicates(&strains, &options, &format)?;
            log(
                LogLevel::Info,
                &format!("Wrote {} replicate tables to {}", groups.len(), options.output_dir.display()),
            );
        }
        Command::StrainStats {
            strains,
            merged_dir,
            output_dir,
        } => {
            let strains = parse_strain_names(&strains)?;
            run_strain_stats(&strains, &merged_dir, &output_dir, &format)?;
        }
        Command::MeanFill {
            strains,
            merged_dir,
            output_dir,
        } => {
            let strains = parse_strain_names(&strains)?;
            run_mean_fill(&strains, &merged_dir, &output_dir, &format)?;
        }
        Command::CenterScale {
            strains,
            means,
            corrected_dir,
            replicates_dir,
            replicates,
        } => {
            let strains = parse_strain_names(&strains)?;
            let options = CenterScaleOptions {
                means_path: means,
                corrected_dir,
                replicates_dir,
                replicates,
            };
            run_center_scale(&strains, &options, &format)?;
        }
    }

    println!("{}", "Done.".green());
    Ok(())
}
