// progress.rs

use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use prettytable::{format, row, Table};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Pipeline stage, used to tag log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStage {
    Global,
    ExperimentMerge,
    StrainStatistics,
    MeanCorrection,
    CenterScale,
    Imputation,
    ReplicateMerge,
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ProcessingStage::Global => "global",
            ProcessingStage::ExperimentMerge => "merge-experiments",
            ProcessingStage::StrainStatistics => "strain-stats",
            ProcessingStage::MeanCorrection => "mean-fill",
            ProcessingStage::CenterScale => "center-scale",
            ProcessingStage::Imputation => "impute",
            ProcessingStage::ReplicateMerge => "merge-replicates",
        };
        write!(f, "{}", name)
    }
}

static CURRENT_STAGE: Lazy<Mutex<ProcessingStage>> =
    Lazy::new(|| Mutex::new(ProcessingStage::Global));

pub fn set_stage(stage: ProcessingStage) {
    *CURRENT_STAGE.lock() = stage;
}

pub fn current_stage() -> ProcessingStage {
    *CURRENT_STAGE.lock()
}

/// Forwards a message to the `log` facade, tagged with the current stage.
pub fn log(level: LogLevel, message: &str) {
    let stage = current_stage();
    match level {
        LogLevel::Debug => ::log::debug!("[{}] {}", stage, message),
        LogLevel::Info => ::log::info!("[{}] {}", stage, message),
        LogLevel::Warning => ::log::warn!("[{}] {}", stage, message),
        LogLevel::Error => ::log::error!("[{}] {}", stage, message),
    }
}

pub fn create_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// Progress bar over a known number of work items (replicate groups, strains).
pub fn create_item_bar(len: u64, message: &str) -> ProgressBar {
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    bar.set_message(message.to_string());
    bar
}

pub struct StatusBox {
    pub title: String,
    pub stats: Vec<(String, String)>,
}

/// Renders a two-column summary table under a colored title.
pub fn display_status_box(status: StatusBox) {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BOX_CHARS);
    for (key, value) in &status.stats {
        table.add_row(row![key, value]);
    }
    println!("\n{}", status.title.green().bold());
    table.printstd();
}
