//! Intrastrain replicate imputation for phenomics trait tables.
//!
//! Each replicate group of a strain is a table of per-cell trait
//! measurements with some cells missing. Missing cells are filled with the
//! row's own mean plus a correction drawn from the other rows, weighted by
//! row-to-row Pearson correlation. The surrounding pipeline stages merge
//! experiment exports, summarize strains, correct and z-score the tables.

// Module declarations
pub mod impute;
pub mod parse;
pub mod process;
pub mod progress;
pub mod stats;
pub mod table;

pub use crate::impute::{impute_replicate, mean_fill};
pub use crate::process::{ImputeError, TableFormat};
pub use crate::stats::{compute_correlation_matrix, CorrelationMatrix};
pub use crate::table::{ImputationMask, ImputationReport, ImputedTable, LabeledTable, MeasurementTable, Value};

#[cfg(test)]
mod tests;
