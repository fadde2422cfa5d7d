//! Data loading, cleaning and label splitting using Polars

use crate::error::ChurnError;
use crate::preprocess::category_values;
use ndarray::Array1;
use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use tracing::{debug, info, warn};

/// What the cleaner does with rows that still hold a missing value after coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingPolicy {
    /// Remove every row containing a null.
    #[default]
    DropRows,
    /// Keep the rows; the fitted transformation imputes the gaps.
    Keep,
}

/// Cleaning options.
#[derive(Debug, Clone)]
pub struct CleanConfig {
    /// Per-row key columns that never enter the feature set (matched case-insensitively).
    pub id_columns: Vec<String>,
    /// Text columns that must be coerced to numbers even if some values do not parse.
    pub numeric_columns: Vec<String>,
    /// Also coerce any text column whose non-blank values all parse as numbers.
    pub detect_numeric_text: bool,
    pub missing: MissingPolicy,
}

impl Default for CleanConfig {
    fn default() -> Self {
        Self {
            id_columns: vec!["customerID".to_string()],
            numeric_columns: vec!["TotalCharges".to_string()],
            detect_numeric_text: true,
            missing: MissingPolicy::DropRows,
        }
    }
}

/// How label tokens outside the positive vocabulary are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LabelPolicy {
    /// Anything not recognized as positive is 0.
    #[default]
    Lenient,
    /// Only recognized yes/no tokens are accepted; anything else is an error.
    Strict,
}

const POSITIVE_LABELS: [&str; 4] = ["yes", "y", "true", "1"];
const NEGATIVE_LABELS: [&str; 4] = ["no", "n", "false", "0"];

/// Read a CSV file with a header row into a DataFrame.
///
/// The schema is inferred from every row so that a stray blank deep in a
/// numeric column turns it into text instead of failing the read.
pub fn read_table(file_path: impl AsRef<Path>) -> crate::Result<DataFrame> {
    let path = file_path.as_ref();
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(None)
        .try_into_reader_with_file_path(Some(path.to_path_buf()))
        .map_err(|e| anyhow::anyhow!("Cannot open {}: {}", path.display(), e))?
        .finish()
        .map_err(|e| anyhow::anyhow!("Cannot read CSV {}: {}", path.display(), e))?;

    info!(path = %path.display(), rows = df.height(), columns = df.width(), "loaded table");
    Ok(df)
}

/// Write a DataFrame to CSV with a header row.
pub fn write_table(df: &DataFrame, file_path: impl AsRef<Path>) -> crate::Result<()> {
    let path = file_path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    let mut out = df.clone();
    CsvWriter::new(&mut file)
        .include_header(true)
        .finish(&mut out)?;
    info!(path = %path.display(), rows = df.height(), "wrote table");
    Ok(())
}

/// Drop identifier columns, coerce numeric text, and apply the missing-value policy.
///
/// Returns a new frame; the input is left untouched.
pub fn clean(df: &DataFrame, config: &CleanConfig) -> crate::Result<DataFrame> {
    let mut cleaned = df.clone();

    for name in column_names(df) {
        if config
            .id_columns
            .iter()
            .any(|id| id.eq_ignore_ascii_case(&name))
        {
            cleaned = cleaned.drop(&name)?;
            debug!(column = %name, "dropped identifier column");
        }
    }

    for name in column_names(&cleaned) {
        let series = cleaned.column(&name)?.as_materialized_series();
        if series.dtype() != &DataType::String {
            continue;
        }
        let forced = config.numeric_columns.iter().any(|c| c == &name);
        if !forced && !(config.detect_numeric_text && is_numeric_text(series)?) {
            continue;
        }
        let coerced = coerce_numeric(series)?;
        let lost = coerced.null_count() - series.null_count();
        if lost > 0 {
            warn!(column = %name, values = lost, "unparseable numeric values set to missing");
        }
        cleaned.with_column(coerced)?;
    }

    if config.missing == MissingPolicy::DropRows {
        let before = cleaned.height();
        cleaned = drop_incomplete_rows(&cleaned)?;
        let dropped = before - cleaned.height();
        if dropped > 0 {
            info!(dropped, remaining = cleaned.height(), "dropped rows with missing values");
        }
    }

    Ok(cleaned)
}

/// Separate the label column and map it to 1 (churn) / 0 (stay).
pub fn split_features(
    df: &DataFrame,
    target_column: &str,
    policy: LabelPolicy,
) -> crate::Result<(DataFrame, Array1<usize>)> {
    if !column_names(df).iter().any(|c| c == target_column) {
        return Err(ChurnError::MissingTarget(target_column.to_string()).into());
    }

    // Whole floats render as integers, so a coerced "1" still reads as "1".
    let tokens = category_values(df.column(target_column)?.as_materialized_series())?;
    let labels = tokens
        .iter()
        .map(|token| normalize_label(token.as_deref(), policy))
        .collect::<Result<Vec<usize>, ChurnError>>()?;

    let features = df.drop(target_column)?;
    Ok((features, Array1::from(labels)))
}

/// Closed yes/no classification of one label token.
pub fn normalize_label(token: Option<&str>, policy: LabelPolicy) -> Result<usize, ChurnError> {
    let normalized = token.map(|t| t.trim().to_lowercase()).unwrap_or_default();
    if POSITIVE_LABELS.contains(&normalized.as_str()) {
        return Ok(1);
    }
    match policy {
        LabelPolicy::Lenient => Ok(0),
        LabelPolicy::Strict if NEGATIVE_LABELS.contains(&normalized.as_str()) => Ok(0),
        LabelPolicy::Strict => Err(ChurnError::UnrecognizedLabel(
            token.unwrap_or_default().to_string(),
        )),
    }
}

/// Share of each class in the label column, as `(stay, churn)` percentages.
pub fn churn_distribution(labels: &Array1<usize>) -> (f64, f64) {
    if labels.is_empty() {
        return (0.0, 0.0);
    }
    let churn = labels.iter().filter(|&&l| l == 1).count() as f64 / labels.len() as f64 * 100.0;
    (100.0 - churn, churn)
}

pub(crate) fn column_names(df: &DataFrame) -> Vec<String> {
    df.get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect()
}

/// True when the column has at least one non-blank value and every non-blank value parses.
fn is_numeric_text(series: &Series) -> crate::Result<bool> {
    let mut seen = false;
    for value in series.str()?.into_iter().flatten() {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.parse::<f64>().is_err() {
            return Ok(false);
        }
        seen = true;
    }
    Ok(seen)
}

fn coerce_numeric(series: &Series) -> crate::Result<Series> {
    let values: Vec<Option<f64>> = series
        .str()?
        .into_iter()
        .map(|v| v.and_then(|s| s.trim().parse::<f64>().ok()))
        .collect();
    Ok(Series::new(series.name().clone(), values))
}

fn drop_incomplete_rows(df: &DataFrame) -> crate::Result<DataFrame> {
    let mut mask = BooleanChunked::full("mask".into(), true, df.height());
    for column in df.get_columns() {
        let present = column.as_materialized_series().is_not_null();
        mask = &mask & &present;
    }
    Ok(df.filter(&mask)?)
}
