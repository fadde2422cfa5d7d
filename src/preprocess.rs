//! Type-aware feature preparation.
//!
//! [`build_preprocessor`] inspects a feature table and decides which columns are
//! numeric and which categorical. [`Preprocessor::fit`] learns per-column
//! statistics from training rows only and yields a [`FittedTransformation`],
//! which maps any conforming input to the same fixed-width vector:
//!
//! * numeric block first, one slot per numeric column in discovery order,
//!   median-imputed then standardized;
//! * categorical indicator blocks next, one block per categorical column in
//!   discovery order, one slot per category in first-seen order.
//!
//! A category that was never seen during fitting yields an all-zero block.

use crate::data::column_names;
use crate::error::ChurnError;
use crate::record::CustomerRecord;
use ndarray::{Array1, Array2, ArrayViewMut1};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Placeholder category used for missing categorical values.
pub const MISSING_CATEGORY: &str = "missing";

/// Semantic type of a feature column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Numeric,
    Categorical,
}

/// Decides the semantic kind of a column from its storage type.
pub trait KindRule {
    /// `None` excludes the column from the feature set.
    fn classify(&self, dtype: &DataType) -> Option<ColumnKind>;
}

/// Integer and floating columns are numeric; text and boolean columns are categorical.
#[derive(Debug, Clone, Copy, Default)]
pub struct DtypeRule;

impl KindRule for DtypeRule {
    fn classify(&self, dtype: &DataType) -> Option<ColumnKind> {
        match dtype {
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64 => Some(ColumnKind::Numeric),
            DataType::String | DataType::Boolean => Some(ColumnKind::Categorical),
            _ => None,
        }
    }
}

/// Unfitted transformation: the column partition only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preprocessor {
    numeric: Vec<String>,
    categorical: Vec<String>,
}

/// Build a preprocessor from the column types of `features` using [`DtypeRule`].
pub fn build_preprocessor(features: &DataFrame) -> Preprocessor {
    build_preprocessor_with(features, &DtypeRule)
}

/// Build a preprocessor with a custom kind rule.
pub fn build_preprocessor_with(features: &DataFrame, rule: &dyn KindRule) -> Preprocessor {
    let mut numeric = Vec::new();
    let mut categorical = Vec::new();

    for column in features.get_columns() {
        let name = column.name().to_string();
        match rule.classify(column.dtype()) {
            Some(ColumnKind::Numeric) => numeric.push(name),
            Some(ColumnKind::Categorical) => categorical.push(name),
            None => warn!(column = %name, dtype = %column.dtype(), "column type not supported, skipped"),
        }
    }

    debug!(numeric = ?numeric, categorical = ?categorical, "partitioned feature columns");
    Preprocessor {
        numeric,
        categorical,
    }
}

impl Preprocessor {
    pub fn numeric_columns(&self) -> &[String] {
        &self.numeric
    }

    pub fn categorical_columns(&self) -> &[String] {
        &self.categorical
    }

    /// Pull the raw values of every partitioned column out of `df`.
    pub fn extract(&self, df: &DataFrame) -> crate::Result<RawFeatures> {
        let present = column_names(df);
        let missing: Vec<String> = self
            .numeric
            .iter()
            .chain(self.categorical.iter())
            .filter(|c| !present.contains(c))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ChurnError::MissingColumns(missing).into());
        }

        let numeric = self
            .numeric
            .iter()
            .map(|name| numeric_values(name, df.column(name)?.as_materialized_series()))
            .collect::<crate::Result<Vec<_>>>()?;
        let categorical = self
            .categorical
            .iter()
            .map(|name| category_values(df.column(name)?.as_materialized_series()))
            .collect::<crate::Result<Vec<_>>>()?;

        Ok(RawFeatures {
            numeric,
            categorical,
            n_rows: df.height(),
        })
    }

    /// Learn imputation, scaling and vocabulary from `raw`.
    pub fn fit(&self, raw: &RawFeatures) -> crate::Result<FittedTransformation> {
        if raw.n_rows == 0 {
            return Err(ChurnError::InsufficientData {
                what: "rows to fit the transformation",
                required: 1,
                actual: 0,
            }
            .into());
        }

        let numeric = self
            .numeric
            .iter()
            .zip(&raw.numeric)
            .map(|(name, values)| NumericEncoder::fit(name, values))
            .collect();
        let categorical = self
            .categorical
            .iter()
            .zip(&raw.categorical)
            .map(|(name, values)| CategoryEncoder::fit(name, values))
            .collect();

        Ok(FittedTransformation {
            numeric,
            categorical,
        })
    }
}

/// Column-major raw feature values, split by kind.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFeatures {
    numeric: Vec<Vec<Option<f64>>>,
    categorical: Vec<Vec<Option<String>>>,
    n_rows: usize,
}

impl RawFeatures {
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Subset of rows, in the order given.
    pub fn select(&self, rows: &[usize]) -> RawFeatures {
        RawFeatures {
            numeric: self
                .numeric
                .iter()
                .map(|col| rows.iter().map(|&r| col[r]).collect())
                .collect(),
            categorical: self
                .categorical
                .iter()
                .map(|col| rows.iter().map(|&r| col[r].clone()).collect())
                .collect(),
            n_rows: rows.len(),
        }
    }
}

/// Median imputation followed by standardization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericEncoder {
    pub name: String,
    pub median: f64,
    pub mean: f64,
    pub scale: f64,
}

impl NumericEncoder {
    fn fit(name: &str, values: &[Option<f64>]) -> Self {
        let mut present: Vec<f64> = values.iter().flatten().copied().collect();
        let median = median(&mut present);
        let imputed: Vec<f64> = values.iter().map(|v| v.unwrap_or(median)).collect();

        let n = imputed.len() as f64;
        let mean = imputed.iter().sum::<f64>() / n;
        let variance = imputed.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let std = variance.sqrt();
        // Constant columns pass through centred but unscaled.
        let scale = if std > f64::EPSILON { std } else { 1.0 };

        Self {
            name: name.to_string(),
            median,
            mean,
            scale,
        }
    }

    pub fn encode(&self, value: Option<f64>) -> f64 {
        let v = value.filter(|v| v.is_finite()).unwrap_or(self.median);
        (v - self.mean) / self.scale
    }
}

/// Constant-placeholder imputation followed by one-hot expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryEncoder {
    pub name: String,
    /// Vocabulary in first-seen order.
    pub categories: Vec<String>,
}

impl CategoryEncoder {
    fn fit(name: &str, values: &[Option<String>]) -> Self {
        let mut categories: Vec<String> = Vec::new();
        for value in values {
            let category = value.as_deref().unwrap_or(MISSING_CATEGORY);
            if !categories.iter().any(|c| c == category) {
                categories.push(category.to_string());
            }
        }
        Self {
            name: name.to_string(),
            categories,
        }
    }

    pub fn width(&self) -> usize {
        self.categories.len()
    }

    /// Write the indicator block for `value` into `out`, which must be zeroed.
    pub fn encode_into(&self, value: Option<&str>, mut out: ArrayViewMut1<f64>) {
        let category = value.unwrap_or(MISSING_CATEGORY);
        if let Some(idx) = self.categories.iter().position(|c| c == category) {
            out[idx] = 1.0;
        }
    }
}

/// Fitted, deterministic mapping from raw inputs to model features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedTransformation {
    numeric: Vec<NumericEncoder>,
    categorical: Vec<CategoryEncoder>,
}

impl FittedTransformation {
    /// Width of the produced feature vector.
    pub fn n_features(&self) -> usize {
        self.numeric.len() + self.categorical.iter().map(CategoryEncoder::width).sum::<usize>()
    }

    /// Raw input columns this transformation consumes, numeric first.
    pub fn input_columns(&self) -> Vec<String> {
        self.numeric
            .iter()
            .map(|e| e.name.clone())
            .chain(self.categorical.iter().map(|e| e.name.clone()))
            .collect()
    }

    pub fn column_kind(&self, name: &str) -> Option<ColumnKind> {
        if self.numeric.iter().any(|e| e.name == name) {
            Some(ColumnKind::Numeric)
        } else if self.categorical.iter().any(|e| e.name == name) {
            Some(ColumnKind::Categorical)
        } else {
            None
        }
    }

    /// Output feature names: numeric names, then `column=category` indicators.
    pub fn feature_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.numeric.iter().map(|e| e.name.clone()).collect();
        for encoder in &self.categorical {
            for category in &encoder.categories {
                names.push(format!("{}={}", encoder.name, category));
            }
        }
        names
    }

    pub fn numeric_encoders(&self) -> &[NumericEncoder] {
        &self.numeric
    }

    pub fn category_encoders(&self) -> &[CategoryEncoder] {
        &self.categorical
    }

    /// The unfitted partition this transformation was learned from.
    pub fn preprocessor(&self) -> Preprocessor {
        Preprocessor {
            numeric: self.numeric.iter().map(|e| e.name.clone()).collect(),
            categorical: self.categorical.iter().map(|e| e.name.clone()).collect(),
        }
    }

    /// Extract and transform a whole table.
    pub fn transform_frame(&self, df: &DataFrame) -> crate::Result<Array2<f64>> {
        let raw = self.preprocessor().extract(df)?;
        self.transform(&raw)
    }

    /// Transform extracted raw features, one output row per input row.
    pub fn transform(&self, raw: &RawFeatures) -> crate::Result<Array2<f64>> {
        if raw.numeric.len() != self.numeric.len() || raw.categorical.len() != self.categorical.len() {
            return Err(ChurnError::invalid(
                "raw features",
                format!(
                    "expected {} numeric and {} categorical columns, got {} and {}",
                    self.numeric.len(),
                    self.categorical.len(),
                    raw.numeric.len(),
                    raw.categorical.len()
                ),
            )
            .into());
        }

        let mut out = Array2::zeros((raw.n_rows, self.n_features()));
        let mut numeric_row = vec![None; self.numeric.len()];
        let mut category_row: Vec<Option<&str>> = vec![None; self.categorical.len()];
        for (i, mut row) in out.outer_iter_mut().enumerate() {
            for (slot, col) in numeric_row.iter_mut().zip(&raw.numeric) {
                *slot = col[i];
            }
            for (slot, col) in category_row.iter_mut().zip(&raw.categorical) {
                *slot = col[i].as_deref();
            }
            self.encode_row(&numeric_row, &category_row, row.view_mut());
        }
        Ok(out)
    }

    /// Transform one customer record. Missing and unexpected fields are errors.
    pub fn transform_record(&self, record: &CustomerRecord) -> crate::Result<Array1<f64>> {
        let missing: Vec<String> = self
            .input_columns()
            .into_iter()
            .filter(|c| !record.contains(c))
            .collect();
        if !missing.is_empty() {
            return Err(ChurnError::MissingColumns(missing).into());
        }
        let unexpected: Vec<String> = record
            .field_names()
            .filter(|f| self.column_kind(f).is_none())
            .map(str::to_string)
            .collect();
        if !unexpected.is_empty() {
            return Err(ChurnError::UnexpectedFields(unexpected).into());
        }

        let numeric = self
            .numeric
            .iter()
            .map(|e| match record.get(&e.name) {
                Some(v) => v.try_number().map_err(|value| ChurnError::NonNumericValue {
                    column: e.name.clone(),
                    value,
                }),
                None => Ok(None),
            })
            .collect::<Result<Vec<Option<f64>>, ChurnError>>()?;
        let categories: Vec<Option<String>> = self
            .categorical
            .iter()
            .map(|e| record.get(&e.name).and_then(|v| v.as_category()))
            .collect();
        let category_refs: Vec<Option<&str>> = categories.iter().map(|c| c.as_deref()).collect();

        let mut out = Array1::zeros(self.n_features());
        self.encode_row(&numeric, &category_refs, out.view_mut());
        Ok(out)
    }

    /// Shared row encoder behind both table and record paths.
    fn encode_row(
        &self,
        numeric: &[Option<f64>],
        categorical: &[Option<&str>],
        mut out: ArrayViewMut1<f64>,
    ) {
        for (idx, (encoder, value)) in self.numeric.iter().zip(numeric).enumerate() {
            out[idx] = encoder.encode(*value);
        }
        let mut offset = self.numeric.len();
        for (encoder, value) in self.categorical.iter().zip(categorical) {
            let width = encoder.width();
            encoder.encode_into(*value, out.slice_mut(ndarray::s![offset..offset + width]));
            offset += width;
        }
    }
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Numeric values of a column. Text is parsed; blanks are missing and
/// anything else that does not parse is a `NonNumericValue` error.
fn numeric_values(name: &str, series: &Series) -> crate::Result<Vec<Option<f64>>> {
    if series.dtype() == &DataType::String {
        return series
            .str()?
            .into_iter()
            .map(|v| match v.map(str::trim) {
                None | Some("") => Ok(None),
                Some(s) => s.parse::<f64>().map(Some).map_err(|_| {
                    anyhow::Error::from(ChurnError::NonNumericValue {
                        column: name.to_string(),
                        value: s.to_string(),
                    })
                }),
            })
            .collect();
    }
    let cast = series.cast(&DataType::Float64)?;
    Ok(cast
        .f64()?
        .into_iter()
        .map(|v| v.filter(|x| x.is_finite()))
        .collect())
}

/// Text values of a column; numbers and booleans are rendered as strings.
pub(crate) fn category_values(series: &Series) -> crate::Result<Vec<Option<String>>> {
    let cast = match series.dtype() {
        DataType::Float32 | DataType::Float64 => {
            // Render whole floats like integers so 1.0 matches a trained "1".
            let floats = series.cast(&DataType::Float64)?;
            return Ok(floats
                .f64()?
                .into_iter()
                .map(|v| {
                    v.map(|x| {
                        if x.fract() == 0.0 {
                            format!("{}", x as i64)
                        } else {
                            x.to_string()
                        }
                    })
                })
                .collect());
        }
        _ => series.cast(&DataType::String)?,
    };
    Ok(cast
        .str()?
        .into_iter()
        .map(|v| v.map(str::to_owned))
        .collect())
}
