//! Feature transformer.
//!
//! Turns raw patient tables into the fixed-width matrix the classifier was
//! trained on. Fitting and applying are separate: [`TransformState::fit`]
//! runs once over the training split and the resulting state is reused,
//! unchanged, for every later call to [`TransformState::transform`].

use std::collections::BTreeSet;

use num::Float;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::matrix::DenseMatrix;

use crate::error::TransformError;
use crate::records::{BMI_MISSING_MARKER, CATEGORICAL_COLUMNS, FEATURE_COLUMNS, LABEL_COLUMN};

type Result<T> = std::result::Result<T, TransformError>;

/// Row-major numeric matrix produced by the transformer.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    rows: usize,
    cols: usize,
    values: Vec<f64>,
}

impl FeatureMatrix {
    pub(crate) fn new(rows: usize, cols: usize, values: Vec<f64>) -> Self {
        debug_assert_eq!(rows * cols, values.len());
        Self { rows, cols, values }
    }

    pub fn from_rows(rows: &[Vec<f64>], cols: usize) -> Result<Self> {
        if let Some(bad) = rows.iter().position(|row| row.len() != cols) {
            return Err(TransformError::Shape {
                row: bad,
                expected: cols,
                found: rows[bad].len(),
            });
        }
        let values: Vec<f64> = rows.iter().flat_map(|row| row.iter().copied()).collect();
        Ok(Self::new(rows.len(), cols, values))
    }

    pub fn nrows(&self) -> usize {
        self.rows
    }

    pub fn ncols(&self) -> usize {
        self.cols
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.values[i * self.cols..(i + 1) * self.cols]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        self.values.chunks(self.cols.max(1))
    }

    pub fn select(&self, rows: &[usize], cols: &[usize]) -> FeatureMatrix {
        let mut values = Vec::with_capacity(rows.len() * cols.len());
        for &r in rows {
            let row = self.row(r);
            values.extend(cols.iter().map(|&c| row[c]));
        }
        FeatureMatrix::new(rows.len(), cols.len(), values)
    }

    pub fn to_dense(&self) -> DenseMatrix<f64> {
        DenseMatrix::new(self.rows, self.cols, self.values.clone(), false)
    }
}

/// Label dictionary for one categorical column. Codes are the positions of
/// the distinct training values in lexicographic order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryEncoder {
    column: String,
    classes: Vec<String>,
}

impl CategoryEncoder {
    fn fit(column: &str, values: &[Option<String>]) -> Result<Self> {
        let mut distinct = BTreeSet::new();
        for (row, value) in values.iter().enumerate() {
            let value = value.as_ref().ok_or_else(|| TransformError::MissingCategory {
                column: column.to_string(),
                row,
            })?;
            distinct.insert(value.clone());
        }
        Ok(Self {
            column: column.to_string(),
            classes: distinct.into_iter().collect(),
        })
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// Unseen values are rejected rather than mapped to a fallback code.
    pub fn encode(&self, value: &str) -> Result<f64> {
        self.classes
            .binary_search_by(|class| class.as_str().cmp(value))
            .map(|code| code as f64)
            .map_err(|_| TransformError::UnseenCategory {
                column: self.column.clone(),
                value: value.to_string(),
            })
    }

    fn check(&self) -> Result<()> {
        if self.classes.is_empty() {
            return Err(TransformError::CorruptState(format!(
                "encoder for {:?} has no classes",
                self.column
            )));
        }
        if self.classes.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(TransformError::CorruptState(format!(
                "encoder for {:?} is not strictly sorted",
                self.column
            )));
        }
        Ok(())
    }
}

/// Per-column standardization parameters, captured at fit time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    means: Vec<f64>,
    scales: Vec<f64>,
}

impl StandardScaler {
    fn fit(columns: &[Vec<f64>]) -> Self {
        let mut means = Vec::with_capacity(columns.len());
        let mut scales = Vec::with_capacity(columns.len());
        for column in columns {
            let (mean, std) = mean_std(column);
            means.push(mean);
            // constant column: leave centred values unscaled
            scales.push(if std > 0.0 { std } else { 1.0 });
        }
        Self { means, scales }
    }

    pub fn means(&self) -> &[f64] {
        &self.means
    }

    pub fn scales(&self) -> &[f64] {
        &self.scales
    }

    fn scale(&self, col: usize, value: f64) -> f64 {
        (value - self.means[col]) / self.scales[col]
    }
}

/// Frozen encoders, imputation means and scaler for the feature columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformState {
    columns: Vec<String>,
    encoders: Vec<CategoryEncoder>,
    impute_means: Vec<f64>,
    scaler: StandardScaler,
}

impl TransformState {
    /// Fits encoders, imputation means and scaler on a training table.
    /// `id` and `stroke` columns are ignored if present.
    pub fn fit(df: &DataFrame) -> Result<Self> {
        Self::fit_with_categories(df, df)
    }

    /// Like [`TransformState::fit`], but the category dictionaries are read
    /// from `categories`. Imputation means and the scaler still come from `df`
    /// only, so a held-out split contributes its category values and none of
    /// its statistics.
    pub fn fit_with_categories(df: &DataFrame, categories: &DataFrame) -> Result<Self> {
        ensure_rows(df)?;
        ensure_rows(categories)?;

        let encoders = CATEGORICAL_COLUMNS
            .iter()
            .map(|&column| CategoryEncoder::fit(column, &text_values(categories, column)?))
            .collect::<Result<Vec<_>>>()?;

        let raw = encode_columns(df, &encoders)?;

        let impute_means = raw
            .iter()
            .zip(FEATURE_COLUMNS)
            .map(|(values, column)| {
                observed_mean(values).ok_or_else(|| TransformError::AllMissing(column.to_string()))
            })
            .collect::<Result<Vec<f64>>>()?;

        let imputed: Vec<Vec<f64>> = raw
            .iter()
            .zip(&impute_means)
            .map(|(values, &mean)| impute(values, mean))
            .collect();
        let scaler = StandardScaler::fit(&imputed);

        log::debug!(
            "fitted transform on {} rows, imputation means {:?}",
            df.height(),
            impute_means
        );

        Ok(Self {
            columns: FEATURE_COLUMNS.iter().map(|c| c.to_string()).collect(),
            encoders,
            impute_means,
            scaler,
        })
    }

    /// Training entry point: fits the state and returns it together with the
    /// transformed training matrix and the labels.
    pub fn fit_transform(df: &DataFrame) -> Result<(Self, FeatureMatrix, Vec<i32>)> {
        let labels = labels(df)?;
        let state = Self::fit(df)?;
        let matrix = state.transform(df)?;
        Ok((state, matrix, labels))
    }

    /// Inference entry point: applies the frozen state to a table with no
    /// label. Any `id` or `stroke` column is ignored.
    pub fn transform(&self, df: &DataFrame) -> Result<FeatureMatrix> {
        ensure_rows(df)?;
        let raw = encode_columns(df, &self.encoders)?;

        let rows = df.height();
        let cols = self.columns.len();
        let mut values = vec![0.0; rows * cols];
        for (col, column) in raw.iter().enumerate() {
            let fill = self.impute_means[col];
            for (row, value) in column.iter().enumerate() {
                values[row * cols + col] = self.scaler.scale(col, value.unwrap_or(fill));
            }
        }
        Ok(FeatureMatrix::new(rows, cols, values))
    }

    pub fn feature_names(&self) -> &[String] {
        &self.columns
    }

    pub fn n_features(&self) -> usize {
        self.columns.len()
    }

    pub fn encoder(&self, column: &str) -> Option<&CategoryEncoder> {
        self.encoders.iter().find(|e| e.column == column)
    }

    pub fn impute_mean(&self, column: &str) -> Option<f64> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| self.impute_means[i])
    }

    pub fn scaler(&self) -> &StandardScaler {
        &self.scaler
    }

    pub fn check(&self) -> Result<()> {
        if self.columns.iter().map(String::as_str).ne(FEATURE_COLUMNS.iter().copied()) {
            return Err(TransformError::CorruptState(format!(
                "feature columns {:?} do not match {:?}",
                self.columns, FEATURE_COLUMNS
            )));
        }
        if self.encoders.iter().map(|e| e.column.as_str()).ne(CATEGORICAL_COLUMNS.iter().copied()) {
            return Err(TransformError::CorruptState(
                "categorical encoders do not match the categorical columns".to_string(),
            ));
        }
        for encoder in &self.encoders {
            encoder.check()?;
        }
        let n = self.columns.len();
        if self.impute_means.len() != n || self.scaler.means.len() != n || self.scaler.scales.len() != n {
            return Err(TransformError::CorruptState(
                "imputation or scaling parameters have the wrong width".to_string(),
            ));
        }
        let finite = |v: &f64| v.is_finite();
        if !self.impute_means.iter().all(finite)
            || !self.scaler.means.iter().all(finite)
            || !self.scaler.scales.iter().all(|s| s.is_finite() && *s > 0.0)
        {
            return Err(TransformError::CorruptState(
                "imputation or scaling parameters are not finite".to_string(),
            ));
        }
        Ok(())
    }
}

fn ensure_rows(df: &DataFrame) -> Result<()> {
    if df.height() == 0 {
        return Err(TransformError::EmptyTable);
    }
    Ok(())
}

fn column<'a>(df: &'a DataFrame, name: &str) -> Result<&'a Series> {
    df.column(name)
        .map_err(|_| TransformError::MissingColumn(name.to_string()))
}

/// Numeric view of every feature column, categorical ones encoded, in
/// feature order. `None` marks a missing value.
fn encode_columns(df: &DataFrame, encoders: &[CategoryEncoder]) -> Result<Vec<Vec<Option<f64>>>> {
    FEATURE_COLUMNS
        .iter()
        .map(|&name| match encoders.iter().find(|e| e.column == name) {
            Some(encoder) => text_values(df, name)?
                .into_iter()
                .enumerate()
                .map(|(row, value)| match value {
                    Some(value) => encoder.encode(&value).map(Some),
                    None => Err(TransformError::MissingCategory {
                        column: name.to_string(),
                        row,
                    }),
                })
                .collect(),
            None => numeric_values(df, name),
        })
        .collect()
}

fn text_values(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>> {
    let series = column(df, name)?.cast(&DataType::Utf8)?;
    Ok(series
        .utf8()?
        .into_iter()
        .map(|value| value.map(str::to_string))
        .collect())
}

/// Coerces a column to numbers. Text is parsed, with the missing marker and
/// unparseable tokens becoming `None`; NaN counts as missing too.
fn numeric_values(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>> {
    let series = column(df, name)?;
    let values: Vec<Option<f64>> = match series.dtype() {
        DataType::Utf8 => series
            .utf8()?
            .into_iter()
            .map(|value| value.and_then(parse_numeric))
            .collect(),
        _ => series.cast(&DataType::Float64)?.f64()?.into_iter().collect(),
    };
    Ok(values
        .into_iter()
        .map(|value| value.filter(|v| v.is_finite()))
        .collect())
}

fn parse_numeric(token: &str) -> Option<f64> {
    let token = token.trim();
    if token.is_empty() || token == BMI_MISSING_MARKER {
        return None;
    }
    token.parse::<f64>().ok()
}

pub fn labels(df: &DataFrame) -> Result<Vec<i32>> {
    numeric_values(df, LABEL_COLUMN)?
        .into_iter()
        .enumerate()
        .map(|(row, value)| match value {
            Some(v) if v == 0.0 => Ok(0),
            Some(v) if v == 1.0 => Ok(1),
            _ => Err(TransformError::InvalidLabel {
                column: LABEL_COLUMN.to_string(),
                row,
            }),
        })
        .collect()
}

fn observed_mean<T: Float>(values: &[Option<T>]) -> Option<T> {
    let mut sum = T::zero();
    let mut count = T::zero();
    for value in values.iter().flatten() {
        sum = sum + *value;
        count = count + T::one();
    }
    if count > T::zero() {
        Some(sum / count)
    } else {
        None
    }
}

/// Mean and population standard deviation.
fn mean_std<T: Float>(values: &[T]) -> (T, T) {
    let n = T::from(values.len()).unwrap_or_else(T::one);
    let mean = values.iter().fold(T::zero(), |acc, v| acc + *v) / n;
    let var = values
        .iter()
        .fold(T::zero(), |acc, v| acc + (*v - mean) * (*v - mean))
        / n;
    (mean, var.sqrt())
}

fn impute(values: &[Option<f64>], fill: f64) -> Vec<f64> {
    values.iter().map(|v| v.unwrap_or(fill)).collect()
}
