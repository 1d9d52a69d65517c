use std::fmt;
use std::path::PathBuf;

use polars::prelude::PolarsError;
use thiserror::Error;

/// One rejected field of an inbound patient record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIssue {
    pub field: &'static str,
    pub reason: String,
}

/// All field-level problems found while validating a patient record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidRecord {
    pub issues: Vec<FieldIssue>,
}

impl fmt::Display for InvalidRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .issues
            .iter()
            .map(|issue| format!("{}: {}", issue.field, issue.reason))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

impl std::error::Error for InvalidRecord {}

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("missing required column {0:?}")]
    MissingColumn(String),
    #[error("input table has no rows")]
    EmptyTable,
    #[error("column {column:?} has no value at row {row}")]
    MissingCategory { column: String, row: usize },
    #[error("unseen category {value:?} for column {column:?}")]
    UnseenCategory { column: String, value: String },
    #[error("column {0:?} has no observed values, imputation mean is undefined")]
    AllMissing(String),
    #[error("label column {column:?} has an invalid value at row {row}")]
    InvalidLabel { column: String, row: usize },
    #[error("row {row} has {found} values, expected {expected}")]
    Shape { row: usize, expected: usize, found: usize },
    #[error("transform state is inconsistent: {0}")]
    CorruptState(String),
    #[error("invalid record: {0}")]
    InvalidRecord(#[from] InvalidRecord),
    #[error(transparent)]
    Polars(#[from] PolarsError),
}

impl TransformError {
    /// Errors caused by the caller's input rather than by the table layout or the state.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TransformError::MissingCategory { .. }
                | TransformError::UnseenCategory { .. }
                | TransformError::InvalidRecord(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model file not found at {}. Please train the model first.", .path.display())]
    ArtifactMissing { path: PathBuf },
    #[error("model artifact {} could not be read: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("model artifact {} is corrupt: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported artifact format version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("model unavailable: {0}")]
    Unavailable(String),
    #[error("expected {expected} features, got {found}")]
    FeatureCount { expected: usize, found: usize },
    #[error("classifier failed: {0}")]
    Classifier(String),
    #[error(transparent)]
    Transform(#[from] TransformError),
}

impl ModelError {
    /// Configuration errors: the artifact itself cannot back a prediction.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            ModelError::ArtifactMissing { .. }
                | ModelError::Io { .. }
                | ModelError::Corrupt { .. }
                | ModelError::UnsupportedVersion { .. }
                | ModelError::Unavailable(_)
        ) || matches!(self, ModelError::Transform(TransformError::CorruptState(_)))
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("cannot open {}: {source}", .path.display())]
    Input {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write {}: {source}", .path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("training set needs both stroke and non-stroke rows, found {positives} positives and {negatives} negatives")]
    SingleClass { positives: usize, negatives: usize },
    #[error("test size must be in (0, 1), got {0}")]
    TestSize(f64),
    #[error("{0} labelled rows leave nothing to hold out for evaluation")]
    NoTestRows(usize),
    #[error(transparent)]
    Polars(#[from] PolarsError),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Model(#[from] ModelError),
}
