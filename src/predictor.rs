//! Risk predictor and the artifact it is loaded from.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, TransformError};
use crate::forest::{label_for, StrokeForest};
use crate::records::PatientRecord;
use crate::transform::{FeatureMatrix, TransformState};

pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskBand {
    Low,
    Moderate,
    High,
}

impl RiskBand {
    pub fn from_probability(probability: f64) -> Self {
        if probability < 0.3 {
            RiskBand::Low
        } else if probability < 0.6 {
            RiskBand::Moderate
        } else {
            RiskBand::High
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskBand::Low => "Low",
            RiskBand::Moderate => "Moderate",
            RiskBand::High => "High",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            RiskBand::Low => "Low risk of stroke based on the provided data.",
            RiskBand::Moderate => {
                "Moderate risk of stroke. Consider lifestyle changes and regular check-ups."
            }
            RiskBand::High => "High risk of stroke. Please consult with a healthcare professional.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: i32,
    pub probability: f64,
    pub band: RiskBand,
}

impl Prediction {
    pub fn from_probability(probability: f64) -> Self {
        Self {
            label: label_for(probability),
            probability,
            band: RiskBand::from_probability(probability),
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct Artifact {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub feature_names: Vec<String>,
    pub transform: TransformState,
    pub classifier: StrokeForest,
}

impl Artifact {
    pub fn new(transform: TransformState, classifier: StrokeForest) -> Self {
        Self {
            format_version: ARTIFACT_FORMAT_VERSION,
            created_at: Utc::now(),
            feature_names: transform.feature_names().to_vec(),
            transform,
            classifier,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let io_error = |source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(io_error)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, self).map_err(|source| ModelError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
        writer.flush().map_err(io_error)
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let file = File::open(path).map_err(|source| match source.kind() {
            ErrorKind::NotFound => ModelError::ArtifactMissing {
                path: path.to_path_buf(),
            },
            _ => ModelError::Io {
                path: path.to_path_buf(),
                source,
            },
        })?;
        let artifact: Artifact =
            serde_json::from_reader(BufReader::new(file)).map_err(|source| ModelError::Corrupt {
                path: path.to_path_buf(),
                source,
            })?;
        artifact.check()?;
        Ok(artifact)
    }

    fn check(&self) -> Result<(), ModelError> {
        if self.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(ModelError::UnsupportedVersion {
                found: self.format_version,
                expected: ARTIFACT_FORMAT_VERSION,
            });
        }
        self.transform.check()?;
        if self.feature_names != self.transform.feature_names() {
            return Err(TransformError::CorruptState(
                "artifact feature names differ from the transform columns".to_string(),
            )
            .into());
        }
        if self.classifier.n_features() != self.transform.n_features() {
            return Err(ModelError::FeatureCount {
                expected: self.transform.n_features(),
                found: self.classifier.n_features(),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct RiskPredictor {
    transform: TransformState,
    classifier: StrokeForest,
}

impl RiskPredictor {
    pub fn new(transform: TransformState, classifier: StrokeForest) -> Self {
        Self {
            transform,
            classifier,
        }
    }

    pub fn from_artifact(artifact: Artifact) -> Self {
        Self::new(artifact.transform, artifact.classifier)
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        Artifact::load(path).map(Self::from_artifact)
    }

    pub fn into_artifact(self) -> Artifact {
        Artifact::new(self.transform, self.classifier)
    }

    pub fn transform(&self) -> &TransformState {
        &self.transform
    }

    pub fn predict_row(&self, features: &[f64]) -> Result<Prediction, ModelError> {
        let x = FeatureMatrix::new(1, features.len(), features.to_vec());
        let probability = self.classifier.predict_proba(&x)?[0];
        Ok(Prediction::from_probability(probability))
    }

    /// Validates, transforms and scores a single patient record.
    pub fn predict(&self, record: &PatientRecord) -> Result<Prediction, ModelError> {
        record.validate().map_err(TransformError::from)?;
        let df = PatientRecord::to_frame(std::slice::from_ref(record)).map_err(TransformError::from)?;
        let x = self.transform.transform(&df)?;
        self.predict_row(x.row(0))
    }
}

pub trait RiskService: Send + Sync {
    fn assess(&self, record: &PatientRecord) -> Result<Prediction, ModelError>;
}

impl RiskService for RiskPredictor {
    fn assess(&self, record: &PatientRecord) -> Result<Prediction, ModelError> {
        self.predict(record)
    }
}

/// Process-wide predictor slot. The artifact is read once; a failed load is
/// remembered and reported to every caller until a reload succeeds.
pub struct ModelStore {
    path: PathBuf,
    slot: RwLock<Result<Arc<RiskPredictor>, String>>,
}

impl ModelStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let slot = match RiskPredictor::load(&path) {
            Ok(predictor) => {
                log::info!("loaded model artifact from {}", path.display());
                Ok(Arc::new(predictor))
            }
            Err(e) => {
                log::error!("model unavailable: {}", e);
                Err(e.to_string())
            }
        };
        Self {
            path,
            slot: RwLock::new(slot),
        }
    }

    pub fn with_predictor(path: impl Into<PathBuf>, predictor: RiskPredictor) -> Self {
        Self {
            path: path.into(),
            slot: RwLock::new(Ok(Arc::new(predictor))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> Result<Arc<RiskPredictor>, ModelError> {
        self.slot.read().clone().map_err(ModelError::Unavailable)
    }

    /// Loads the artifact again and swaps it in whole. On failure a
    /// previously loaded predictor stays in place.
    pub fn reload(&self) -> Result<(), ModelError> {
        match RiskPredictor::load(&self.path) {
            Ok(predictor) => {
                *self.slot.write() = Ok(Arc::new(predictor));
                log::info!("reloaded model artifact from {}", self.path.display());
                Ok(())
            }
            Err(e) => {
                let mut slot = self.slot.write();
                if slot.is_err() {
                    *slot = Err(e.to_string());
                }
                log::warn!("model reload failed: {}", e);
                Err(e)
            }
        }
    }
}

impl RiskService for ModelStore {
    fn assess(&self, record: &PatientRecord) -> Result<Prediction, ModelError> {
        let predictor = self.current()?;
        predictor.predict(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::ForestParams;
    use polars::prelude::*;

    #[test]
    fn band_boundaries() {
        assert_eq!(RiskBand::from_probability(0.0), RiskBand::Low);
        assert_eq!(RiskBand::from_probability(0.2999), RiskBand::Low);
        assert_eq!(RiskBand::from_probability(0.30), RiskBand::Moderate);
        assert_eq!(RiskBand::from_probability(0.5999), RiskBand::Moderate);
        assert_eq!(RiskBand::from_probability(0.60), RiskBand::High);
        assert_eq!(RiskBand::from_probability(1.0), RiskBand::High);
    }

    #[test]
    fn band_messages_are_fixed() {
        assert_eq!(
            RiskBand::Moderate.message(),
            "Moderate risk of stroke. Consider lifestyle changes and regular check-ups."
        );
        assert_eq!(serde_json::to_string(&RiskBand::High).unwrap(), "\"High\"");
    }

    fn predictor() -> RiskPredictor {
        let df = df!(
            "gender" => &["Male", "Female", "Male", "Female", "Male", "Female"],
            "age" => &[80.0, 75.0, 70.0, 20.0, 25.0, 30.0],
            "hypertension" => &[1, 1, 0, 0, 0, 0],
            "heart_disease" => &[1, 0, 1, 0, 0, 0],
            "ever_married" => &["Yes", "Yes", "Yes", "No", "No", "Yes"],
            "work_type" => &["Private", "Self-employed", "Private", "Private", "Govt_job", "Private"],
            "Residence_type" => &["Urban", "Rural", "Urban", "Rural", "Urban", "Rural"],
            "avg_glucose_level" => &[220.0, 200.0, 190.0, 80.0, 85.0, 90.0],
            "bmi" => &["35.0", "N/A", "31.0", "22.0", "N/A", "24.0"],
            "smoking_status" => &["smokes", "formerly smoked", "smokes", "never smoked", "Unknown", "never smoked"],
            "stroke" => &[1, 1, 1, 0, 0, 0]
        )
        .unwrap();
        let (state, x, y) = TransformState::fit_transform(&df).unwrap();
        let params = ForestParams {
            n_trees: 9,
            max_depth: 3,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: None,
            seed: 3,
        };
        RiskPredictor::new(state, StrokeForest::fit(&x, &y, &params).unwrap())
    }

    fn record() -> PatientRecord {
        PatientRecord {
            gender: "Male".to_string(),
            age: 67.0,
            hypertension: 0,
            heart_disease: 1,
            ever_married: "Yes".to_string(),
            work_type: "Private".to_string(),
            residence_type: "Urban".to_string(),
            avg_glucose_level: 228.69,
            bmi: Some(36.6),
            smoking_status: "formerly smoked".to_string(),
        }
    }

    #[test]
    fn repeated_predictions_are_identical() {
        let predictor = predictor();
        let first = predictor.predict(&record()).unwrap();
        let second = predictor.predict(&record()).unwrap();
        assert_eq!(first.probability.to_bits(), second.probability.to_bits());
        assert_eq!(first, second);
        assert_eq!(first.band, RiskBand::from_probability(first.probability));
    }

    #[test]
    fn null_bmi_is_accepted() {
        let mut record = record();
        record.bmi = None;
        assert!(predictor().predict(&record).is_ok());
    }

    #[test]
    fn invalid_record_is_a_validation_error() {
        let mut record = record();
        record.age = -1.0;
        match predictor().predict(&record) {
            Err(ModelError::Transform(e)) => assert!(e.is_validation()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn artifact_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stroke_model.json");
        let predictor = predictor();
        let expected = predictor.predict(&record()).unwrap();
        predictor.into_artifact().save(&path).unwrap();

        let loaded = RiskPredictor::load(&path).unwrap();
        assert_eq!(loaded.predict(&record()).unwrap(), expected);
    }

    #[test]
    fn missing_artifact_is_remembered() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::open(dir.path().join("absent.json"));
        let err = store.current().unwrap_err();
        assert!(err.is_unavailable());
        assert!(err.to_string().contains("Please train the model first"));
        assert!(store.assess(&record()).unwrap_err().is_unavailable());
    }

    #[test]
    fn reload_swaps_in_new_artifact_and_keeps_old_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stroke_model.json");
        let store = ModelStore::open(&path);
        assert!(store.current().is_err());

        predictor().into_artifact().save(&path).unwrap();
        store.reload().unwrap();
        let before = store.current().unwrap();

        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(store.reload(), Err(ModelError::Corrupt { .. })));
        let after = store.current().unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stroke_model.json");
        let mut artifact = predictor().into_artifact();
        artifact.format_version = 99;
        artifact.save(&path).unwrap();
        assert!(matches!(
            Artifact::load(&path),
            Err(ModelError::UnsupportedVersion { found: 99, .. })
        ));
    }
}
