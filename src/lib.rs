//! Stroke risk prediction: feature transformer, ensemble classifier, risk
//! banding, offline training and the HTTP service around them.

pub mod cli;
pub mod error;
pub mod forest;
pub mod pipeline;
pub mod predictor;
pub mod records;
pub mod server;
pub mod transform;

pub use error::{ModelError, PipelineError, TransformError};
pub use predictor::{ModelStore, Prediction, RiskBand, RiskPredictor, RiskService};
pub use records::PatientRecord;
pub use transform::{FeatureMatrix, TransformState};
