use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::predictor::{Prediction, RiskBand};
use crate::records::PatientRecord;

use super::auth::Claims;
use super::error::{ApiError, Result};
use super::state::AppState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub success: bool,
    pub prediction: i32,
    pub probability: f64,
    pub risk_level: RiskBand,
    pub message: String,
}

impl From<Prediction> for PredictionResponse {
    fn from(p: Prediction) -> Self {
        Self {
            success: true,
            prediction: p.label,
            probability: p.probability,
            risk_level: p.band,
            message: p.band.message().to_string(),
        }
    }
}

pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "message": "Server is running",
    }))
}

/// The role gate runs before the body is inspected, so a non-patient never
/// reaches the model.
pub async fn predict(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    payload: std::result::Result<Json<PatientRecord>, JsonRejection>,
) -> Result<Json<PredictionResponse>> {
    if !claims.is_patient() {
        return Err(ApiError::NotAuthorized);
    }
    let Json(record) = payload.map_err(|e| ApiError::Invalid(e.body_text()))?;

    let prediction = state.model.assess(&record)?;
    log::info!(
        "prediction for {}: label {}, probability {:.4}, {}",
        claims.sub.as_deref().unwrap_or("unknown subject"),
        prediction.label,
        prediction.probability,
        prediction.band.as_str()
    );
    Ok(Json(prediction.into()))
}
