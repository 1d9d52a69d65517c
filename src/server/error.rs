//! Error types for the server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::error::{ModelError, TransformError};

pub const NOT_A_PATIENT: &str =
    "You are not authorized to use this endpoint because you are not a patient";

#[derive(Error, Debug)]
pub enum ApiError {
    /// Caller's role is not allowed to request predictions.
    #[error("{}", NOT_A_PATIENT)]
    NotAuthorized,

    #[error("{0}")]
    Unauthenticated(String),

    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    ModelUnavailable(String),

    #[error("server configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ModelError> for ApiError {
    fn from(e: ModelError) -> Self {
        match e {
            e if e.is_unavailable() => ApiError::ModelUnavailable(e.to_string()),
            ModelError::Transform(t) if t.is_validation() => ApiError::Invalid(t.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<TransformError> for ApiError {
    fn from(e: TransformError) -> Self {
        ModelError::from(e).into()
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            // role mismatch stays a plain 400
            ApiError::NotAuthorized => StatusCode::BAD_REQUEST,
            ApiError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ApiError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::ModelUnavailable(_) => StatusCode::NOT_FOUND,
            ApiError::Configuration(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = match &self {
            ApiError::Configuration(msg) => {
                log::error!("configuration error: {}", msg);
                "Server configuration error".to_string()
            }
            ApiError::Internal(msg) => {
                log::error!("prediction failed: {}", msg);
                "Prediction error: the request could not be processed".to_string()
            }
            ApiError::ModelUnavailable(msg) => {
                log::warn!("model unavailable: {}", msg);
                msg.clone()
            }
            other => {
                log::warn!("request rejected: {}", other);
                other.to_string()
            }
        };

        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
