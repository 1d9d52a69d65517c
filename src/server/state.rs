//! Application state management

use std::sync::Arc;

use crate::predictor::RiskService;

use super::auth::TokenVerifier;

/// Shared across handlers. Everything here is read-only after start-up.
pub struct AppState {
    pub model: Arc<dyn RiskService>,
    /// `None` when no signing secret is configured; every authenticated
    /// route then answers with a configuration error.
    pub verifier: Option<TokenVerifier>,
}

impl AppState {
    pub fn new(model: Arc<dyn RiskService>, jwt_secret: Option<&str>) -> Self {
        Self {
            model,
            verifier: jwt_secret.map(TokenVerifier::new),
        }
    }
}
