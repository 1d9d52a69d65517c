//! HTTP surface of the prediction service.

mod auth;
mod error;
mod handlers;
mod state;

pub use auth::{Claims, TokenVerifier, PATIENT_ROLE};
pub use error::{ApiError, NOT_A_PATIENT};
pub use handlers::PredictionResponse;
pub use state::AppState;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::predictor::ModelStore;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub artifact: PathBuf,
    pub jwt_secret: Option<String>,
    /// Allowed browser origin; any origin when unset or `*`.
    pub cors_origin: Option<String>,
}

pub fn cors_layer(origin: Option<&str>) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    match origin {
        Some(origin) if !origin.is_empty() && origin != "*" => match origin.parse::<HeaderValue>() {
            Ok(value) => layer.allow_origin(value),
            Err(_) => {
                log::warn!("ignoring unparseable CORS origin {:?}, allowing any origin", origin);
                layer.allow_origin(Any)
            }
        },
        _ => layer.allow_origin(Any),
    }
}

pub fn create_router(state: Arc<AppState>, cors: CorsLayer) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/prediction/predict", post(handlers::predict))
        .with_state(state)
        .layer(cors)
}

/// Loads the artifact once, then serves until the process is stopped.
pub async fn serve(config: ServerConfig) -> std::io::Result<()> {
    let store = Arc::new(ModelStore::open(&config.artifact));
    if config.jwt_secret.is_none() {
        log::warn!("no token secret configured, prediction requests will be refused");
    }

    #[cfg(unix)]
    spawn_reload_on_hangup(Arc::clone(&store));

    let state = Arc::new(AppState::new(store, config.jwt_secret.as_deref()));
    let app = create_router(state, cors_layer(config.cors_origin.as_deref()));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("shutting down");
        })
        .await
}

#[cfg(unix)]
fn spawn_reload_on_hangup(store: Arc<ModelStore>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                log::warn!("cannot listen for SIGHUP, model reload disabled: {}", e);
                return;
            }
        };
        while hangup.recv().await.is_some() {
            log::info!("SIGHUP received, reloading {}", store.path().display());
            // failures are logged by the store and keep the current model
            let _ = store.reload();
        }
    });
}
