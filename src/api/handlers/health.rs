use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub credentials_configured: bool,
    pub environment: String,
    pub name: &'static str,
    pub storage_configured: bool,
    pub version: &'static str,
}

/// `GET /`: service identity and which optional backends are wired up.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        credentials_configured: state.credentials.available(),
        environment: state.config.environment.clone(),
        name: env!("CARGO_PKG_NAME"),
        storage_configured: state.config.storage_configured(),
        version: env!("CARGO_PKG_VERSION"),
    })
}
