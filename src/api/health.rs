//! Health check endpoints

use super::{ApiResponse, ApiState};
use axum::{extract::State, response::Json};
use serde::Serialize;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Configured Bitcoin network
    pub network: String,
    /// Monitors and periodic jobs currently scheduled
    pub scheduled_jobs: usize,
}

/// Health check endpoint
pub async fn health_check(State(state): State<ApiState>) -> Json<ApiResponse<HealthResponse>> {
    let response = HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        network: state.app.config.bitcoin.network.clone(),
        scheduled_jobs: state.app.scheduler.active_jobs(),
    };

    Json(ApiResponse::success(response))
}
