//! Monitoring HTTP Routes
//!
//! Health check plus gateway metrics for this process and the cluster.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;

use super::error::ApiResult;
use crate::gateway::{cluster_stats, ClusterStats, GatewayError, MonitorSnapshot};
use crate::subsystems::Subsystems;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Create monitor routes
pub fn monitor_routes(state: Arc<Subsystems>) -> Router {
    Router::new()
        .route("/stats", get(stats_handler))
        .route("/cluster", get(cluster_handler))
        .with_state(state)
}

/// Health check route at root /health
pub fn health_routes() -> Router {
    Router::new().route("/health", get(health_handler))
}

async fn health_handler() -> impl IntoResponse {
    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    (StatusCode::OK, Json(response))
}

/// This process's snapshot
async fn stats_handler(State(state): State<Arc<Subsystems>>) -> Json<MonitorSnapshot> {
    Json(state.gateway.monitor().snapshot())
}

/// Sum of every published snapshot
async fn cluster_handler(State(state): State<Arc<Subsystems>>) -> ApiResult<Json<ClusterStats>> {
    let stats = cluster_stats(&state.store)
        .await
        .map_err(GatewayError::from)?;
    Ok(Json(stats))
}
