//! Pub/Sub HTTP routes

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{ApiError, ApiResult};
use super::event_routes::client_scope;
use crate::gateway::LimitType;
use crate::pubsub::{AnalyticsSnapshot, PubSubMessage, PublishOptions};
use crate::subsystems::Subsystems;

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub channel: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub options: PublishOptions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResponse {
    pub message_id: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_history_limit() -> usize {
    100
}

pub fn pubsub_routes(state: Arc<Subsystems>) -> Router {
    Router::new()
        .route("/publish", post(publish_handler))
        .route("/history/:channel", get(history_handler))
        .route("/analytics", get(analytics_handler))
        .with_state(state)
}

async fn publish_handler(
    State(state): State<Arc<Subsystems>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    Json(request): Json<PublishRequest>,
) -> ApiResult<impl IntoResponse> {
    let scope = client_scope(None, peer.as_ref());
    state.limiter.enforce(&scope, LimitType::Publish).await?;

    let message_id = state
        .broker
        .publish(&request.channel, request.data, request.options)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(PublishResponse { message_id })))
}

async fn history_handler(
    State(state): State<Arc<Subsystems>>,
    Path(channel): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<PubSubMessage>>> {
    if query.limit > 1000 {
        return Err(ApiError::bad_request("limit must be at most 1000"));
    }
    let history = state
        .broker
        .get_history(&channel, query.limit, query.offset)
        .await?;
    Ok(Json(history))
}

async fn analytics_handler(State(state): State<Arc<Subsystems>>) -> Json<AnalyticsSnapshot> {
    Json(state.broker.analytics())
}
