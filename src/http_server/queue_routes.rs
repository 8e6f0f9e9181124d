//! Queue HTTP routes
//!
//! JSON bodies use the cloud queue API field names unchanged.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::ApiResult;
use super::event_routes::client_scope;
use crate::gateway::LimitType;
use crate::queue::{
    ChangeMessageVisibilityRequest, DeleteMessageRequest, Message, PurgeQueueRequest, QueueStats,
    ReceiveMessageRequest, SendMessageBatchRequest, SendMessageBatchResponse, SendMessageRequest,
    SendMessageResponse,
};
use crate::subsystems::Subsystems;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReceiveMessageResponse {
    pub messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatsQuery {
    pub queue_url: String,
}

pub fn queue_routes(state: Arc<Subsystems>) -> Router {
    Router::new()
        .route("/send-message", post(send_message_handler))
        .route("/send-message-batch", post(send_message_batch_handler))
        .route("/receive-message", post(receive_message_handler))
        .route("/delete-message", post(delete_message_handler))
        .route("/change-visibility", post(change_visibility_handler))
        .route("/purge-queue", post(purge_queue_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

async fn throttle(state: &Subsystems, peer: Option<&ConnectInfo<SocketAddr>>) -> ApiResult<()> {
    let scope = client_scope(None, peer);
    state.limiter.enforce(&scope, LimitType::Api).await?;
    Ok(())
}

async fn send_message_handler(
    State(state): State<Arc<Subsystems>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    Json(request): Json<SendMessageRequest>,
) -> ApiResult<Json<SendMessageResponse>> {
    throttle(&state, peer.as_ref()).await?;
    Ok(Json(state.queues.send_message(request).await?))
}

async fn send_message_batch_handler(
    State(state): State<Arc<Subsystems>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    Json(request): Json<SendMessageBatchRequest>,
) -> ApiResult<Json<SendMessageBatchResponse>> {
    throttle(&state, peer.as_ref()).await?;
    Ok(Json(state.queues.send_message_batch(request).await?))
}

async fn receive_message_handler(
    State(state): State<Arc<Subsystems>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    Json(request): Json<ReceiveMessageRequest>,
) -> ApiResult<Json<ReceiveMessageResponse>> {
    throttle(&state, peer.as_ref()).await?;
    let messages = state.queues.receive_message(request).await?;
    Ok(Json(ReceiveMessageResponse { messages }))
}

async fn delete_message_handler(
    State(state): State<Arc<Subsystems>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    Json(request): Json<DeleteMessageRequest>,
) -> ApiResult<Json<Value>> {
    throttle(&state, peer.as_ref()).await?;
    state.queues.delete_message(request).await?;
    Ok(Json(json!({})))
}

async fn change_visibility_handler(
    State(state): State<Arc<Subsystems>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    Json(request): Json<ChangeMessageVisibilityRequest>,
) -> ApiResult<Json<Value>> {
    throttle(&state, peer.as_ref()).await?;
    state.queues.change_message_visibility(request).await?;
    Ok(Json(json!({})))
}

async fn purge_queue_handler(
    State(state): State<Arc<Subsystems>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    Json(request): Json<PurgeQueueRequest>,
) -> ApiResult<Json<Value>> {
    throttle(&state, peer.as_ref()).await?;
    state.queues.purge_queue(request).await?;
    Ok(Json(json!({})))
}

async fn stats_handler(
    State(state): State<Arc<Subsystems>>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<QueueStats>> {
    Ok(Json(state.queues.get_queue_stats(&query.queue_url).await?))
}
