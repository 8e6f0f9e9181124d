//! Event delivery HTTP routes
//!
//! - `GET /events/stream`: push transport (`text/event-stream`)
//! - `GET /events/poll`: pull transport over the replay buffer
//! - `POST /events/publish`: publish an event for delivery

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::error::{ApiError, ApiResult};
use crate::gateway::{
    publish_event, BridgedEvent, ConnectRequest, EventTarget, LimitScope, LimitType, PollResponse,
    EVENT_STREAM_CONTENT_TYPE,
};
use crate::subsystems::Subsystems;

// ==================
// Request/Response Types
// ==================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    pub user_id: String,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollQuery {
    pub user_id: String,
    #[serde(default)]
    pub since: i64,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PublishEventRequest {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, flatten)]
    pub target: EventTarget,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishEventResponse {
    /// Broker message id, or the buffered event id when delivered locally
    pub id: String,
    /// Local sends; absent when the event went through the broker
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent: Option<usize>,
}

/// Rate-limit scope: the user when known, else the peer address
pub(super) fn client_scope(
    user_id: Option<&str>,
    peer: Option<&ConnectInfo<SocketAddr>>,
) -> LimitScope {
    match (user_id, peer) {
        (Some(user), _) if !user.is_empty() => LimitScope::User(user.to_string()),
        (_, Some(ConnectInfo(addr))) => LimitScope::Ip(addr.ip().to_string()),
        _ => LimitScope::Ip("unknown".to_string()),
    }
}

// ==================
// Event Routes
// ==================

pub fn event_routes(state: Arc<Subsystems>) -> Router {
    Router::new()
        .route("/stream", get(stream_handler))
        .route("/poll", get(poll_handler))
        .route("/publish", post(publish_handler))
        .with_state(state)
}

/// Open a push stream. The connection guard travels with the body, so the
/// client is unregistered when the response stream is dropped.
async fn stream_handler(
    State(state): State<Arc<Subsystems>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Response> {
    let scope = client_scope(Some(&query.user_id), peer.as_ref());
    state.limiter.enforce(&scope, LimitType::Stream).await?;

    let request = ConnectRequest {
        user_id: query.user_id,
        role: query.role,
        remote_addr: peer.map(|ConnectInfo(addr)| addr.to_string()),
        metadata: HashMap::new(),
    };
    let (guard, frames) = state.gateway.open_stream(request)?;
    debug!(client_id = %guard.client_id(), "push stream opened");

    let body = stream::unfold((frames, guard), |(mut frames, guard)| async move {
        frames
            .recv()
            .await
            .map(|frame| (Ok::<_, Infallible>(frame), (frames, guard)))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, EVENT_STREAM_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(body))
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn poll_handler(
    State(state): State<Arc<Subsystems>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    Query(query): Query<PollQuery>,
) -> ApiResult<Json<PollResponse>> {
    if query.user_id.is_empty() {
        return Err(ApiError::bad_request("userId is required"));
    }
    let scope = client_scope(Some(&query.user_id), peer.as_ref());
    state.limiter.enforce(&scope, LimitType::Poll).await?;

    Ok(Json(state.gateway.poll(
        &query.user_id,
        query.since,
        query.role.as_deref(),
    )))
}

/// Publish through the broker when the bridge is attached, so every
/// process delivers it; otherwise deliver on this process only.
async fn publish_handler(
    State(state): State<Arc<Subsystems>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    Json(request): Json<PublishEventRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.event_type.trim().is_empty() {
        return Err(ApiError::bad_request("type is required"));
    }
    let scope = client_scope(None, peer.as_ref());
    state.limiter.enforce(&scope, LimitType::Publish).await?;

    let response = if state.bridge_id().is_some() {
        let id = publish_event(
            &state.broker,
            BridgedEvent {
                event_type: request.event_type,
                data: request.data,
                target: request.target,
            },
        )
        .await?;
        PublishEventResponse { id, sent: None }
    } else {
        let report = state
            .gateway
            .deliver(&request.event_type, request.data, request.target);
        PublishEventResponse {
            id: report.event.id,
            sent: Some(report.sent),
        }
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}
