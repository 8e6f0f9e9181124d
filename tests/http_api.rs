//! HTTP surface tests
//!
//! Drive the full router with `tower::ServiceExt::oneshot` over in-memory
//! subsystems.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use eventgate::clock::ManualClock;
use eventgate::gateway::{RateLimit, RateLimitConfig};
use eventgate::http_server::{HttpServer, HttpServerConfig};
use eventgate::store::MemoryStore;
use eventgate::subsystems::{Subsystems, SubsystemsConfig};

const QUEUE_URL: &str = "http://localhost:4566/000000000000/jobs";

fn app_with(config: SubsystemsConfig) -> (Router, Arc<Subsystems>) {
    let clock = ManualClock::new(10_000);
    let subsystems = Arc::new(
        Subsystems::start(config, MemoryStore::shared(clock.clone()), clock).unwrap(),
    );
    let router = HttpServer::new(HttpServerConfig::default(), Arc::clone(&subsystems)).router();
    (router, subsystems)
}

fn app() -> (Router, Arc<Subsystems>) {
    app_with(SubsystemsConfig::default())
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn read_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health() {
    let (app, _) = app();
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["status"], "ok");
}

#[tokio::test]
async fn test_queue_round_trip() {
    let (app, _) = app();

    let response = app
        .clone()
        .oneshot(post(
            "/queue/send-message",
            json!({ "QueueUrl": QUEUE_URL, "MessageBody": "resize:42" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let message_id = read_json(response).await["MessageId"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(post(
            "/queue/receive-message",
            json!({ "QueueUrl": QUEUE_URL, "MaxNumberOfMessages": 5, "VisibilityTimeout": 30 }),
        ))
        .await
        .unwrap();
    let received = read_json(response).await;
    let messages = received["Messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["MessageId"], message_id.as_str());
    assert_eq!(messages[0]["Body"], "resize:42");
    let handle = messages[0]["ReceiptHandle"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(post(
            "/queue/delete-message",
            json!({ "QueueUrl": QUEUE_URL, "ReceiptHandle": handle }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(get(&format!("/queue/stats?QueueUrl={}", "jobs")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stats = read_json(response).await;
    assert_eq!(stats["inFlight"], 0);
}

#[tokio::test]
async fn test_queue_errors_carry_wire_code() {
    let (app, _) = app();
    let response = app
        .oneshot(post(
            "/queue/send-message-batch",
            json!({ "QueueUrl": QUEUE_URL, "Entries": [] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response).await;
    assert_eq!(body["type"], "AWS.SimpleQueueService.EmptyBatchRequest");
    assert_eq!(body["code"], 400);
}

#[tokio::test]
async fn test_poll_is_rate_limited_with_retry_after() {
    let config = SubsystemsConfig {
        gateway: eventgate::gateway::GatewayConfig {
            rate_limits: RateLimitConfig {
                poll: RateLimit::new(2, Duration::from_secs(60)),
                ..Default::default()
            },
            ..Default::default()
        },
        ..Default::default()
    };
    let (app, _) = app_with(config);

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(get("/events/poll?userId=alice&since=0"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["events"], json!([]));
        assert_eq!(body["timestamp"], 0);
    }

    let response = app
        .clone()
        .oneshot(get("/events/poll?userId=alice&since=0"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[header::RETRY_AFTER], "60");

    // Other users have their own budget
    let response = app
        .oneshot(get("/events/poll?userId=bob&since=0"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_stream_receives_published_event() {
    let (app, subsystems) = app();

    let response = app
        .clone()
        .oneshot(get("/events/stream?userId=alice"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
    let mut body = response.into_body().into_data_stream();

    let hello = body.next().await.unwrap().unwrap();
    assert!(String::from_utf8_lossy(&hello).starts_with("event: connected\n"));
    assert_eq!(subsystems.gateway.connection_count(), 1);

    let response = app
        .clone()
        .oneshot(post(
            "/events/publish",
            json!({ "type": "invoice.paid", "data": { "invoice": 12 }, "userIds": ["alice"] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let frame = tokio::time::timeout(Duration::from_secs(2), body.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        String::from_utf8_lossy(&frame),
        "event: invoice.paid\ndata: {\"invoice\":12}\n\n"
    );

    // The buffered copy is there for polling clients too
    let response = app
        .oneshot(get("/events/poll?userId=alice&since=0"))
        .await
        .unwrap();
    let polled = read_json(response).await;
    assert_eq!(polled["events"][0]["type"], "invoice.paid");

    drop(body);
    assert_eq!(subsystems.gateway.connection_count(), 0);
}

#[tokio::test]
async fn test_stream_requires_user() {
    let (app, _) = app();
    let response = app.oneshot(get("/events/stream?userId=")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_pubsub_publish_and_history() {
    let (app, _) = app();

    let response = app
        .clone()
        .oneshot(post(
            "/pubsub/publish",
            json!({ "channel": "orders", "data": { "id": 1 }, "options": { "persist": true } }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let message_id = read_json(response).await["messageId"].clone();

    let response = app
        .clone()
        .oneshot(get("/pubsub/history/orders?limit=10"))
        .await
        .unwrap();
    let history = read_json(response).await;
    assert_eq!(history.as_array().unwrap().len(), 1);
    assert_eq!(history[0]["id"], message_id);

    let response = app.oneshot(get("/pubsub/analytics")).await.unwrap();
    assert_eq!(read_json(response).await["published"], 1);
}

#[tokio::test]
async fn test_pubsub_rejects_empty_channel() {
    let (app, _) = app();
    let response = app
        .oneshot(post("/pubsub/publish", json!({ "channel": "", "data": 1 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_monitor_endpoints() {
    let (app, subsystems) = app();
    subsystems
        .gateway
        .monitor()
        .publish_snapshot(&subsystems.store)
        .await
        .unwrap();

    let response = app.clone().oneshot(get("/monitor/stats")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stats = read_json(response).await;
    assert_eq!(stats["connections"]["active"], 0);

    let response = app.oneshot(get("/monitor/cluster")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cluster = read_json(response).await;
    assert_eq!(cluster["instances"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_history_window_past_the_end_is_empty() {
    let (app, _) = app();
    let response = app
        .clone()
        .oneshot(post(
            "/pubsub/publish",
            json!({ "channel": "audit", "data": 1, "options": { "persist": true } }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = app
        .clone()
        .oneshot(get("/pubsub/history/audit?offset=18446744073709551615"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await, json!([]));

    let response = app
        .oneshot(get("/pubsub/history/audit?limit=1001"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_receive_rejects_unbounded_visibility_timeout() {
    let (app, _) = app();
    let response = app
        .oneshot(post(
            "/queue/receive-message",
            json!({ "QueueUrl": QUEUE_URL, "VisibilityTimeout": u64::MAX }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_json(response).await["type"], "InvalidParameterValue");
}
