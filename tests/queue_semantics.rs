//! Queue delivery guarantees across concurrent consumers and the sweeper

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use eventgate::clock::ManualClock;
use eventgate::queue::{
    DeleteMessageRequest, PurgeQueueRequest, QueueClient, QueueConfig, QueueError,
    ReceiveMessageRequest, SendMessageRequest, MAX_VISIBILITY_TIMEOUT_SECS,
};
use eventgate::store::MemoryStore;

const URL: &str = "http://localhost:4566/000000000000/thumbnails";

fn setup() -> (Arc<QueueClient>, Arc<ManualClock>) {
    let clock = ManualClock::new(50_000);
    let client = QueueClient::new(
        MemoryStore::shared(clock.clone()),
        clock.clone(),
        QueueConfig::default(),
    );
    (Arc::new(client), clock)
}

fn send(body: &str) -> SendMessageRequest {
    SendMessageRequest {
        queue_url: URL.to_string(),
        message_body: body.to_string(),
        delay_seconds: None,
        message_attributes: None,
    }
}

fn receive(max: usize, visibility_secs: u64) -> ReceiveMessageRequest {
    ReceiveMessageRequest {
        queue_url: URL.to_string(),
        max_number_of_messages: Some(max),
        visibility_timeout: Some(visibility_secs),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_receivers_never_share_a_message() {
    let (client, _clock) = setup();
    for i in 0..40 {
        client.send_message(send(&format!("job-{}", i))).await.unwrap();
    }

    let mut workers = Vec::new();
    for _ in 0..4 {
        let client = Arc::clone(&client);
        workers.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            loop {
                let batch = client.receive_message(receive(3, 30)).await.unwrap();
                if batch.is_empty() {
                    return seen;
                }
                seen.extend(batch.into_iter().map(|m| m.message_id));
            }
        }));
    }

    let mut all = Vec::new();
    for worker in workers {
        all.extend(worker.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), 40);
    assert_eq!(unique.len(), 40);

    let stats = client.get_queue_stats(URL).await.unwrap();
    assert_eq!(stats.ready, 0);
    assert_eq!(stats.in_flight, 40);
}

#[tokio::test]
async fn test_unacknowledged_message_comes_back_once_window_passes() {
    let (client, clock) = setup();
    let sent = client.send_message(send("resize")).await.unwrap();

    let first = client.receive_message(receive(1, 30)).await.unwrap();
    assert_eq!(first[0].message_id, sent.message_id);
    assert_eq!(first[0].attributes["ApproximateReceiveCount"], "1");

    // Still hidden inside the window
    clock.advance(Duration::from_secs(29));
    assert_eq!(client.cleanup_all().await.unwrap().redelivered, 0);
    assert!(client.receive_message(receive(1, 30)).await.unwrap().is_empty());

    clock.advance(Duration::from_secs(2));
    assert_eq!(client.cleanup_all().await.unwrap().redelivered, 1);

    let second = client.receive_message(receive(1, 30)).await.unwrap();
    assert_eq!(second[0].message_id, sent.message_id);
    assert_eq!(second[0].attributes["ApproximateReceiveCount"], "2");
    assert_ne!(second[0].receipt_handle, first[0].receipt_handle);

    // The stale handle no longer acknowledges anything
    client
        .delete_message(DeleteMessageRequest {
            queue_url: URL.to_string(),
            receipt_handle: first[0].receipt_handle.clone(),
        })
        .await
        .unwrap();
    assert_eq!(client.get_queue_stats(URL).await.unwrap().in_flight, 1);

    client
        .delete_message(DeleteMessageRequest {
            queue_url: URL.to_string(),
            receipt_handle: second[0].receipt_handle.clone(),
        })
        .await
        .unwrap();
    clock.advance(Duration::from_secs(60));
    assert_eq!(client.cleanup_all().await.unwrap().redelivered, 0);
    let stats = client.get_queue_stats(URL).await.unwrap();
    assert_eq!((stats.ready, stats.in_flight, stats.delayed), (0, 0, 0));
}

#[tokio::test]
async fn test_delayed_message_is_invisible_until_due() {
    let (client, clock) = setup();
    let mut request = send("later");
    request.delay_seconds = Some(10);
    client.send_message(request).await.unwrap();

    assert!(client.receive_message(receive(1, 30)).await.unwrap().is_empty());
    assert_eq!(client.get_queue_stats(URL).await.unwrap().delayed, 1);

    clock.advance(Duration::from_secs(10));
    let received = client.receive_message(receive(1, 30)).await.unwrap();
    assert_eq!(received[0].body, "later");
}

#[tokio::test]
async fn test_purge_drops_ready_delayed_and_in_flight() {
    let (client, clock) = setup();
    client.send_message(send("ready")).await.unwrap();
    client.send_message(send("taken")).await.unwrap();
    let mut delayed = send("later");
    delayed.delay_seconds = Some(5);
    client.send_message(delayed).await.unwrap();
    let taken = client.receive_message(receive(1, 30)).await.unwrap();

    client
        .purge_queue(PurgeQueueRequest {
            queue_url: URL.to_string(),
        })
        .await
        .unwrap();
    let stats = client.get_queue_stats(URL).await.unwrap();
    assert_eq!((stats.ready, stats.in_flight, stats.delayed), (0, 0, 0));

    // Nothing comes back after windows and delays pass
    clock.advance(Duration::from_secs(60));
    assert_eq!(client.cleanup_all().await.unwrap().redelivered, 0);
    assert!(client.receive_message(receive(10, 30)).await.unwrap().is_empty());
    client
        .delete_message(DeleteMessageRequest {
            queue_url: URL.to_string(),
            receipt_handle: taken[0].receipt_handle.clone(),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_visibility_timeout_above_twelve_hours_is_rejected() {
    let (client, _clock) = setup();
    client.send_message(send("bounded")).await.unwrap();

    let err = client
        .receive_message(receive(1, MAX_VISIBILITY_TIMEOUT_SECS + 1))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InvalidParameterValue(_)));
    assert_eq!(err.status_code(), 400);
    assert_eq!(client.get_queue_stats(URL).await.unwrap().ready, 1);
}
