mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{client_id, record, ChannelSink, MemStore, RecordingBroadcaster};
use trellis_core::event::{EventHandler, EventKind, EventMeta, ModelStatusEvent};
use trellis_core::registry::{Broadcaster, StatusFanout, SubscriberRegistry};
use trellis_core::types::{LogRecord, ProcessType, PushKind, PushMessage, RunStatus};
use trellis_core::LogBuffer;

fn make_registry(store: Arc<MemStore>) -> (SubscriberRegistry, Arc<LogBuffer>) {
    let buffer = Arc::new(LogBuffer::new(100));
    (
        SubscriberRegistry::new(Arc::clone(&buffer), store),
        buffer,
    )
}

async fn recv_timeout(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<PushMessage>,
) -> Option<PushMessage> {
    tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .ok()
        .flatten()
}

#[tokio::test]
async fn broadcast_reaches_every_subscriber_of_the_client() {
    let (registry, _buffer) = make_registry(Arc::new(MemStore::new()));
    let client = client_id(30);
    let other = client_id(31);

    let (sink1, mut rx1) = ChannelSink::new();
    let (sink2, mut rx2) = ChannelSink::new();
    let (sink3, mut rx3) = ChannelSink::new();
    registry.register(client.clone(), sink1);
    registry.register(client.clone(), sink2);
    registry.register(other, sink3);

    let message = PushMessage::live_log(&record(&client, 1, b"A"));
    registry.broadcast_to_client(&client, message.clone());

    assert_eq!(recv_timeout(&mut rx1).await, Some(message.clone()));
    assert_eq!(recv_timeout(&mut rx2).await, Some(message));
    // The third subscriber tracks a different client.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx3.try_recv().is_err());
}

#[tokio::test]
async fn one_subscriber_sees_broadcasts_in_order() {
    let (registry, _buffer) = make_registry(Arc::new(MemStore::new()));
    let client = client_id(44);

    let (sink, mut rx) = ChannelSink::new();
    registry.register(client.clone(), sink);

    for i in 0..20 {
        registry.broadcast_to_client(&client, PushMessage::live_log(&record(&client, i, b"x")));
    }

    for i in 0..20 {
        let message = recv_timeout(&mut rx).await.expect("live log");
        let log: LogRecord = serde_json::from_value(message.payload.unwrap()).unwrap();
        assert_eq!(log.timestamp, i, "delivery must preserve enqueue order");
    }
}

#[tokio::test]
async fn broadcast_to_all_spans_clients() {
    let (registry, _buffer) = make_registry(Arc::new(MemStore::new()));

    let (sink1, mut rx1) = ChannelSink::new();
    let (sink2, mut rx2) = ChannelSink::new();
    registry.register(client_id(32), sink1);
    registry.register(client_id(33), sink2);

    let message = PushMessage::error("maintenance");
    registry.broadcast_to_all(message.clone());

    assert_eq!(recv_timeout(&mut rx1).await, Some(message.clone()));
    assert_eq!(recv_timeout(&mut rx2).await, Some(message));
}

#[tokio::test]
async fn failed_send_unregisters_the_subscriber() {
    let (registry, _buffer) = make_registry(Arc::new(MemStore::new()));
    let client = client_id(34);

    let (sink, _rx) = ChannelSink::new();
    sink.fail.store(true, Ordering::SeqCst);
    registry.register(client.clone(), Arc::clone(&sink) as _);
    assert_eq!(registry.subscriber_count(), 1);

    registry.broadcast_to_client(&client, PushMessage::error("boom"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(registry.subscriber_count(), 0);
    assert!(sink.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn unregister_is_idempotent_and_closes_the_sink() {
    let (registry, _buffer) = make_registry(Arc::new(MemStore::new()));
    let (sink, _rx) = ChannelSink::new();
    let subscriber = registry.register(client_id(35), Arc::clone(&sink) as _);

    registry.unregister(&subscriber.id).await;
    registry.unregister(&subscriber.id).await;

    assert_eq!(registry.subscriber_count(), 0);
    assert!(sink.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn register_queues_buffered_backlog_and_clears_the_ring() {
    let (registry, buffer) = make_registry(Arc::new(MemStore::new()));
    let client = client_id(36);

    for i in 0..3 {
        buffer.push(&client, record(&client, i, format!("r{i}").as_bytes()));
    }

    let (sink, mut rx) = ChannelSink::new();
    registry.register(client.clone(), sink);

    // Backlog arrives once, in insertion order.
    for i in 0..3 {
        let message = recv_timeout(&mut rx).await.expect("live log");
        assert_eq!(message.kind, PushKind::LiveLog);
        let log: LogRecord = serde_json::from_value(message.payload.unwrap()).unwrap();
        assert_eq!(log.timestamp, i);
    }

    // The catch-up drain reset the ring: nothing is left to replay, for
    // this connection or a later one.
    assert!(!buffer.has_logs(&client));
    let (sink2, mut rx2) = ChannelSink::new();
    registry.register(client, sink2);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx2.try_recv().is_err());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn history_request_is_chunked_with_the_request_id() {
    let client = client_id(37);
    let logs: Vec<LogRecord> = (0..230).map(|i| record(&client, i, b"h")).collect();
    let store = Arc::new(MemStore::with_logs(logs));
    let (registry, _buffer) = make_registry(store);

    let (sink, mut rx) = ChannelSink::new();
    let subscriber = registry.register(client, sink);

    let request = PushMessage {
        kind: PushKind::HistoryRequest,
        payload: Some(serde_json::json!({
            "from_timestamp": 0,
            "to_timestamp": 1_000_000_000_000_000_000i64,
            "limit": 250,
        })),
        request_id: Some("req-7".to_string()),
    };
    registry.handle_request(&subscriber, request).await;

    let mut sizes = Vec::new();
    for _ in 0..3 {
        let message = recv_timeout(&mut rx).await.expect("history batch");
        assert_eq!(message.kind, PushKind::LiveLog);
        assert_eq!(message.request_id.as_deref(), Some("req-7"));
        let batch: Vec<LogRecord> = serde_json::from_value(message.payload.unwrap()).unwrap();
        sizes.push(batch.len());
    }
    assert_eq!(sizes, vec![100, 100, 30]);
}

#[tokio::test]
async fn malformed_history_request_gets_an_error_reply() {
    let (registry, _buffer) = make_registry(Arc::new(MemStore::new()));
    let (sink, mut rx) = ChannelSink::new();
    let subscriber = registry.register(client_id(38), sink);

    let request = PushMessage {
        kind: PushKind::HistoryRequest,
        payload: Some(serde_json::json!("not an object")),
        request_id: None,
    };
    registry.handle_request(&subscriber, request).await;

    let reply = recv_timeout(&mut rx).await.expect("error reply");
    assert_eq!(reply.kind, PushKind::Error);
}

#[tokio::test]
async fn status_fanout_broadcasts_and_caches_latest_status() {
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let fanout = StatusFanout::new(Arc::clone(&broadcaster) as _);
    let client = client_id(39);

    let event = ModelStatusEvent {
        meta: EventMeta::new(EventKind::ModelStarted, &client),
        status: String::new(),
        message: "spinning up".to_string(),
        process_type: ProcessType::Train,
        progress: 0,
    };
    fanout
        .handle(
            EventKind::ModelStarted.as_str(),
            &serde_json::to_vec(&event).unwrap(),
        )
        .await
        .unwrap();

    let cached = fanout.get_status(&client).expect("cached status");
    assert_eq!(cached.status, RunStatus::Running);

    let messages = broadcaster.for_client(&client);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].kind, PushKind::ModelStatus);

    // A terminal event replaces the cache entry.
    let done = ModelStatusEvent {
        meta: EventMeta::new(EventKind::ModelCompleted, &client),
        status: String::new(),
        message: "finished".to_string(),
        process_type: ProcessType::Train,
        progress: 0,
    };
    fanout
        .handle(
            EventKind::ModelCompleted.as_str(),
            &serde_json::to_vec(&done).unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        fanout.get_status(&client).unwrap().status,
        RunStatus::Completed
    );
}
