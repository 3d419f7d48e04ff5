mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{client_id, ChannelSink, MemStore};
use trellis_core::config::IngestConfig;
use trellis_core::ingest::LogIngest;
use trellis_core::registry::{Broadcaster, SubscriberRegistry};
use trellis_core::types::{LogRecord, PushKind, PushMessage};
use trellis_core::LogBuffer;

/// Real ingest wired to a real registry over one shared buffer, the way the
/// gateway assembles them.
fn make_pipeline(store: Arc<MemStore>) -> (Arc<LogIngest>, SubscriberRegistry, Arc<LogBuffer>) {
    let buffer = Arc::new(LogBuffer::new(100));
    let registry = SubscriberRegistry::new(Arc::clone(&buffer), Arc::clone(&store) as _);
    let broadcaster: Arc<dyn Broadcaster> = Arc::new(registry.clone());
    let ingest = Arc::new(LogIngest::new(
        IngestConfig {
            udp_host: "127.0.0.1".to_string(),
            udp_port: 0,
            buffer_size: 100,
            batch_size: 100,
            flush_interval_ms: 60_000,
        },
        Arc::clone(&buffer),
        store,
        broadcaster,
    ));
    (ingest, registry, buffer)
}

fn frame(client: &str, payload: &[u8]) -> Vec<u8> {
    let mut bytes = client.as_bytes().to_vec();
    bytes.extend_from_slice(payload);
    bytes
}

async fn recv_timeout(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<PushMessage>,
) -> Option<PushMessage> {
    tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .ok()
        .flatten()
}

fn payload_of(message: PushMessage) -> Vec<u8> {
    assert_eq!(message.kind, PushKind::LiveLog);
    let log: LogRecord = serde_json::from_value(message.payload.unwrap()).unwrap();
    log.message
}

#[tokio::test]
async fn two_subscribers_each_receive_admitted_records_once_in_order() {
    let store = Arc::new(MemStore::new());
    let (ingest, registry, _buffer) = make_pipeline(store);
    let addr = ingest.start().unwrap();

    let client = client_id(60);
    let (sink1, mut rx1) = ChannelSink::new();
    let (sink2, mut rx2) = ChannelSink::new();
    registry.register(client.clone(), sink1);
    registry.register(client.clone(), sink2);

    let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for payload in [b"A", b"B", b"C"] {
        sender.send_to(&frame(&client, payload), addr).await.unwrap();
    }

    for rx in [&mut rx1, &mut rx2] {
        for expected in [b"A", b"B", b"C"] {
            let message = recv_timeout(rx).await.expect("live log");
            assert_eq!(payload_of(message), expected.to_vec());
        }
    }

    // The shared ring must not feed anyone a second copy.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx1.try_recv().is_err(), "no redelivery to the first subscriber");
    assert!(rx2.try_recv().is_err(), "no redelivery to the second subscriber");

    ingest.stop().await;
}

#[tokio::test]
async fn records_admitted_before_attach_are_caught_up_exactly_once() {
    let store = Arc::new(MemStore::new());
    let (ingest, registry, buffer) = make_pipeline(store);
    let addr = ingest.start().unwrap();

    let client = client_id(61);
    let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for payload in [b"P", b"Q"] {
        sender.send_to(&frame(&client, payload), addr).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The first connection replays the ring backlog.
    let (sink1, mut rx1) = ChannelSink::new();
    registry.register(client.clone(), sink1);
    for expected in [b"P", b"Q"] {
        let message = recv_timeout(&mut rx1).await.expect("backlog record");
        assert_eq!(payload_of(message), expected.to_vec());
    }
    assert!(!buffer.has_logs(&client));

    // A later connection sees nothing: the backlog was consumed.
    let (sink2, mut rx2) = ChannelSink::new();
    registry.register(client.clone(), sink2);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx2.try_recv().is_err());
    assert!(rx1.try_recv().is_err());

    // Records admitted from here on arrive live on both, once.
    sender.send_to(&frame(&client, b"R"), addr).await.unwrap();
    assert_eq!(payload_of(recv_timeout(&mut rx1).await.expect("live")), b"R");
    assert_eq!(payload_of(recv_timeout(&mut rx2).await.expect("live")), b"R");

    ingest.stop().await;
}
