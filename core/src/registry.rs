// Subscriber registry: long-lived push connections and their fan-out.
//
// The registry owns subscriber bookkeeping and send serialization; the
// transport (WebSocket in the gateway) plugs in through `PushSink`. Every
// outbound message is enqueued onto the subscriber's ordered queue and
// written by that subscriber's single writer task, so per-subscriber
// delivery preserves enqueue order and a slow connection delays only its
// own queue. A live record reaches a subscriber through exactly one path:
// the broadcast stage for records admitted while the subscriber is in the
// per-client index, or the one-shot ring drain at registration for records
// buffered before it attached. The drain clears the ring, so nothing is
// ever replayed to this or a later connection. Other components reach
// subscribers through the narrow `Broadcaster` capability, which keeps the
// ingest pipeline from holding the registry itself.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::buffer::LogBuffer;
use crate::event::{EventHandler, EventKind, EventPayload};
use crate::store::Store;
use crate::types::{HistoryRequest, ModelStatus, PushKind, PushMessage, RunStatus};
use crate::{Result, TrellisError};

/// Records per history backfill batch.
const HISTORY_BATCH_SIZE: usize = 100;

/// Serialized send path to one push connection. Implementations wrap the
/// actual transport behind a send mutex.
#[async_trait]
pub trait PushSink: Send + Sync {
    async fn send(&self, message: &PushMessage) -> Result<()>;
    async fn close(&self);
}

/// One registered push connection tracking a single client id.
pub struct Subscriber {
    pub id: String,
    pub client_id: String,
    sink: Arc<dyn PushSink>,
    outbound: mpsc::UnboundedSender<PushMessage>,
}

impl Subscriber {
    /// Queues a message for the writer task. Fails only once the writer has
    /// exited.
    pub fn enqueue(&self, message: PushMessage) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| TrellisError::SubscriberWrite("subscriber queue closed".to_string()))
    }
}

/// Delivery capability handed to producers of push traffic.
pub trait Broadcaster: Send + Sync {
    /// Queues a send to every subscriber tracking `client_id`; never waits
    /// on slow connections.
    fn broadcast_to_client(&self, client_id: &str, message: PushMessage);

    /// As above, across every registered subscriber.
    fn broadcast_to_all(&self, message: PushMessage);
}

/// Tracks subscribers under two indexes: the global set and a per-client
/// list. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct SubscriberRegistry {
    subscribers: Arc<DashMap<String, Arc<Subscriber>>>,
    by_client: Arc<DashMap<String, Vec<Arc<Subscriber>>>>,
    buffer: Arc<LogBuffer>,
    store: Arc<dyn Store>,
}

impl SubscriberRegistry {
    pub fn new(buffer: Arc<LogBuffer>, store: Arc<dyn Store>) -> Self {
        Self {
            subscribers: Arc::new(DashMap::new()),
            by_client: Arc::new(DashMap::new()),
            buffer,
            store,
        }
    }

    /// Registers a connection, queues the client's buffered backlog and
    /// launches the writer task. The caller owns the inbound reader and
    /// routes requests to `handle_request`.
    pub fn register(&self, client_id: String, sink: Arc<dyn PushSink>) -> Arc<Subscriber> {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let subscriber = Arc::new(Subscriber {
            id: Uuid::new_v4().to_string(),
            client_id,
            sink,
            outbound,
        });

        self.subscribers
            .insert(subscriber.id.clone(), Arc::clone(&subscriber));

        let registry = self.clone();
        let writing = Arc::clone(&subscriber);
        tokio::spawn(async move {
            registry.write_outbound(writing, outbound_rx).await;
        });

        // Catch-up for records admitted before this connection attached.
        // The drain resets the ring, so no later registration replays them;
        // live broadcasts only reach this subscriber once it enters the
        // per-client index below, so the two paths never hand over the same
        // record.
        for record in self.buffer.drain(&subscriber.client_id) {
            let _ = subscriber.enqueue(PushMessage::live_log(&record));
        }

        self.by_client
            .entry(subscriber.client_id.clone())
            .or_default()
            .push(Arc::clone(&subscriber));

        info!(
            target: "registry",
            subscriber = %subscriber.id,
            client_id = %subscriber.client_id,
            "Subscriber registered"
        );

        subscriber
    }

    /// Removes a subscriber from both indexes and closes its connection.
    /// Idempotent.
    pub async fn unregister(&self, subscriber_id: &str) {
        let Some((_, subscriber)) = self.subscribers.remove(subscriber_id) else {
            return;
        };

        if let Some(mut entry) = self.by_client.get_mut(&subscriber.client_id) {
            entry.retain(|s| s.id != subscriber.id);
        }
        self.by_client
            .remove_if(&subscriber.client_id, |_, subs| subs.is_empty());

        subscriber.sink.close().await;
        info!(target: "registry", subscriber = %subscriber.id, "Subscriber unregistered");
    }

    /// Closes every connection; used during shutdown.
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.subscribers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.unregister(&id).await;
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Drains the subscriber's queue onto its connection, one message at a
    /// time. A write failure tears the subscriber down.
    async fn write_outbound(
        &self,
        subscriber: Arc<Subscriber>,
        mut outbound: mpsc::UnboundedReceiver<PushMessage>,
    ) {
        while let Some(message) = outbound.recv().await {
            if let Err(e) = subscriber.sink.send(&message).await {
                warn!(
                    target: "registry",
                    subscriber = %subscriber.id,
                    error = %e,
                    "Subscriber write failed"
                );
                self.unregister(&subscriber.id).await;
                return;
            }
        }
    }

    /// Handles one inbound message from a subscriber's reader.
    pub async fn handle_request(&self, subscriber: &Arc<Subscriber>, message: PushMessage) {
        match message.kind {
            PushKind::HistoryRequest => {
                self.handle_history_request(subscriber, message).await;
            }
            // Outbound-only kinds arriving inbound are ignored.
            _ => {}
        }
    }

    async fn handle_history_request(&self, subscriber: &Arc<Subscriber>, message: PushMessage) {
        let request: HistoryRequest = match message
            .payload
            .and_then(|p| serde_json::from_value(p).ok())
        {
            Some(req) => req,
            None => {
                self.send_error(subscriber, "invalid history request format");
                return;
            }
        };

        let logs = match self
            .store
            .fetch_logs(
                &subscriber.client_id,
                request.from_timestamp,
                request.to_timestamp,
                request.limit,
            )
            .await
        {
            Ok(logs) => logs,
            Err(e) => {
                warn!(target: "registry", error = %e, "History fetch failed");
                self.send_error(subscriber, "failed to fetch history");
                return;
            }
        };

        for chunk in logs.chunks(HISTORY_BATCH_SIZE) {
            let batch = PushMessage::live_log_batch(chunk, message.request_id.clone());
            if subscriber.enqueue(batch).is_err() {
                return;
            }
        }
    }

    /// Best-effort error reply on the subscriber's own connection.
    pub fn send_error(&self, subscriber: &Arc<Subscriber>, text: &str) {
        let _ = subscriber.enqueue(PushMessage::error(text));
    }
}

impl Broadcaster for SubscriberRegistry {
    fn broadcast_to_client(&self, client_id: &str, message: PushMessage) {
        let targets: Vec<Arc<Subscriber>> = self
            .by_client
            .get(client_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();

        for subscriber in targets {
            if subscriber.enqueue(message.clone()).is_err() {
                let registry = self.clone();
                tokio::spawn(async move {
                    registry.unregister(&subscriber.id).await;
                });
            }
        }
    }

    fn broadcast_to_all(&self, message: PushMessage) {
        let targets: Vec<Arc<Subscriber>> = self
            .subscribers
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();

        for subscriber in targets {
            if subscriber.enqueue(message.clone()).is_err() {
                let registry = self.clone();
                tokio::spawn(async move {
                    registry.unregister(&subscriber.id).await;
                });
            }
        }
    }
}

/// Bridges status events from the bus to push subscribers and keeps the
/// latest status per client in memory.
pub struct StatusFanout {
    broadcaster: Arc<dyn Broadcaster>,
    latest: DashMap<String, ModelStatus>,
}

impl StatusFanout {
    pub fn new(broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self {
            broadcaster,
            latest: DashMap::new(),
        }
    }

    /// Latest status observed for a client, if any.
    pub fn get_status(&self, client_id: &str) -> Option<ModelStatus> {
        self.latest.get(client_id).map(|s| s.clone())
    }
}

#[async_trait]
impl EventHandler for StatusFanout {
    async fn handle(&self, kind: &str, payload: &[u8]) -> Result<()> {
        let EventPayload::ModelStatus(event) = crate::event::decode(kind, payload)? else {
            return Ok(());
        };

        // Workers may carry an explicit status string; the event kind is the
        // fallback mapping.
        let status = event.status.parse::<RunStatus>().ok().unwrap_or(
            match EventKind::parse(kind) {
                Some(EventKind::ModelCompleted) => RunStatus::Completed,
                Some(EventKind::ModelFailed) => RunStatus::Error,
                _ => RunStatus::Running,
            },
        );

        let model_status = ModelStatus {
            client_id: event.meta.client_id.clone(),
            status,
            message: event.message,
            timestamp: event.meta.timestamp,
            process_type: event.process_type,
        };

        self.latest
            .insert(model_status.client_id.clone(), model_status.clone());
        self.broadcaster.broadcast_to_client(
            &model_status.client_id,
            PushMessage::model_status(&model_status),
        );
        Ok(())
    }
}
