// Kafka consumer: one topic, one named group, dispatch by type header.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer as _, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Headers, Message};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::KafkaConfig;
use crate::event::EVENT_TYPE_HEADER;
use crate::{Result, TrellisError};

/// Handler invoked for every message whose type it subscribed to.
///
/// `kind` is the raw header string; `payload` the undecoded JSON body.
/// Handler errors are logged by the consumer and never stall the group.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, kind: &str, payload: &[u8]) -> Result<()>;
}

type HandlerMap = Arc<DashMap<String, Vec<Arc<dyn EventHandler>>>>;

/// Joins a consumer group on one topic and dispatches messages to the
/// handlers registered for each event type. Offsets advance after all
/// handlers for a message return.
pub struct Consumer {
    brokers: String,
    group_id: String,
    topic: String,
    handlers: HandlerMap,
    running: AtomicBool,
    stop: watch::Sender<bool>,
}

impl Consumer {
    pub fn new(cfg: &KafkaConfig, group_id: String, topic: String) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            brokers: cfg.broker_list(),
            group_id,
            topic,
            handlers: Arc::new(DashMap::new()),
            running: AtomicBool::new(false),
            stop,
        }
    }

    /// Registers a handler for an event type. Multiple handlers per type
    /// are invoked in registration order.
    pub fn subscribe(&self, kind: &str, handler: Arc<dyn EventHandler>) {
        self.handlers
            .entry(kind.to_string())
            .or_default()
            .push(handler);
    }

    /// Removes every handler for an event type.
    pub fn unsubscribe_all(&self, kind: &str) {
        self.handlers.remove(kind);
    }

    /// Joins the group and spawns the reader loop. Idempotent.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "latest")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| TrellisError::BusFatal(e.to_string()))?;
        consumer
            .subscribe(&[self.topic.as_str()])
            .map_err(|e| TrellisError::BusFatal(e.to_string()))?;

        info!(
            target: "event_bus",
            topic = %self.topic,
            group = %self.group_id,
            "Consumer started"
        );

        let handlers = Arc::clone(&self.handlers);
        let mut stop = self.stop.subscribe();
        let topic = self.topic.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    received = consumer.recv() => match received {
                        Err(e) if is_shutdown(&e) => break,
                        Err(e) => {
                            warn!(target: "event_bus", topic = %topic, error = %e, "Reader error, backing off");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                        Ok(msg) => {
                            dispatch(&handlers, msg.headers(), msg.payload()).await;
                            if let Err(e) = consumer.commit_message(&msg, CommitMode::Async) {
                                warn!(target: "event_bus", topic = %topic, error = %e, "Offset commit failed");
                            }
                        }
                    }
                }
            }
            info!(target: "event_bus", topic = %topic, "Reader exited");
        });

        Ok(())
    }

    /// Signals the reader loop to exit. Idempotent.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            let _ = self.stop.send(true);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn dispatch(
    handlers: &HandlerMap,
    headers: Option<&rdkafka::message::BorrowedHeaders>,
    payload: Option<&[u8]>,
) {
    let kind = headers.and_then(|hs| {
        hs.iter()
            .find(|h| h.key == EVENT_TYPE_HEADER)
            .and_then(|h| h.value)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    });

    let Some(kind) = kind else {
        warn!(target: "event_bus", "Message missing event_type header, skipping");
        return;
    };
    let payload = payload.unwrap_or_default();

    // Snapshot so handler invocation holds no registry lock.
    let registered: Vec<Arc<dyn EventHandler>> = handlers
        .get(&kind)
        .map(|entry| entry.value().clone())
        .unwrap_or_default();

    for handler in registered {
        if let Err(e) = handler.handle(&kind, payload).await {
            // One bad handler must not stall the group; log and move on.
            warn!(target: "event_bus", event_type = %kind, error = %e, "Handler error");
        }
    }
}

/// Errors whose text signals cancellation or closure end the reader; all
/// others are retried after a backoff.
fn is_shutdown(err: &KafkaError) -> bool {
    let text = err.to_string();
    text.contains("cancel") || text.contains("closed") || text.contains("shut down")
}
