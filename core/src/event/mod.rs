// Event bus client: typed events over Kafka topics.
//
// Two logical topics, *commands* and *status*. Every message carries an
// `event_type` header used for handler dispatch and the event id as its
// partition key; bodies are JSON.

mod consumer;
mod producer;
mod types;

pub use consumer::{Consumer, EventHandler};
pub use producer::{Producer, StatusPublisher};
pub use types::{
    decode, EventKind, EventMeta, EventPayload, ModelStatusEvent, PredictRequestedEvent,
    TrainRequestedEvent, STATUS_KINDS,
};

/// Kafka header carrying the event type string.
pub const EVENT_TYPE_HEADER: &str = "event_type";
