// Event type definitions and JSON codec.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{JobConfig, ProcessType};
use crate::Result;

/// The closed set of event types the backend understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    // Command topic
    TrainRequested,
    PredictRequested,
    // Status topic
    ModelStarted,
    ModelCompleted,
    ModelFailed,
    ModelProgress,
}

/// Every status-topic kind, in one place for subscription loops.
pub const STATUS_KINDS: [EventKind; 4] = [
    EventKind::ModelStarted,
    EventKind::ModelCompleted,
    EventKind::ModelFailed,
    EventKind::ModelProgress,
];

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TrainRequested => "train.requested",
            EventKind::PredictRequested => "predict.requested",
            EventKind::ModelStarted => "model.started",
            EventKind::ModelCompleted => "model.completed",
            EventKind::ModelFailed => "model.failed",
            EventKind::ModelProgress => "model.progress",
        }
    }

    pub fn parse(s: &str) -> Option<EventKind> {
        match s {
            "train.requested" => Some(EventKind::TrainRequested),
            "predict.requested" => Some(EventKind::PredictRequested),
            "model.started" => Some(EventKind::ModelStarted),
            "model.completed" => Some(EventKind::ModelCompleted),
            "model.failed" => Some(EventKind::ModelFailed),
            "model.progress" => Some(EventKind::ModelProgress),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope fields common to all events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub client_id: String,
}

impl EventMeta {
    /// Fresh envelope with a v4 id and the current time.
    pub fn new(kind: EventKind, client_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.as_str().to_string(),
            timestamp: Utc::now(),
            client_id: client_id.to_string(),
        }
    }
}

/// `train.requested` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainRequestedEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<f64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub start_date: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub end_date: String,
    #[serde(default, rename = "config", skip_serializing_if = "Option::is_none")]
    pub configuration: Option<JobConfig>,
}

/// `predict.requested` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictRequestedEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<f64>,
    #[serde(default, rename = "config", skip_serializing_if = "Option::is_none")]
    pub configuration: Option<JobConfig>,
}

/// Shared body for the four status-topic kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStatusEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub process_type: ProcessType,
    #[serde(default, skip_serializing_if = "progress_is_zero")]
    pub progress: i32,
}

fn progress_is_zero(p: &i32) -> bool {
    *p == 0
}

/// A decoded event body, dispatched by the type header.
///
/// Unknown types land in `Unknown` as an opaque map; nothing subscribes to
/// them by default, so they are effectively skipped.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    TrainRequested(TrainRequestedEvent),
    PredictRequested(PredictRequestedEvent),
    ModelStatus(ModelStatusEvent),
    Unknown(serde_json::Map<String, serde_json::Value>),
}

/// Deserializes `data` into the body matching `kind`.
pub fn decode(kind: &str, data: &[u8]) -> Result<EventPayload> {
    let payload = match EventKind::parse(kind) {
        Some(EventKind::TrainRequested) => {
            EventPayload::TrainRequested(serde_json::from_slice(data)?)
        }
        Some(EventKind::PredictRequested) => {
            EventPayload::PredictRequested(serde_json::from_slice(data)?)
        }
        Some(
            EventKind::ModelStarted
            | EventKind::ModelCompleted
            | EventKind::ModelFailed
            | EventKind::ModelProgress,
        ) => EventPayload::ModelStatus(serde_json::from_slice(data)?),
        None => EventPayload::Unknown(serde_json::from_slice(data)?),
    };
    Ok(payload)
}
