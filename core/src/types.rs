// Shared data model: log records, model status, push-channel envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed width of the ASCII client id prefix on the wire (UDP frames) and in
/// every identifier the backend tracks.
pub const CLIENT_ID_LEN: usize = 36;

/// Job kind a worker process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessType {
    Train,
    Predict,
}

impl ProcessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessType::Train => "train",
            ProcessType::Predict => "predict",
        }
    }
}

impl std::fmt::Display for ProcessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(ProcessType::Train),
            "predict" => Ok(ProcessType::Predict),
            other => Err(format!("unknown process type: {other}")),
        }
    }
}

/// Lifecycle state of a model run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
        }
    }

    /// Terminal states move a run from *running* into history.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Error)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "error" => Ok(RunStatus::Error),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// A single ingested log record. Immutable once created.
///
/// `timestamp` is unix nanoseconds assigned at receipt on the backend (UDP
/// path) or by the worker (stream path). `message` is opaque bytes and is
/// base64 on the JSON wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: i64,
    pub client_id: String,
    #[serde(with = "base64_bytes")]
    pub message: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<i32>,
}

/// Current status row per client, mirrored in the `model_status` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStatus {
    pub client_id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub process_type: ProcessType,
}

/// Derived per-client statistics, refreshed on a timer by the status view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelStats {
    pub average_runtime: f64,
    pub total_runs: usize,
    pub success_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_time: Option<DateTime<Utc>>,
    pub average_log_count: f64,
}

/// In-memory projection of one model run, owned by the status view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub client_id: String,
    pub status: RunStatus,
    pub process_type: ProcessType,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub runtime_seconds: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<JobConfig>,
    #[serde(default)]
    pub stats: ModelStats,
    pub log_count: i64,
    pub error_count: i64,
    pub warning_count: i64,
}

impl ModelState {
    pub fn new(
        client_id: String,
        status: RunStatus,
        process_type: ProcessType,
        start_time: DateTime<Utc>,
        message: String,
    ) -> Self {
        Self {
            client_id,
            status,
            process_type,
            start_time,
            end_time: None,
            runtime_seconds: 0.0,
            message,
            config: None,
            stats: ModelStats::default(),
            log_count: 0,
            error_count: 0,
            warning_count: 0,
        }
    }
}

/// Recognized job configuration shapes, with an opaque fallback that
/// preserves unknown payloads byte-for-byte so they can be forwarded to the
/// worker without re-parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobConfig {
    Pipeline(PipelineConfig),
    Opaque(serde_json::Value),
}

/// The forecasting pipeline's own configuration knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub feature_engineering: bool,
    pub detrend: bool,
    pub difference: bool,
}

/// Body of `POST /api/model/train`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainRequest {
    pub client_id: String,
    #[serde(default)]
    pub data: Vec<f64>,
    #[serde(default)]
    pub start_date: String,
    #[serde(default)]
    pub end_date: String,
    #[serde(default, rename = "config", skip_serializing_if = "Option::is_none")]
    pub configuration: Option<JobConfig>,
}

/// Body of `POST /api/model/predict`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictRequest {
    pub client_id: String,
    #[serde(default)]
    pub data: Vec<f64>,
    #[serde(default, rename = "config", skip_serializing_if = "Option::is_none")]
    pub configuration: Option<JobConfig>,
}

/// Payload handed to the worker's StartProcess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    #[serde(rename = "type")]
    pub kind: ProcessType,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<f64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub start_date: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub end_date: String,
    #[serde(default, rename = "config", skip_serializing_if = "Option::is_none")]
    pub configuration: Option<JobConfig>,
}

/// 202 body returned when a command was accepted onto the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAccepted {
    pub client_id: String,
    pub status: RunStatus,
    pub message: String,
}

/// Message kinds on the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushKind {
    LiveLog,
    ModelStatus,
    HistoryRequest,
    Error,
}

/// Envelope for every message on a push connection, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(rename = "type")]
    pub kind: PushKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl PushMessage {
    pub fn live_log(record: &LogRecord) -> Self {
        Self {
            kind: PushKind::LiveLog,
            payload: serde_json::to_value(record).ok(),
            request_id: None,
        }
    }

    pub fn live_log_batch(records: &[LogRecord], request_id: Option<String>) -> Self {
        Self {
            kind: PushKind::LiveLog,
            payload: serde_json::to_value(records).ok(),
            request_id,
        }
    }

    pub fn model_status(status: &ModelStatus) -> Self {
        Self {
            kind: PushKind::ModelStatus,
            payload: serde_json::to_value(status).ok(),
            request_id: None,
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            kind: PushKind::Error,
            payload: Some(serde_json::json!({ "error": message })),
            request_id: None,
        }
    }
}

/// Inbound history backfill request; timestamps are unix nanoseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRequest {
    #[serde(default)]
    pub from_timestamp: i64,
    #[serde(default)]
    pub to_timestamp: i64,
    #[serde(default)]
    pub limit: i64,
}

/// Serde adapter encoding opaque byte payloads as base64 strings in JSON.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
