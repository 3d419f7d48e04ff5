// Trellis core library
// Event fabric between job clients, compute workers and durable storage

pub mod buffer;
pub mod config;
pub mod event;
pub mod ingest;
pub mod orchestrator;
pub mod registry; // Subscriber registry & push fan-out
pub mod store;
pub mod telemetry;
pub mod types;
pub mod view; // Materialized status view & query surface
pub mod worker;

// Export core types
pub use buffer::LogBuffer;
pub use event::{Consumer, EventHandler, EventKind, EventPayload, Producer, StatusPublisher};
pub use ingest::{IngestMetrics, LogIngest, MetricsSnapshot};
pub use orchestrator::Orchestrator;
pub use registry::{Broadcaster, PushSink, StatusFanout, Subscriber, SubscriberRegistry};
pub use store::{PgStore, Store};
pub use types::{LogRecord, ModelState, ModelStatus, ProcessType, PushMessage, RunStatus};
pub use view::{QueryFilter, StatusView};
pub use worker::{ProcessLauncher, WorkerClient};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrellisError {
    /// Publish or consume failure worth retrying (broker hiccup, full queue).
    #[error("transient bus error: {0}")]
    BusTransient(String),

    /// Bus misconfiguration; retrying will not help.
    #[error("bus error: {0}")]
    BusFatal(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("store call exceeded its deadline")]
    StoreTimeout,

    #[error("worker rpc error: {0}")]
    WorkerRpc(#[from] tonic::Status),

    #[error("worker transport error: {0}")]
    WorkerTransport(#[from] tonic::transport::Error),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("subscriber write failed: {0}")]
    SubscriberWrite(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TrellisError {
    /// True for errors the caller should retry on its next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, TrellisError::BusTransient(_))
    }
}

pub type Result<T> = std::result::Result<T, TrellisError>;
