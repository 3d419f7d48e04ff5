// Shared fakes for component tests: an in-memory store, a recording
// broadcaster and a channel-backed push sink.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use trellis_core::registry::{Broadcaster, PushSink};
use trellis_core::store::{ClientLogStats, Store, TimeBucket};
use trellis_core::types::{LogRecord, ModelStatus, PushMessage};
use trellis_core::{Result, TrellisError};

/// In-memory `Store` with a programmable insert-failure budget.
#[derive(Default)]
pub struct MemStore {
    pub logs: Mutex<Vec<LogRecord>>,
    pub statuses: Mutex<HashMap<String, ModelStatus>>,
    /// Number of upcoming `batch_insert_logs` calls that fail.
    pub fail_inserts: AtomicUsize,
    pub insert_calls: AtomicUsize,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_logs(logs: Vec<LogRecord>) -> Self {
        let store = Self::default();
        *store.logs.lock().unwrap() = logs;
        store
    }

    pub fn seed_status(&self, status: ModelStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(status.client_id.clone(), status);
    }

    pub fn stored_logs(&self) -> Vec<LogRecord> {
        self.logs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn fetch_logs(
        &self,
        client_id: &str,
        from_ns: i64,
        to_ns: i64,
        limit: i64,
    ) -> Result<Vec<LogRecord>> {
        let mut matching: Vec<LogRecord> = self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| {
                log.client_id == client_id && log.timestamp >= from_ns && log.timestamp <= to_ns
            })
            .cloned()
            .collect();
        matching.sort_by_key(|log| std::cmp::Reverse(log.timestamp));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn batch_insert_logs(&self, logs: &[LogRecord]) -> Result<()> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        let failures = self.fail_inserts.load(Ordering::SeqCst);
        if failures > 0 {
            self.fail_inserts.store(failures - 1, Ordering::SeqCst);
            return Err(TrellisError::StoreTimeout);
        }
        self.logs.lock().unwrap().extend_from_slice(logs);
        Ok(())
    }

    async fn update_model_status(&self, status: &ModelStatus) -> Result<()> {
        self.statuses
            .lock()
            .unwrap()
            .insert(status.client_id.clone(), status.clone());
        Ok(())
    }

    async fn get_model_status(&self, client_id: &str) -> Result<ModelStatus> {
        self.statuses
            .lock()
            .unwrap()
            .get(client_id)
            .cloned()
            .ok_or_else(|| TrellisError::NotFound(format!("no status for client {client_id}")))
    }

    async fn get_all_model_statuses(&self) -> Result<Vec<ModelStatus>> {
        let mut statuses: Vec<ModelStatus> =
            self.statuses.lock().unwrap().values().cloned().collect();
        statuses.sort_by_key(|s| std::cmp::Reverse(s.timestamp));
        Ok(statuses)
    }

    async fn count_client_logs(
        &self,
        client_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64> {
        let from_ns = from.timestamp_nanos_opt().unwrap_or(i64::MIN);
        let to_ns = to.timestamp_nanos_opt().unwrap_or(i64::MAX);
        let count = self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| {
                log.client_id == client_id && log.timestamp >= from_ns && log.timestamp <= to_ns
            })
            .count();
        Ok(count as i64)
    }

    async fn get_log_counts_by_level(
        &self,
        client_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<HashMap<String, i64>> {
        let count = self.count_client_logs(client_id, from, to).await?;
        let mut counts = HashMap::new();
        if count > 0 {
            counts.insert("INFO".to_string(), count);
        }
        Ok(counts)
    }

    async fn get_log_rate_over_time(
        &self,
        client_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        _buckets: u32,
    ) -> Result<Vec<TimeBucket>> {
        let count = self.count_client_logs(client_id, from, to).await?;
        if count == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![TimeBucket {
            timestamp: from,
            count,
        }])
    }

    async fn get_client_log_stats(&self, client_id: &str) -> Result<ClientLogStats> {
        let logs = self.logs.lock().unwrap();
        let timestamps: Vec<i64> = logs
            .iter()
            .filter(|log| log.client_id == client_id)
            .map(|log| log.timestamp)
            .collect();
        drop(logs);

        let (Some(&first), Some(&last)) = (timestamps.iter().min(), timestamps.iter().max())
        else {
            return Err(TrellisError::NotFound(format!(
                "no logs for client {client_id}"
            )));
        };

        let duration_seconds = (last - first) as f64 / 1e9;
        let total_logs = timestamps.len() as i64;
        Ok(ClientLogStats {
            total_logs,
            first_log_time: DateTime::from_timestamp_nanos(first),
            last_log_time: DateTime::from_timestamp_nanos(last),
            duration_seconds,
            logs_per_second: if duration_seconds > 0.0 {
                total_logs as f64 / duration_seconds
            } else {
                0.0
            },
        })
    }
}

/// Broadcaster that records every message instead of delivering it.
#[derive(Default)]
pub struct RecordingBroadcaster {
    pub messages: Mutex<Vec<(String, PushMessage)>>,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_client(&self, client_id: &str) -> Vec<PushMessage> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(client, _)| client == client_id)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn broadcast_to_client(&self, client_id: &str, message: PushMessage) {
        self.messages
            .lock()
            .unwrap()
            .push((client_id.to_string(), message));
    }

    fn broadcast_to_all(&self, message: PushMessage) {
        self.messages
            .lock()
            .unwrap()
            .push(("*".to_string(), message));
    }
}

/// Push sink delivering into an unbounded channel, with a failure switch.
pub struct ChannelSink {
    tx: tokio::sync::mpsc::UnboundedSender<PushMessage>,
    pub fail: AtomicBool,
    pub closed: AtomicBool,
}

impl ChannelSink {
    pub fn new() -> (
        std::sync::Arc<Self>,
        tokio::sync::mpsc::UnboundedReceiver<PushMessage>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (
            std::sync::Arc::new(Self {
                tx,
                fail: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
            rx,
        )
    }
}

#[async_trait]
impl PushSink for ChannelSink {
    async fn send(&self, message: &PushMessage) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TrellisError::SubscriberWrite("sink failed".to_string()));
        }
        self.tx
            .send(message.clone())
            .map_err(|e| TrellisError::SubscriberWrite(e.to_string()))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A 36-character client id in the canonical UUID shape.
pub fn client_id(tag: u8) -> String {
    format!("00000000-0000-0000-0000-0000000000{tag:02x}")
}

pub fn record(client: &str, timestamp: i64, payload: &[u8]) -> LogRecord {
    LogRecord {
        timestamp,
        client_id: client.to_string(),
        message: payload.to_vec(),
        process_id: None,
    }
}
