// Log ingestion pipeline: UDP firehose + worker stream in, three stages out.
//
// Every record is (1) admitted to the per-client ring, (2) fanned out to
// live subscribers, (3) accumulated into a per-client store batch. The ring
// and the batch are independent on purpose: a slow store must not
// back-pressure the live path and a dead subscriber must not stall
// persistence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use opentelemetry::metrics::Counter;
use opentelemetry::{global, KeyValue};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::buffer::LogBuffer;
use crate::config::IngestConfig;
use crate::registry::Broadcaster;
use crate::store::Store;
use crate::types::{LogRecord, PushMessage, CLIENT_ID_LEN};
use crate::{Result, TrellisError};

/// Scratch size per datagram; also the maximum accepted frame.
const MAX_DATAGRAM: usize = 64 * 1024;
/// OS receive buffer target for the firehose socket.
const UDP_RECV_BUFFER: usize = 8 * 1024 * 1024;
/// Wall-clock budget for one store batch insert.
const PERSIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Counters for the ingest hot path. Atomic snapshot-able copy plus
/// OpenTelemetry export.
pub struct IngestMetrics {
    logs_received: AtomicU64,
    logs_processed: AtomicU64,
    bytes_received: AtomicU64,
    errors: AtomicU64,
    last_minute_rate: AtomicU64, // f64 bits

    received_counter: Counter<u64>,
    processed_counter: Counter<u64>,
    bytes_counter: Counter<u64>,
    error_counter: Counter<u64>,
}

impl IngestMetrics {
    fn new() -> Self {
        let meter = global::meter("trellis.ingest");

        Self {
            logs_received: AtomicU64::new(0),
            logs_processed: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_minute_rate: AtomicU64::new(0f64.to_bits()),
            received_counter: meter
                .u64_counter("trellis.ingest.logs_received_total")
                .with_description("Log records received on any ingress path")
                .init(),
            processed_counter: meter
                .u64_counter("trellis.ingest.logs_processed_total")
                .with_description("Log records admitted to the pipeline")
                .init(),
            bytes_counter: meter
                .u64_counter("trellis.ingest.bytes_received_total")
                .with_description("Payload bytes received")
                .init(),
            error_counter: meter
                .u64_counter("trellis.ingest.errors_total")
                .with_description("Malformed frames, socket errors and store failures")
                .init(),
        }
    }

    fn record_received(&self, bytes: usize, path: &'static str) {
        self.logs_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.received_counter
            .add(1, &[KeyValue::new("path", path)]);
        self.bytes_counter
            .add(bytes as u64, &[KeyValue::new("path", path)]);
    }

    fn record_processed(&self) {
        self.logs_processed.fetch_add(1, Ordering::Relaxed);
        self.processed_counter.add(1, &[]);
    }

    fn record_error(&self, reason: &'static str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.error_counter
            .add(1, &[KeyValue::new("reason", reason)]);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            logs_received: self.logs_received.load(Ordering::Relaxed),
            logs_processed: self.logs_processed.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_minute_rate: f64::from_bits(self.last_minute_rate.load(Ordering::Relaxed)),
        }
    }
}

/// Copyable view of the ingest counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub logs_received: u64,
    pub logs_processed: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub last_minute_rate: f64,
}

/// The ingestion service. `start` binds the UDP socket and launches the
/// receiver, the batch sweeper and the rate tick; `stop` flushes every
/// pending batch before returning.
pub struct LogIngest {
    cfg: IngestConfig,
    buffer: Arc<LogBuffer>,
    store: Arc<dyn Store>,
    broadcaster: Arc<dyn Broadcaster>,
    batches: Mutex<HashMap<String, Vec<LogRecord>>>,
    metrics: IngestMetrics,
    stop: watch::Sender<bool>,
}

impl LogIngest {
    pub fn new(
        cfg: IngestConfig,
        buffer: Arc<LogBuffer>,
        store: Arc<dyn Store>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            cfg,
            buffer,
            store,
            broadcaster,
            batches: Mutex::new(HashMap::new()),
            metrics: IngestMetrics::new(),
            stop,
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn buffer(&self) -> &Arc<LogBuffer> {
        &self.buffer
    }

    /// Binds the firehose socket and spawns the background tasks. Returns
    /// the bound address (relevant when the configured port is 0).
    pub fn start(self: &Arc<Self>) -> Result<std::net::SocketAddr> {
        let socket = bind_udp(&self.cfg.udp_addr())?;
        let local_addr = socket.local_addr()?;
        info!(target: "ingest", addr = %local_addr, "Log ingest listening");

        let receiver = Arc::clone(self);
        let stop_rx = self.stop.subscribe();
        tokio::spawn(async move {
            receiver.run_udp(socket, stop_rx).await;
        });

        let sweeper = Arc::clone(self);
        let stop_rx = self.stop.subscribe();
        tokio::spawn(async move {
            sweeper.run_flush(stop_rx).await;
        });

        let rates = Arc::clone(self);
        let stop_rx = self.stop.subscribe();
        tokio::spawn(async move {
            rates.run_rate_tick(stop_rx).await;
        });

        Ok(local_addr)
    }

    /// Signals every task to exit and synchronously flushes pending batches.
    pub async fn stop(&self) {
        let _ = self.stop.send(true);
        self.flush_pending().await;
        info!(target: "ingest", "Log ingest stopped");
    }

    /// Runs one record through the pipeline: ring, live fan-out, batch.
    pub async fn ingest_record(self: &Arc<Self>, record: LogRecord) {
        let client_id = record.client_id.clone();

        self.buffer.push(&client_id, record.clone());
        self.broadcaster
            .broadcast_to_client(&client_id, PushMessage::live_log(&record));

        let full_batch = {
            let mut batches = self.batches.lock().expect("batch lock poisoned");
            let batch = batches.entry(client_id.clone()).or_default();
            batch.push(record);
            if batch.len() >= self.cfg.batch_size {
                Some(std::mem::take(batch))
            } else {
                None
            }
        };

        // Threshold reached: hand the batch to the store off the hot path.
        if let Some(batch) = full_batch {
            let ingest = Arc::clone(self);
            tokio::spawn(async move {
                ingest.persist_batch(client_id, batch).await;
            });
        }

        self.metrics.record_processed();
    }

    async fn run_udp(self: Arc<Self>, socket: tokio::net::UdpSocket, mut stop: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        self.metrics.record_received(len, "udp");
                        // Frame: 36 bytes of ASCII client id, then payload.
                        if len <= CLIENT_ID_LEN {
                            self.metrics.record_error("short_frame");
                            warn!(target: "ingest", peer = %peer, len, "Malformed frame, dropping");
                            continue;
                        }
                        let record = LogRecord {
                            timestamp: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
                            client_id: String::from_utf8_lossy(&buf[..CLIENT_ID_LEN]).into_owned(),
                            message: buf[CLIENT_ID_LEN..len].to_vec(),
                            process_id: None,
                        };
                        self.ingest_record(record).await;
                    }
                    Err(e) => {
                        self.metrics.record_error("socket");
                        warn!(target: "ingest", error = %e, "UDP read error");
                    }
                }
            }
        }
        info!(target: "ingest", "UDP receiver exited");
    }

    async fn run_flush(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.cfg.flush_interval_ms));
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    self.flush_pending().await;
                    break;
                }
                _ = ticker.tick() => {
                    self.flush_pending().await;
                }
            }
        }
    }

    /// Persists every pending batch. Failed batches stay queued for the next
    /// sweep; there is no dead-letter path.
    async fn flush_pending(&self) {
        let pending: Vec<(String, Vec<LogRecord>)> = {
            let mut batches = self.batches.lock().expect("batch lock poisoned");
            batches
                .iter_mut()
                .filter(|(_, batch)| !batch.is_empty())
                .map(|(client, batch)| (client.clone(), std::mem::take(batch)))
                .collect()
        };

        for (client_id, batch) in pending {
            self.persist_batch(client_id, batch).await;
        }
    }

    async fn persist_batch(&self, client_id: String, batch: Vec<LogRecord>) {
        let outcome = tokio::time::timeout(PERSIST_TIMEOUT, self.store.batch_insert_logs(&batch))
            .await
            .unwrap_or(Err(TrellisError::StoreTimeout));

        if let Err(e) = outcome {
            self.metrics.record_error("store");
            warn!(
                target: "ingest",
                client_id = %client_id,
                size = batch.len(),
                error = %e,
                "Batch persist failed, retaining for next sweep"
            );
            // Requeue ahead of anything admitted meanwhile to keep order.
            let mut batches = self.batches.lock().expect("batch lock poisoned");
            let current = batches.entry(client_id).or_default();
            let newer = std::mem::take(current);
            *current = batch;
            current.extend(newer);
        }
    }

    async fn run_rate_tick(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.tick().await; // first tick fires immediately
        let mut last_processed = self.metrics.logs_processed.load(Ordering::Relaxed);
        let mut last_instant = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {
                    let processed = self.metrics.logs_processed.load(Ordering::Relaxed);
                    let elapsed = last_instant.elapsed().as_secs_f64();
                    if elapsed > 0.0 {
                        let rate = (processed - last_processed) as f64 / elapsed;
                        self.metrics
                            .last_minute_rate
                            .store(rate.to_bits(), Ordering::Relaxed);
                    }
                    last_processed = processed;
                    last_instant = tokio::time::Instant::now();

                    let snapshot = self.metrics.snapshot();
                    info!(
                        target: "ingest",
                        received = snapshot.logs_received,
                        processed = snapshot.logs_processed,
                        rate = snapshot.last_minute_rate,
                        errors = snapshot.errors,
                        "Ingest metrics"
                    );
                }
            }
        }
    }
}

fn bind_udp(addr: &str) -> Result<tokio::net::UdpSocket> {
    let addr: std::net::SocketAddr = addr
        .parse()
        .map_err(|e| TrellisError::Config(format!("invalid UDP address {addr}: {e}")))?;

    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    if let Err(e) = socket.set_recv_buffer_size(UDP_RECV_BUFFER) {
        warn!(target: "ingest", error = %e, "Failed to raise UDP read buffer");
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    Ok(tokio::net::UdpSocket::from_std(socket.into())?)
}
