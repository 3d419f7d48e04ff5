// Worker RPC client: job start calls and the long-lived log stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tonic::transport::Channel;
use tracing::{info, warn};

use trellis_proto::process_service_client::ProcessServiceClient;
use trellis_proto::{LogStreamRequest, ProcessAck, StartProcessRequest};

use crate::ingest::LogIngest;
use crate::types::LogRecord;
use crate::Result;

/// Narrow capability for starting worker processes; the orchestrator holds
/// this instead of the concrete client.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn start_process(&self, client_id: &str, payload: Vec<u8>) -> Result<ProcessAck>;
}

/// gRPC client for the worker ProcessService.
pub struct WorkerClient {
    client: ProcessServiceClient<Channel>,
}

impl WorkerClient {
    /// Builds a client on a lazy channel; the connection is established on
    /// first use so the backend can come up before the worker does.
    pub fn connect(addr: String) -> Result<Self> {
        let channel = tonic::transport::Endpoint::from_shared(addr)?.connect_lazy();
        Ok(Self {
            client: ProcessServiceClient::new(channel),
        })
    }

    /// Spawns the log intake task: one logical stream, reopened one second
    /// after any error. Records in flight at a break may be lost; the worker
    /// resends from its own buffer if it needs durability.
    pub fn spawn_log_intake(
        &self,
        ingest: Arc<LogIngest>,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mut client = self.client.clone();
        tokio::spawn(async move {
            loop {
                if *stop.borrow() {
                    break;
                }

                let request = LogStreamRequest {
                    client_id: String::new(),
                };
                let mut stream = match client.stream_logs(request).await {
                    Ok(response) => response.into_inner(),
                    Err(status) => {
                        warn!(target: "worker", error = %status, "Log stream open failed, retrying");
                        tokio::select! {
                            _ = stop.changed() => break,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                        }
                    }
                };

                loop {
                    tokio::select! {
                        _ = stop.changed() => return,
                        message = stream.message() => match message {
                            Ok(Some(line)) => {
                                ingest.ingest_record(LogRecord {
                                    timestamp: line.timestamp,
                                    client_id: line.client_id,
                                    message: line.message,
                                    process_id: Some(line.process_id),
                                }).await;
                            }
                            Ok(None) => {
                                info!(target: "worker", "Log stream ended, reopening");
                                break;
                            }
                            Err(status) => {
                                warn!(target: "worker", error = %status, "Log stream error, reopening");
                                break;
                            }
                        }
                    }
                }

                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
            info!(target: "worker", "Log intake exited");
        })
    }
}

#[async_trait]
impl ProcessLauncher for WorkerClient {
    async fn start_process(&self, client_id: &str, payload: Vec<u8>) -> Result<ProcessAck> {
        let mut client = self.client.clone();
        let response = client
            .start_process(StartProcessRequest {
                client_id: client_id.to_string(),
                payload,
            })
            .await?;
        Ok(response.into_inner())
    }
}
