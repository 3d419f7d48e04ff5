// Orchestrator: turns command events into worker process starts.
//
// Owns only the *start* transition. Terminal transitions arrive from the
// worker itself over the status topic. Duplicate commands (at-least-once
// delivery) may start a worker twice; the worker is required to be
// start-idempotent per client.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::event::{
    decode, EventHandler, EventKind, EventPayload, PredictRequestedEvent, StatusPublisher,
    TrainRequestedEvent,
};
use crate::types::{ProcessType, WorkerRequest};
use crate::worker::ProcessLauncher;
use crate::Result;

pub struct Orchestrator {
    launcher: Arc<dyn ProcessLauncher>,
    publisher: Arc<dyn StatusPublisher>,
}

impl Orchestrator {
    pub fn new(launcher: Arc<dyn ProcessLauncher>, publisher: Arc<dyn StatusPublisher>) -> Self {
        Self { launcher, publisher }
    }

    async fn handle_train(&self, event: TrainRequestedEvent) -> Result<()> {
        let request = WorkerRequest {
            kind: ProcessType::Train,
            client_id: event.meta.client_id.clone(),
            data: event.data,
            start_date: event.start_date,
            end_date: event.end_date,
            configuration: event.configuration,
        };
        self.launch(&event.meta.client_id, ProcessType::Train, request)
            .await
    }

    async fn handle_predict(&self, event: PredictRequestedEvent) -> Result<()> {
        let request = WorkerRequest {
            kind: ProcessType::Predict,
            client_id: event.meta.client_id.clone(),
            data: event.data,
            start_date: String::new(),
            end_date: String::new(),
            configuration: event.configuration,
        };
        self.launch(&event.meta.client_id, ProcessType::Predict, request)
            .await
    }

    async fn launch(
        &self,
        client_id: &str,
        process_type: ProcessType,
        request: WorkerRequest,
    ) -> Result<()> {
        let payload = serde_json::to_vec(&request)?;

        match self.launcher.start_process(client_id, payload).await {
            Ok(ack) => {
                info!(
                    target: "orchestrator",
                    client_id = %client_id,
                    process_type = %process_type,
                    status = %ack.status,
                    "Worker process started"
                );
                self.publisher
                    .publish_model_status(
                        EventKind::ModelStarted,
                        client_id,
                        &ack.status,
                        &format!("{process_type} process started"),
                        process_type,
                        0,
                    )
                    .await
            }
            Err(e) => {
                warn!(
                    target: "orchestrator",
                    client_id = %client_id,
                    process_type = %process_type,
                    error = %e,
                    "Worker start failed"
                );
                self.publisher
                    .publish_model_status(
                        EventKind::ModelFailed,
                        client_id,
                        "error",
                        &format!("failed to start {process_type}: {e}"),
                        process_type,
                        0,
                    )
                    .await?;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl EventHandler for Orchestrator {
    async fn handle(&self, kind: &str, payload: &[u8]) -> Result<()> {
        match decode(kind, payload)? {
            EventPayload::TrainRequested(event) => self.handle_train(event).await,
            EventPayload::PredictRequested(event) => self.handle_predict(event).await,
            _ => Ok(()),
        }
    }
}
