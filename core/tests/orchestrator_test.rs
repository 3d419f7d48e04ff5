mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::client_id;
use trellis_core::event::{
    EventHandler, EventKind, EventMeta, PredictRequestedEvent, StatusPublisher,
    TrainRequestedEvent,
};
use trellis_core::types::{JobConfig, ProcessType, WorkerRequest};
use trellis_core::worker::ProcessLauncher;
use trellis_core::{Orchestrator, Result, TrellisError};
use trellis_proto::ProcessAck;

/// Records start calls; optionally refuses them.
#[derive(Default)]
struct FakeLauncher {
    calls: Mutex<Vec<(String, Vec<u8>)>>,
    fail: AtomicBool,
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn start_process(&self, client_id: &str, payload: Vec<u8>) -> Result<ProcessAck> {
        self.calls
            .lock()
            .unwrap()
            .push((client_id.to_string(), payload));
        if self.fail.load(Ordering::SeqCst) {
            return Err(TrellisError::WorkerRpc(tonic::Status::unavailable(
                "worker offline",
            )));
        }
        Ok(ProcessAck {
            status: "running".to_string(),
            message: "accepted".to_string(),
        })
    }
}

/// Records published status events.
#[derive(Default)]
struct FakePublisher {
    published: Mutex<Vec<(EventKind, String, String, ProcessType)>>,
}

#[async_trait]
impl StatusPublisher for FakePublisher {
    async fn publish_model_status(
        &self,
        kind: EventKind,
        client_id: &str,
        status: &str,
        _message: &str,
        process_type: ProcessType,
        _progress: i32,
    ) -> Result<()> {
        self.published.lock().unwrap().push((
            kind,
            client_id.to_string(),
            status.to_string(),
            process_type,
        ));
        Ok(())
    }
}

fn orchestrator() -> (Orchestrator, Arc<FakeLauncher>, Arc<FakePublisher>) {
    let launcher = Arc::new(FakeLauncher::default());
    let publisher = Arc::new(FakePublisher::default());
    (
        Orchestrator::new(Arc::clone(&launcher) as _, Arc::clone(&publisher) as _),
        launcher,
        publisher,
    )
}

fn train_event(client: &str) -> Vec<u8> {
    let event = TrainRequestedEvent {
        meta: EventMeta::new(EventKind::TrainRequested, client),
        data: vec![1.0, 2.0, 3.0],
        start_date: "2024-01-01".to_string(),
        end_date: "2024-03-01".to_string(),
        configuration: Some(JobConfig::Opaque(serde_json::json!({"epochs": 12}))),
    };
    serde_json::to_vec(&event).unwrap()
}

#[tokio::test]
async fn train_request_starts_worker_and_publishes_started() {
    let (orchestrator, launcher, publisher) = orchestrator();
    let client = client_id(40);

    orchestrator
        .handle(EventKind::TrainRequested.as_str(), &train_event(&client))
        .await
        .unwrap();

    let calls = launcher.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, client);

    // The worker payload carries the full request, config included.
    let request: WorkerRequest = serde_json::from_slice(&calls[0].1).unwrap();
    assert_eq!(request.kind, ProcessType::Train);
    assert_eq!(request.data, vec![1.0, 2.0, 3.0]);
    assert_eq!(
        request.configuration,
        Some(JobConfig::Opaque(serde_json::json!({"epochs": 12})))
    );

    let published = publisher.published.lock().unwrap();
    assert_eq!(published.len(), 1);
    let (kind, event_client, status, process_type) = &published[0];
    assert_eq!(*kind, EventKind::ModelStarted);
    assert_eq!(event_client, &client);
    assert_eq!(status, "running");
    assert_eq!(*process_type, ProcessType::Train);
}

#[tokio::test]
async fn predict_request_is_symmetric() {
    let (orchestrator, launcher, publisher) = orchestrator();
    let client = client_id(41);

    let event = PredictRequestedEvent {
        meta: EventMeta::new(EventKind::PredictRequested, &client),
        data: vec![4.5],
        configuration: None,
    };
    orchestrator
        .handle(
            EventKind::PredictRequested.as_str(),
            &serde_json::to_vec(&event).unwrap(),
        )
        .await
        .unwrap();

    let calls = launcher.calls.lock().unwrap();
    let request: WorkerRequest = serde_json::from_slice(&calls[0].1).unwrap();
    assert_eq!(request.kind, ProcessType::Predict);

    let published = publisher.published.lock().unwrap();
    assert_eq!(published[0].0, EventKind::ModelStarted);
    assert_eq!(published[0].3, ProcessType::Predict);
}

#[tokio::test]
async fn worker_failure_publishes_model_failed() {
    let (orchestrator, launcher, publisher) = orchestrator();
    launcher.fail.store(true, Ordering::SeqCst);
    let client = client_id(42);

    let result = orchestrator
        .handle(EventKind::TrainRequested.as_str(), &train_event(&client))
        .await;
    // The error surfaces to the consumer, which logs and moves on.
    assert!(result.is_err());

    let published = publisher.published.lock().unwrap();
    assert_eq!(published.len(), 1);
    let (kind, event_client, status, process_type) = &published[0];
    assert_eq!(*kind, EventKind::ModelFailed);
    assert_eq!(event_client, &client);
    assert_eq!(status, "error");
    assert_eq!(*process_type, ProcessType::Train);
}

#[tokio::test]
async fn status_events_are_not_handled_by_the_orchestrator() {
    let (orchestrator, launcher, publisher) = orchestrator();

    let body = serde_json::json!({
        "id": "e1",
        "type": "model.progress",
        "timestamp": "2024-01-01T00:00:00Z",
        "client_id": client_id(43),
        "status": "running",
        "process_type": "train",
    });
    orchestrator
        .handle("model.progress", &serde_json::to_vec(&body).unwrap())
        .await
        .unwrap();

    assert!(launcher.calls.lock().unwrap().is_empty());
    assert!(publisher.published.lock().unwrap().is_empty());
}
