// Kafka producer for command and status events.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::util::Timeout;
use tracing::{debug, warn};

use crate::config::KafkaConfig;
use crate::event::types::{
    EventKind, EventMeta, ModelStatusEvent, PredictRequestedEvent, TrainRequestedEvent,
};
use crate::event::EVENT_TYPE_HEADER;
use crate::types::{JobConfig, ProcessType};
use crate::{Result, TrellisError};

/// Narrow capability for emitting status events, so components that only
/// report transitions do not hold the full producer surface.
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish_model_status(
        &self,
        kind: EventKind,
        client_id: &str,
        status: &str,
        message: &str,
        process_type: ProcessType,
        progress: i32,
    ) -> Result<()>;
}

/// Publishes typed events onto the command and status topics.
pub struct Producer {
    producer: FutureProducer,
    command_topic: String,
    status_topic: String,
}

impl Producer {
    pub fn new(cfg: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", cfg.broker_list())
            .set("message.timeout.ms", "10000")
            .create()
            .map_err(|e| TrellisError::BusFatal(e.to_string()))?;

        Ok(Self {
            producer,
            command_topic: cfg.command_topic.clone(),
            status_topic: cfg.status_topic.clone(),
        })
    }

    /// Publishes a `train.requested` command; returns the event id.
    pub async fn publish_train_request(
        &self,
        client_id: &str,
        data: Vec<f64>,
        start_date: String,
        end_date: String,
        configuration: Option<JobConfig>,
    ) -> Result<String> {
        let event = TrainRequestedEvent {
            meta: EventMeta::new(EventKind::TrainRequested, client_id),
            data,
            start_date,
            end_date,
            configuration,
        };
        let id = event.meta.id.clone();
        self.publish(
            &self.command_topic,
            EventKind::TrainRequested,
            &id,
            serde_json::to_vec(&event)?,
        )
        .await?;
        Ok(id)
    }

    /// Publishes a `predict.requested` command; returns the event id.
    pub async fn publish_predict_request(
        &self,
        client_id: &str,
        data: Vec<f64>,
        configuration: Option<JobConfig>,
    ) -> Result<String> {
        let event = PredictRequestedEvent {
            meta: EventMeta::new(EventKind::PredictRequested, client_id),
            data,
            configuration,
        };
        let id = event.meta.id.clone();
        self.publish(
            &self.command_topic,
            EventKind::PredictRequested,
            &id,
            serde_json::to_vec(&event)?,
        )
        .await?;
        Ok(id)
    }

    async fn publish(
        &self,
        topic: &str,
        kind: EventKind,
        event_id: &str,
        body: Vec<u8>,
    ) -> Result<()> {
        debug!(
            target: "event_bus",
            topic = %topic,
            event_id = %event_id,
            event_type = %kind,
            "Publishing event"
        );

        // Event id is the partition key; the type string rides in a header.
        let record = FutureRecord::to(topic)
            .key(event_id)
            .payload(body.as_slice())
            .headers(OwnedHeaders::new().insert(Header {
                key: EVENT_TYPE_HEADER,
                value: Some(kind.as_str()),
            }));

        self.producer
            .send(record, Timeout::After(Duration::from_secs(5)))
            .await
            .map_err(|(err, _msg)| classify(err))?;
        Ok(())
    }

    /// Flushes in-flight deliveries; call once on shutdown.
    pub fn close(&self) {
        if let Err(e) = self.producer.flush(Timeout::After(Duration::from_secs(5))) {
            warn!(target: "event_bus", error = %e, "Producer flush failed during close");
        }
    }
}

#[async_trait]
impl StatusPublisher for Producer {
    async fn publish_model_status(
        &self,
        kind: EventKind,
        client_id: &str,
        status: &str,
        message: &str,
        process_type: ProcessType,
        progress: i32,
    ) -> Result<()> {
        let event = ModelStatusEvent {
            meta: EventMeta::new(kind, client_id),
            status: status.to_string(),
            message: message.to_string(),
            process_type,
            progress,
        };
        let id = event.meta.id.clone();
        self.publish(&self.status_topic, kind, &id, serde_json::to_vec(&event)?)
            .await
    }
}

/// Splits producer failures into retryable and fatal per the error model.
fn classify(err: KafkaError) -> TrellisError {
    let transient = matches!(
        err,
        KafkaError::MessageProduction(
            RDKafkaErrorCode::QueueFull
                | RDKafkaErrorCode::MessageTimedOut
                | RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::AllBrokersDown
        )
    );
    if transient {
        TrellisError::BusTransient(err.to_string())
    } else {
        TrellisError::BusFatal(err.to_string())
    }
}
