// Component assembly and the HTTP server lifecycle.

use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use trellis_core::config::Config;
use trellis_core::event::{Consumer, EventKind, Producer, STATUS_KINDS};
use trellis_core::ingest::LogIngest;
use trellis_core::registry::{Broadcaster, StatusFanout, SubscriberRegistry};
use trellis_core::store::{PgStore, Store};
use trellis_core::view::StatusView;
use trellis_core::worker::WorkerClient;
use trellis_core::{LogBuffer, Orchestrator, Result};

use crate::{handlers, ws};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub producer: Arc<Producer>,
    pub store: Arc<dyn Store>,
    pub view: Arc<StatusView>,
    pub registry: SubscriberRegistry,
}

/// The assembled backend: every core component plus the HTTP surface.
pub struct Gateway {
    cfg: Config,
    store: Arc<dyn Store>,
    producer: Arc<Producer>,
    command_consumer: Consumer,
    status_consumer: Consumer,
    registry: SubscriberRegistry,
    view: Arc<StatusView>,
    ingest: Arc<LogIngest>,
    worker: Arc<WorkerClient>,
    stop: watch::Sender<bool>,
}

impl Gateway {
    pub async fn new(cfg: Config) -> Result<Self> {
        let pg = PgStore::connect(&cfg.store).await?;
        pg.init_schema().await?;
        let store: Arc<dyn Store> = Arc::new(pg);

        let buffer = Arc::new(LogBuffer::new(cfg.ingest.buffer_size));
        let producer = Arc::new(Producer::new(&cfg.kafka)?);

        let registry = SubscriberRegistry::new(Arc::clone(&buffer), Arc::clone(&store));
        let broadcaster: Arc<dyn Broadcaster> = Arc::new(registry.clone());

        let ingest = Arc::new(LogIngest::new(
            cfg.ingest.clone(),
            Arc::clone(&buffer),
            Arc::clone(&store),
            Arc::clone(&broadcaster),
        ));

        let worker = Arc::new(WorkerClient::connect(cfg.worker.addr.clone())?);
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&worker) as _,
            Arc::clone(&producer) as _,
        ));

        let view = Arc::new(StatusView::new(Arc::clone(&store)));
        let fanout = Arc::new(StatusFanout::new(Arc::clone(&broadcaster)));

        // Each consumer group receives its topic's full stream independently.
        let command_consumer = Consumer::new(
            &cfg.kafka,
            format!("{}-command", cfg.kafka.consumer_group),
            cfg.kafka.command_topic.clone(),
        );
        command_consumer.subscribe(
            EventKind::TrainRequested.as_str(),
            Arc::clone(&orchestrator) as _,
        );
        command_consumer.subscribe(
            EventKind::PredictRequested.as_str(),
            Arc::clone(&orchestrator) as _,
        );

        let status_consumer = Consumer::new(
            &cfg.kafka,
            format!("{}-status", cfg.kafka.consumer_group),
            cfg.kafka.status_topic.clone(),
        );
        for kind in STATUS_KINDS {
            status_consumer.subscribe(kind.as_str(), Arc::clone(&view) as _);
            status_consumer.subscribe(kind.as_str(), Arc::clone(&fanout) as _);
        }

        let (stop, _) = watch::channel(false);

        Ok(Self {
            cfg,
            store,
            producer,
            command_consumer,
            status_consumer,
            registry,
            view,
            ingest,
            worker,
            stop,
        })
    }

    /// Starts every background component.
    pub async fn start(&self) -> Result<()> {
        if let Err(e) = self.view.warm_start().await {
            warn!(target: "gateway", error = %e, "View warm start failed, starting cold");
        }
        self.view.spawn_stats_refresh();

        self.command_consumer.start()?;
        self.status_consumer.start()?;
        self.ingest.start()?;
        self.worker
            .spawn_log_intake(Arc::clone(&self.ingest), self.stop.subscribe());

        info!(target: "gateway", "Backend components started");
        Ok(())
    }

    fn router(&self) -> Router {
        let state = AppState {
            producer: Arc::clone(&self.producer),
            store: Arc::clone(&self.store),
            view: Arc::clone(&self.view),
            registry: self.registry.clone(),
        };

        Router::new()
            .route("/ws", get(ws::ws_handler))
            .route("/api/model/train", post(handlers::train))
            .route("/api/model/predict", post(handlers::predict))
            .route("/api/model/status/:client_id", get(handlers::model_status))
            .route("/api/query/model/:client_id", get(handlers::query_model))
            .route("/api/query/models/running", get(handlers::running_models))
            .route("/api/query/models/history", get(handlers::model_history))
            .route(
                "/api/query/logs/:client_id/summary",
                get(handlers::log_summary),
            )
            .route("/api/query/logs/:client_id/stats", get(handlers::log_stats))
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods([
                        Method::GET,
                        Method::POST,
                        Method::PUT,
                        Method::DELETE,
                        Method::OPTIONS,
                    ])
                    .allow_headers(Any),
            )
            .with_state(state)
    }

    /// Serves HTTP until ctrl-c, then shuts the components down under the
    /// 10 s deadline.
    pub async fn run(self) -> Result<()> {
        self.start().await?;

        let addr = self.cfg.server.addr();
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(target: "gateway", addr = %addr, "HTTP server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                info!(target: "gateway", "Shutdown signal received");
            })
            .await?;

        if tokio::time::timeout(Duration::from_secs(10), self.shutdown())
            .await
            .is_err()
        {
            warn!(target: "gateway", "Shutdown deadline exceeded, abandoning remaining components");
        }
        Ok(())
    }

    /// Orderly component shutdown: flush pending log batches first, then
    /// stop readers and close connections.
    pub async fn shutdown(&self) {
        let _ = self.stop.send(true);

        self.ingest.stop().await;
        self.view.stop();
        self.command_consumer.stop();
        self.status_consumer.stop();
        self.registry.close_all().await;
        self.producer.close();

        info!(target: "gateway", "Backend shut down");
    }
}
