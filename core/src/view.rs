// Status/Query view: the authoritative in-memory projection of the status
// event stream, plus the query surface over it.
//
// One lock guards both maps; it is held for map mutation and snapshotting
// only, never across store I/O. Status upserts are fire-and-forget with
// logging; the in-memory view stays the source of truth.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use crate::event::{decode, EventHandler, EventKind, EventPayload, ModelStatusEvent};
use crate::store::{Store, TimeBucket};
use crate::types::{ModelState, ModelStats, ModelStatus, ProcessType, RunStatus};
use crate::Result;

/// Filter for history queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_type: Option<ProcessType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl QueryFilter {
    fn matches(&self, state: &ModelState) -> bool {
        if let Some(process_type) = self.process_type {
            if state.process_type != process_type {
                return false;
            }
        }
        if let Some(status) = self.status {
            if state.status != status {
                return false;
            }
        }
        if let Some(from) = self.start_time_from {
            if state.start_time < from {
                return false;
            }
        }
        if let Some(to) = self.start_time_to {
            if state.start_time > to {
                return false;
            }
        }
        true
    }
}

/// Log summary returned by `get_log_summary`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSummary {
    pub log_counts: HashMap<String, i64>,
    pub log_rates: Vec<TimeBucket>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub total_logs: i64,
}

#[derive(Default)]
struct ViewState {
    running: HashMap<String, ModelState>,
    history: HashMap<String, Vec<ModelState>>,
}

/// Materialized view of model runs, fed by the status topic.
pub struct StatusView {
    state: RwLock<ViewState>,
    store: Arc<dyn Store>,
    stop: watch::Sender<bool>,
}

impl StatusView {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            state: RwLock::new(ViewState::default()),
            store,
            stop,
        }
    }

    /// Rebuilds the view from the store's current-status rows. Rows still
    /// marked running or pending re-enter *running*; every row seeds its
    /// client's history. Log counts for running entries come from the store.
    pub async fn warm_start(&self) -> Result<()> {
        let statuses = self.store.get_all_model_statuses().await?;

        let mut running_clients = Vec::new();
        {
            let mut state = self.state.write().await;
            for status in statuses {
                let model = ModelState::new(
                    status.client_id.clone(),
                    status.status,
                    status.process_type,
                    status.timestamp,
                    status.message,
                );

                if matches!(status.status, RunStatus::Running | RunStatus::Pending) {
                    state.running.insert(status.client_id.clone(), model.clone());
                    running_clients.push((status.client_id.clone(), status.timestamp));
                }
                state
                    .history
                    .entry(status.client_id)
                    .or_default()
                    .push(model);
            }
        }

        // Store reads happen outside the lock.
        let now = Utc::now();
        for (client_id, start_time) in running_clients {
            match self
                .store
                .count_client_logs(&client_id, start_time, now)
                .await
            {
                Ok(count) => {
                    let mut state = self.state.write().await;
                    if let Some(entry) = state.running.get_mut(&client_id) {
                        entry.log_count = count;
                    }
                    if let Some(history) = state.history.get_mut(&client_id) {
                        if let Some(last) = history.last_mut() {
                            last.log_count = count;
                        }
                    }
                }
                Err(e) => {
                    warn!(target: "view", client_id = %client_id, error = %e, "Log count failed during warm start");
                }
            }
        }

        info!(target: "view", "View warm start complete");
        Ok(())
    }

    /// Launches the minute stats-refresh loop.
    pub fn spawn_stats_refresh(self: &Arc<Self>) {
        let view = Arc::clone(self);
        let mut stop = self.stop.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = ticker.tick() => view.refresh_stats().await,
                }
            }
        });
    }

    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Recomputes the derived stats for every client. The latest history
    /// entry carries the stats block; a running entry mirrors it.
    pub async fn refresh_stats(&self) {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let ViewState { running, history } = &mut *state;

        for (client_id, runs) in history.iter_mut() {
            if runs.is_empty() {
                continue;
            }

            let total_runs = runs.len();
            let mut total_runtime = 0.0;
            let mut success_count = 0usize;
            let mut total_logs = 0i64;

            for run in runs.iter() {
                let runtime = match run.end_time {
                    Some(end) => (end - run.start_time).num_milliseconds() as f64 / 1000.0,
                    // Terminal without an end time: approximate with now.
                    None if run.status.is_terminal() => {
                        (now - run.start_time).num_milliseconds() as f64 / 1000.0
                    }
                    None => 0.0,
                };
                total_runtime += runtime;

                if run.status == RunStatus::Completed {
                    success_count += 1;
                }
                total_logs += run.log_count;
            }

            let latest = runs.last_mut().expect("non-empty history");
            latest.stats = ModelStats {
                average_runtime: total_runtime / total_runs as f64,
                total_runs,
                success_rate: success_count as f64 / total_runs as f64 * 100.0,
                last_run_time: Some(latest.start_time),
                average_log_count: total_logs as f64 / total_runs as f64,
            };

            if let Some(active) = running.get_mut(client_id) {
                active.stats = latest.stats.clone();
            }
        }
    }

    async fn apply(&self, kind: EventKind, event: &ModelStatusEvent) -> Option<ModelStatus> {
        let client_id = event.meta.client_id.clone();
        let mut state = self.state.write().await;

        match kind {
            EventKind::ModelStarted => {
                let model = ModelState::new(
                    client_id.clone(),
                    RunStatus::Running,
                    event.process_type,
                    event.meta.timestamp,
                    event.message.clone(),
                );
                state.running.insert(client_id.clone(), model.clone());
                state.history.entry(client_id.clone()).or_default().push(model);
                Some(self.status_row(&client_id, RunStatus::Running, event))
            }
            EventKind::ModelCompleted | EventKind::ModelFailed => {
                let status = if kind == EventKind::ModelCompleted {
                    RunStatus::Completed
                } else {
                    RunStatus::Error
                };

                // The running entry leaves *running* before its history form
                // becomes visible; both happen under the one lock.
                if let Some(mut finished) = state.running.remove(&client_id) {
                    let now = Utc::now();
                    finished.status = status;
                    finished.message = event.message.clone();
                    finished.end_time = Some(now);
                    finished.runtime_seconds =
                        (now - finished.start_time).num_milliseconds() as f64 / 1000.0;

                    let history = state.history.entry(client_id.clone()).or_default();
                    let finalizes_last = history
                        .last()
                        .is_some_and(|last| last.start_time == finished.start_time);
                    if finalizes_last {
                        *history.last_mut().expect("non-empty history") = finished;
                    } else {
                        history.push(finished);
                    }
                } else {
                    // Terminal event with no running entry: standalone record.
                    let mut model = ModelState::new(
                        client_id.clone(),
                        status,
                        event.process_type,
                        event.meta.timestamp,
                        event.message.clone(),
                    );
                    model.end_time = Some(event.meta.timestamp);
                    state.history.entry(client_id.clone()).or_default().push(model);
                }
                Some(self.status_row(&client_id, status, event))
            }
            EventKind::ModelProgress => {
                // Progress for an unknown client is tolerated and ignored.
                let known = state.running.contains_key(&client_id);
                if known {
                    if let Some(active) = state.running.get_mut(&client_id) {
                        active.message = event.message.clone();
                    }
                    if let Some(last) = state
                        .history
                        .get_mut(&client_id)
                        .and_then(|runs| runs.last_mut())
                    {
                        last.message = event.message.clone();
                    }
                    Some(self.status_row(&client_id, RunStatus::Running, event))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    fn status_row(
        &self,
        client_id: &str,
        status: RunStatus,
        event: &ModelStatusEvent,
    ) -> ModelStatus {
        ModelStatus {
            client_id: client_id.to_string(),
            status,
            message: event.message.clone(),
            timestamp: event.meta.timestamp,
            process_type: event.process_type,
        }
    }

    /// Running entry if present, else the last history entry.
    pub async fn get_model_state(&self, client_id: &str) -> Option<ModelState> {
        let state = self.state.read().await;
        if let Some(active) = state.running.get(client_id) {
            return Some(active.clone());
        }
        state
            .history
            .get(client_id)
            .and_then(|runs| runs.last())
            .cloned()
    }

    /// Snapshot of every running entry.
    pub async fn get_running_models(&self) -> Vec<ModelState> {
        let state = self.state.read().await;
        state.running.values().cloned().collect()
    }

    /// Filtered history. Ordering within one client is insertion order;
    /// across clients the order is unspecified but stable within one call.
    pub async fn query_model_history(&self, filter: &QueryFilter) -> Vec<ModelState> {
        let state = self.state.read().await;

        let mut results: Vec<ModelState> = if filter.client_id.is_empty() {
            state
                .history
                .values()
                .flatten()
                .filter(|run| filter.matches(run))
                .cloned()
                .collect()
        } else {
            state
                .history
                .get(&filter.client_id)
                .map(|runs| {
                    runs.iter()
                        .filter(|run| filter.matches(run))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        if filter.offset > 0 {
            if filter.offset >= results.len() {
                return Vec::new();
            }
            results.drain(..filter.offset);
        }
        if filter.limit > 0 && results.len() > filter.limit {
            results.truncate(filter.limit);
        }
        results
    }

    /// Store-backed log summary: counts by level and a 10-bucket rate series.
    pub async fn get_log_summary(
        &self,
        client_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<LogSummary> {
        let log_counts = self
            .store
            .get_log_counts_by_level(client_id, from, to)
            .await?;
        let log_rates = self
            .store
            .get_log_rate_over_time(client_id, from, to, 10)
            .await?;
        let total_logs = log_counts.values().sum();

        Ok(LogSummary {
            log_counts,
            log_rates,
            from,
            to,
            total_logs,
        })
    }
}

#[async_trait]
impl EventHandler for StatusView {
    async fn handle(&self, kind: &str, payload: &[u8]) -> Result<()> {
        let Some(kind) = EventKind::parse(kind) else {
            return Ok(());
        };
        let EventPayload::ModelStatus(event) = decode(kind.as_str(), payload)? else {
            return Ok(());
        };

        if let Some(row) = self.apply(kind, &event).await {
            // Upsert outside the lock, sequenced with the event stream so a
            // later transition cannot be overwritten by an earlier row.
            // Failure leaves the in-memory view authoritative.
            if let Err(e) = self.store.update_model_status(&row).await {
                warn!(
                    target: "view",
                    client_id = %row.client_id,
                    error = %e,
                    "Status upsert failed"
                );
            }
        }
        Ok(())
    }
}
