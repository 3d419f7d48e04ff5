// REST handlers: command submission and view queries.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use trellis_core::types::{JobAccepted, PredictRequest, RunStatus, TrainRequest};
use trellis_core::view::QueryFilter;

use crate::server::AppState;

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn internal_error(error: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": error.to_string() })),
    )
        .into_response()
}

/// POST /api/model/train: publish a train command, reply 202 pending.
pub async fn train(State(state): State<AppState>, Json(req): Json<TrainRequest>) -> Response {
    if req.client_id.is_empty() {
        return bad_request("client_id is required");
    }

    match state
        .producer
        .publish_train_request(
            &req.client_id,
            req.data,
            req.start_date,
            req.end_date,
            req.configuration,
        )
        .await
    {
        Ok(_) => (
            StatusCode::ACCEPTED,
            Json(JobAccepted {
                client_id: req.client_id,
                status: RunStatus::Pending,
                message: "training request accepted".to_string(),
            }),
        )
            .into_response(),
        Err(e) => {
            warn!(target: "gateway", client_id = %req.client_id, error = %e, "Train publish failed");
            internal_error(e)
        }
    }
}

/// POST /api/model/predict: publish a predict command, reply 202 pending.
pub async fn predict(State(state): State<AppState>, Json(req): Json<PredictRequest>) -> Response {
    if req.client_id.is_empty() {
        return bad_request("client_id is required");
    }

    match state
        .producer
        .publish_predict_request(&req.client_id, req.data, req.configuration)
        .await
    {
        Ok(_) => (
            StatusCode::ACCEPTED,
            Json(JobAccepted {
                client_id: req.client_id,
                status: RunStatus::Pending,
                message: "prediction request accepted".to_string(),
            }),
        )
            .into_response(),
        Err(e) => {
            warn!(target: "gateway", client_id = %req.client_id, error = %e, "Predict publish failed");
            internal_error(e)
        }
    }
}

/// GET /api/model/status/:clientId: current status row from the store.
pub async fn model_status(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Response {
    match state.store.get_model_status(&client_id).await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => internal_error(e),
    }
}

/// GET /api/query/model/:clientId: current view entry, running or last run.
pub async fn query_model(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Response {
    match state.view.get_model_state(&client_id).await {
        Some(model) => (StatusCode::OK, Json(model)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "model not found" })),
        )
            .into_response(),
    }
}

/// GET /api/query/models/running
pub async fn running_models(State(state): State<AppState>) -> Response {
    let models = state.view.get_running_models().await;
    (
        StatusCode::OK,
        Json(json!({ "models": models, "count": models.len() })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(default)]
    client_id: String,
    process_type: Option<String>,
    status: Option<String>,
    from: Option<String>,
    to: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

/// GET /api/query/models/history: filtered history with pagination.
pub async fn model_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let process_type = match params.process_type.as_deref() {
        None | Some("") => None,
        Some(raw) => match raw.parse() {
            Ok(pt) => Some(pt),
            Err(_) => return bad_request("invalid process_type parameter"),
        },
    };
    let status = match params.status.as_deref() {
        None | Some("") => None,
        Some(raw) => match raw.parse() {
            Ok(st) => Some(st),
            Err(_) => return bad_request("invalid status parameter"),
        },
    };
    let start_time_from = match parse_rfc3339(params.from.as_deref()) {
        Ok(ts) => ts,
        Err(_) => return bad_request("invalid 'from' time format"),
    };
    let start_time_to = match parse_rfc3339(params.to.as_deref()) {
        Ok(ts) => ts,
        Err(_) => return bad_request("invalid 'to' time format"),
    };

    let filter = QueryFilter {
        client_id: params.client_id,
        process_type,
        status,
        start_time_from,
        start_time_to,
        limit: params.limit.unwrap_or(50),
        offset: params.offset.unwrap_or(0),
    };

    let models = state.view.query_model_history(&filter).await;
    (
        StatusCode::OK,
        Json(json!({ "models": models, "count": models.len(), "filter": filter })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct TimeRangeParams {
    from: Option<String>,
    to: Option<String>,
}

/// GET /api/query/logs/:clientId/summary: counts by level plus rate series.
/// The range defaults to the last 24 hours.
pub async fn log_summary(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Query(params): Query<TimeRangeParams>,
) -> Response {
    let from = match parse_rfc3339(params.from.as_deref()) {
        Ok(ts) => ts.unwrap_or_else(|| Utc::now() - Duration::hours(24)),
        Err(_) => return bad_request("invalid 'from' time format"),
    };
    let to = match parse_rfc3339(params.to.as_deref()) {
        Ok(ts) => ts.unwrap_or_else(Utc::now),
        Err(_) => return bad_request("invalid 'to' time format"),
    };

    match state.view.get_log_summary(&client_id, from, to).await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(e) => internal_error(e),
    }
}

/// GET /api/query/logs/:clientId/stats: whole-history log statistics.
pub async fn log_stats(State(state): State<AppState>, Path(client_id): Path<String>) -> Response {
    match state.store.get_client_log_stats(&client_id).await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => internal_error(e),
    }
}

fn parse_rfc3339(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, chrono::ParseError> {
    match raw {
        None | Some("") => Ok(None),
        Some(text) => Ok(Some(
            DateTime::parse_from_rfc3339(text)?.with_timezone(&Utc),
        )),
    }
}
