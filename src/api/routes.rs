//! Route handlers. Every JSON response carries `request_id` and
//! `api_latency_ms` (plus `run_id` where one applies) so responses can be
//! correlated with run-ledger entries and request logs.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
// URL-safe alphabet: cursors travel in query strings unescaped.
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64, Engine as _};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::etl::Orchestrator;
use crate::metrics::EtlMetrics;
use crate::models::SourceId;
use crate::storage::{DataQuery, RecordStore, RunLedger, SortBy};

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 500;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<RecordStore>,
    pub ledger: Arc<RunLedger>,
    pub metrics: Arc<EtlMetrics>,
    pub scheduler_enabled: bool,
}

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/refresh", post(trigger_refresh))
        .route("/data", get(get_data))
        .route("/stats", get(get_stats))
        .route("/runs", get(list_runs))
        .route("/runs/:id", get(get_run))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_exposition))
        .with_state(state)
}

fn request_context() -> (String, Instant) {
    (Uuid::new_v4().to_string(), Instant::now())
}

fn latency_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

// ===== Route Handlers =====

/// Trigger a run. Always 202: the run itself is asynchronous, and a trigger
/// landing while a run is in flight is a recorded no-op.
async fn trigger_refresh(State(state): State<AppState>) -> Result<Response, ApiError> {
    let (request_id, started) = request_context();

    let (raw, normalized) = state.store.counts()?;
    let health = if state.store.ping().is_ok() { "ok" } else { "degraded" };

    if state.orchestrator.is_running() {
        let body = Json(json!({
            "request_id": request_id,
            "run_id": null,
            "api_latency_ms": latency_ms(started),
            "health": health,
            "pre_run_counts": {"raw": raw, "normalized": normalized},
            "message": "run already in progress, trigger ignored",
        }));
        return Ok((StatusCode::ACCEPTED, body).into_response());
    }

    let run_id = state.orchestrator.next_run_id();
    let orchestrator = Arc::clone(&state.orchestrator);
    let spawned_run_id = run_id.clone();
    tokio::spawn(async move {
        if let Err(e) = orchestrator.run_etl_with_id(spawned_run_id).await {
            tracing::error!(error = %e, "triggered run failed");
        }
    });

    let body = Json(json!({
        "request_id": request_id,
        "run_id": run_id,
        "api_latency_ms": latency_ms(started),
        "health": health,
        "pre_run_counts": {"raw": raw, "normalized": normalized},
        "message": "run triggered",
    }));
    Ok((StatusCode::ACCEPTED, body).into_response())
}

#[derive(Deserialize)]
struct DataParams {
    symbol: Option<String>,
    source: Option<String>,
    sort_by: Option<String>,
    cursor: Option<String>,
    limit: Option<usize>,
}

/// Query the normalized view with keyset pagination. The cursor is an opaque
/// base64 blob of the last row's (sort value, id).
async fn get_data(
    State(state): State<AppState>,
    Query(params): Query<DataParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (request_id, started) = request_context();

    let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

    let sort_by = match &params.sort_by {
        None => SortBy::Timestamp,
        Some(s) => SortBy::parse(s)
            .ok_or_else(|| ApiError::BadRequest(format!("unknown sort_by `{s}`")))?,
    };

    let source = match &params.source {
        None => None,
        Some(s) => Some(
            SourceId::parse(s)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown source `{s}`")))?,
        ),
    };

    let cursor = params.cursor.as_deref().map(decode_cursor).transpose()?;

    let rows = state.store.query_normalized(&DataQuery {
        symbol: params.symbol,
        source,
        sort_by,
        cursor,
        limit,
    })?;

    let next_cursor = if rows.len() == limit {
        rows.last()
            .map(|last| encode_cursor(&RecordStore::sort_value(last, sort_by), last.id))
    } else {
        None
    };

    Ok(Json(json!({
        "request_id": request_id,
        "api_latency_ms": latency_ms(started),
        "count": rows.len(),
        "next_cursor": next_cursor,
        "data": rows,
    })))
}

/// Counts plus incremental-load summary of the most recent run.
async fn get_stats(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let (request_id, started) = request_context();

    let (raw, normalized) = state.store.counts()?;
    let totals = state.ledger.totals()?;
    let last_run = state.ledger.last_entry()?;

    let rows_total = state.metrics.rows_processed_total();
    let errors_total = state.metrics.errors_total();
    let error_rate = if rows_total + errors_total == 0 {
        0.0
    } else {
        errors_total as f64 / (rows_total + errors_total) as f64
    };

    Ok(Json(json!({
        "request_id": request_id,
        "api_latency_ms": latency_ms(started),
        "run_id": last_run.as_ref().map(|e| e.run_id.clone()),
        "counts": {"raw": raw, "normalized": normalized},
        "latency_avg_ms": totals.avg_latency_ms,
        "error_rate": error_rate,
        "incremental": {
            "last_run_new_records": last_run.as_ref().map(|e| e.new_records()).unwrap_or(0),
            "last_run_skipped": last_run.as_ref().map(|e| e.skipped_by_watermark()).unwrap_or(0),
            "total_duplicate_prevention": totals.skipped_by_watermark,
        },
    })))
}

#[derive(Deserialize)]
struct RunsParams {
    limit: Option<usize>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<RunsParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (request_id, started) = request_context();

    let limit = params.limit.unwrap_or(20).clamp(1, 100);
    let runs = state.ledger.list_recent(limit)?;

    Ok(Json(json!({
        "request_id": request_id,
        "api_latency_ms": latency_ms(started),
        "count": runs.len(),
        "runs": runs,
    })))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (request_id, started) = request_context();

    let entry = state
        .ledger
        .get_by_id(&id)?
        .ok_or_else(|| ApiError::NotFound(format!("run {id} not found")))?;

    Ok(Json(json!({
        "request_id": request_id,
        "api_latency_ms": latency_ms(started),
        "run_id": entry.run_id,
        "run": entry,
    })))
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let (request_id, started) = request_context();

    let ping_started = Instant::now();
    let db_connected = state.store.ping().is_ok();
    let db_ping_ms = latency_ms(ping_started);

    let last_run_status = state
        .ledger
        .last_entry()
        .ok()
        .flatten()
        .map(|e| e.status.as_str().to_string());

    Json(json!({
        "request_id": request_id,
        "api_latency_ms": latency_ms(started),
        "status": if db_connected { "healthy" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "components": {
            "api": "ok",
            "db_connected": db_connected,
            "db_ping_ms": db_ping_ms,
            "scheduler": if state.scheduler_enabled { "enabled" } else { "disabled" },
        },
        "last_run_status": last_run_status,
        "etl_running": state.orchestrator.is_running(),
    }))
}

async fn metrics_exposition(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
        .into_response()
}

// ===== Cursor Encoding =====

fn encode_cursor(sort_value: &str, id: i64) -> String {
    BASE64.encode(json!({"s": sort_value, "id": id}).to_string())
}

fn decode_cursor(cursor: &str) -> Result<(String, i64), ApiError> {
    let bytes = BASE64
        .decode(cursor)
        .map_err(|_| ApiError::BadRequest("malformed cursor".to_string()))?;
    let value: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|_| ApiError::BadRequest("malformed cursor".to_string()))?;
    let sort_value = value
        .get("s")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApiError::BadRequest("malformed cursor".to_string()))?;
    let id = value
        .get("id")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| ApiError::BadRequest("malformed cursor".to_string()))?;
    Ok((sort_value.to_string(), id))
}

// ===== Error Handling =====

#[derive(Debug)]
pub enum ApiError {
    Database(anyhow::Error),
    NotFound(String),
    BadRequest(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Database(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Database(err) => {
                tracing::error!("Database error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        };

        let body = Json(json!({
            "request_id": Uuid::new_v4().to_string(),
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_round_trip() {
        let cursor = encode_cursor("2024-01-01T00:00:00.000Z", 42);
        let (sort_value, id) = decode_cursor(&cursor).unwrap();
        assert_eq!(sort_value, "2024-01-01T00:00:00.000Z");
        assert_eq!(id, 42);
    }

    #[test]
    fn test_malformed_cursor_is_a_bad_request() {
        assert!(matches!(
            decode_cursor("!!not-base64!!"),
            Err(ApiError::BadRequest(_))
        ));
        let not_json = BASE64.encode("plain text");
        assert!(matches!(
            decode_cursor(&not_json),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[test]
    fn test_error_conversion() {
        let err = anyhow::anyhow!("boom");
        let api_err: ApiError = err.into();
        assert!(matches!(api_err, ApiError::Database(_)));
    }
}
