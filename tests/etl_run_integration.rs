//! End-to-end integration: the full component stack behind the real HTTP
//! surface, exercised over a loopback listener with a stubbed source
//! fetcher and a temp SQLite database. No external network.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use coinflow_backend::api::{create_router, AppState};
use coinflow_backend::etl::{Orchestrator, RecordFetcher, SchemaMapper};
use coinflow_backend::metrics::EtlMetrics;
use coinflow_backend::models::{RawRecord, SourceId};
use coinflow_backend::storage::{CheckpointStore, RecordStore, RunLedger};

struct StubFetcher {
    responses: Mutex<HashMap<SourceId, Vec<RawRecord>>>,
}

impl StubFetcher {
    fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
        }
    }

    fn set(&self, source: SourceId, records: Vec<RawRecord>) {
        self.responses.lock().insert(source, records);
    }
}

#[async_trait]
impl RecordFetcher for StubFetcher {
    async fn fetch(&self, source: SourceId) -> Vec<RawRecord> {
        self.responses
            .lock()
            .get(&source)
            .cloned()
            .unwrap_or_default()
    }
}

struct TestApp {
    _dir: tempfile::TempDir,
    base_url: String,
    client: reqwest::Client,
    fetcher: Arc<StubFetcher>,
    orchestrator: Arc<Orchestrator>,
}

async fn spawn_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("coinflow.db");
    let db_path = db_path.to_str().unwrap();

    let store = Arc::new(RecordStore::open(db_path).unwrap());
    let checkpoints = Arc::new(CheckpointStore::open(db_path).unwrap());
    let ledger = Arc::new(RunLedger::open(db_path).unwrap());
    let metrics = Arc::new(EtlMetrics::new());
    let fetcher = Arc::new(StubFetcher::new());

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&checkpoints),
        Arc::clone(&ledger),
        Arc::clone(&fetcher) as Arc<dyn RecordFetcher>,
        Arc::new(SchemaMapper::new()),
        Arc::clone(&metrics),
        5,
        false,
        Arc::new(AtomicBool::new(false)),
    ));

    let state = AppState {
        orchestrator: Arc::clone(&orchestrator),
        store,
        ledger,
        metrics,
        scheduler_enabled: false,
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, create_router(state)).await.unwrap();
    });

    TestApp {
        _dir: dir,
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        fetcher,
        orchestrator,
    }
}

fn btc_record() -> RawRecord {
    serde_json::from_value(json!({
        "symbol": "BTC",
        "name": "Bitcoin",
        "price_usd": 50000,
        "volume_24h": 1.0e9,
        "market_cap": 9.5e11,
        "percent_change_24h": 2.5,
        "timestamp": "2024-01-01T00:00:00Z"
    }))
    .unwrap()
}

/// Ledger entries only materialize when the run completes, so polling the
/// run endpoint doubles as completion detection.
async fn wait_for_run(app: &TestApp, run_id: &str) {
    for _ in 0..200 {
        let response = app
            .client
            .get(format!("{}/runs/{run_id}", app.base_url))
            .send()
            .await
            .unwrap();
        if response.status().is_success() && !app.orchestrator.is_running() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("run {run_id} did not finish in time");
}

async fn get_json(app: &TestApp, path: &str) -> Value {
    app.client
        .get(format!("{}{}", app.base_url, path))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_refresh_then_query_everything() {
    let app = spawn_app().await;
    app.fetcher.set(SourceId::CoinGecko, vec![btc_record()]);

    // Trigger a run.
    let response = app
        .client
        .post(format!("{}/refresh", app.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    let body: Value = response.json().await.unwrap();
    assert!(body.get("request_id").is_some());
    assert!(body.get("api_latency_ms").is_some());
    let run_id = body["run_id"].as_str().unwrap().to_string();
    assert_eq!(body["pre_run_counts"]["raw"], 0);

    wait_for_run(&app, &run_id).await;

    // Run detail reflects the completed run.
    let run = get_json(&app, &format!("/runs/{run_id}")).await;
    assert_eq!(run["run"]["status"], "success");
    assert_eq!(run["run"]["source_stats"]["coingecko"]["processed"], 1);

    // The normalized view serves the record.
    let data = get_json(&app, "/data").await;
    assert_eq!(data["count"], 1);
    assert_eq!(data["data"][0]["symbol"], "BTC");
    assert_eq!(data["data"][0]["price_usd"], 50000.0);
    assert!(data["next_cursor"].is_null());

    // Stats: one fresh record, nothing skipped yet.
    let stats = get_json(&app, "/stats").await;
    assert_eq!(stats["counts"]["raw"], 1);
    assert_eq!(stats["counts"]["normalized"], 1);
    assert_eq!(stats["incremental"]["last_run_new_records"], 1);
    assert_eq!(stats["incremental"]["last_run_skipped"], 0);

    // Health and metrics exposition.
    let health = get_json(&app, "/health").await;
    assert_eq!(health["components"]["db_connected"], true);
    assert_eq!(health["last_run_status"], "success");

    let metrics_text = app
        .client
        .get(format!("{}/metrics", app.base_url))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics_text.contains("etl_rows_processed_total{source=\"coingecko\"} 1"));
    assert!(metrics_text.contains("etl_latency_seconds_bucket{stage=\"load\""));
}

#[tokio::test]
async fn test_second_run_is_idempotent_through_the_api() {
    let app = spawn_app().await;
    app.fetcher.set(SourceId::CoinGecko, vec![btc_record()]);

    for _ in 0..2 {
        let response = app
            .client
            .post(format!("{}/refresh", app.base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 202);
        let body: Value = response.json().await.unwrap();
        let run_id = body["run_id"].as_str().unwrap().to_string();
        wait_for_run(&app, &run_id).await;
    }

    let stats = get_json(&app, "/stats").await;
    // Identical input on the second run: everything falls under the
    // watermark, no new rows appear.
    assert_eq!(stats["counts"]["normalized"], 1);
    assert_eq!(stats["incremental"]["last_run_new_records"], 0);
    assert_eq!(stats["incremental"]["last_run_skipped"], 1);
    assert_eq!(stats["incremental"]["total_duplicate_prevention"], 1);

    let runs = get_json(&app, "/runs").await;
    assert_eq!(runs["count"], 2);
}

#[tokio::test]
async fn test_data_pagination_with_cursor() {
    let app = spawn_app().await;
    let records: Vec<RawRecord> = (0..3)
        .map(|i| {
            serde_json::from_value(json!({
                "symbol": format!("C{i}"),
                "name": format!("Coin {i}"),
                "price_usd": 100.0 + i as f64,
                "volume_24h": 1000.0,
                "timestamp": 1_704_067_200 + i as i64,
            }))
            .unwrap()
        })
        .collect();
    app.fetcher.set(SourceId::CoinPaprika, records);

    let response = app
        .client
        .post(format!("{}/refresh", app.base_url))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    let run_id = body["run_id"].as_str().unwrap().to_string();
    wait_for_run(&app, &run_id).await;

    let page1 = get_json(&app, "/data?limit=2").await;
    assert_eq!(page1["count"], 2);
    assert_eq!(page1["data"][0]["symbol"], "C2"); // newest first
    let cursor = page1["next_cursor"].as_str().unwrap().to_string();

    let page2 = get_json(&app, &format!("/data?limit=2&cursor={cursor}")).await;
    assert_eq!(page2["count"], 1);
    assert_eq!(page2["data"][0]["symbol"], "C0");

    // Unknown sort column is a client error.
    let bad = app
        .client
        .get(format!("{}/data?sort_by=market_cap", app.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), 400);
}

#[tokio::test]
async fn test_missing_run_is_404() {
    let app = spawn_app().await;
    let response = app
        .client
        .get(format!("{}/runs/does-not-exist", app.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}
