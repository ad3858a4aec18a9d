//! Uniform record extraction: every source, HTTP or file, yields a
//! `Vec<RawRecord>`. HTTP pulls go through the rate gate first and fall back
//! to the short-TTL payload cache when admission is denied; any transport or
//! decode failure degrades to an empty sequence so one flaky provider never
//! takes the run down.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{EtlError, FetchErrorKind};
use crate::etl::rate_gate::{Admission, PayloadCache, RateGate};
use crate::metrics::EtlMetrics;
use crate::models::{RawRecord, SourceId};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Seam between the orchestrator and the outside world. Tests stub this.
#[async_trait]
pub trait RecordFetcher: Send + Sync {
    /// Fetch failures are internalized: metered, logged, empty sequence out.
    async fn fetch(&self, source: SourceId) -> Vec<RawRecord>;
}

/// Production fetcher over two JSON APIs and one CSV archive.
pub struct SourceExtractor {
    client: reqwest::Client,
    gate: Arc<RateGate>,
    cache: PayloadCache,
    metrics: Arc<EtlMetrics>,
    urls: HashMap<SourceId, String>,
    csv_path: String,
    caps: HashMap<SourceId, usize>,
}

impl SourceExtractor {
    pub fn new(config: &Config, gate: Arc<RateGate>, metrics: Arc<EtlMetrics>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("coinflow-backend/", env!("CARGO_PKG_VERSION")))
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static config");

        let mut urls = HashMap::new();
        urls.insert(SourceId::CoinGecko, config.coingecko_url.clone());
        urls.insert(SourceId::CoinPaprika, config.coinpaprika_url.clone());

        Self {
            client,
            gate,
            cache: PayloadCache::new(),
            metrics,
            urls,
            csv_path: config.csv_archive_path.clone(),
            caps: config.record_caps.clone(),
        }
    }

    fn cap(&self, source: SourceId) -> usize {
        self.caps.get(&source).copied().unwrap_or(usize::MAX)
    }

    /// Meter and log a degraded fetch; the caller returns an empty sequence.
    fn note_fetch_failure(&self, source: SourceId, kind: FetchErrorKind, message: String) {
        let err = EtlError::SourceFetch {
            source,
            kind,
            message,
        };
        warn!(source = %source, error = %err, "source degraded to empty fetch");
        self.metrics.inc_error(source.as_str(), kind.as_str());
    }

    async fn fetch_http(&self, source: SourceId) -> Vec<RawRecord> {
        // Prefer a fresh cached payload over sleeping on an empty bucket.
        if let Err(wait_hint) = self.gate.try_acquire(source) {
            if let Some(cached) = self.cache.get(source) {
                debug!(source = %source, "serving cached payload while throttled");
                return cached.as_ref().clone();
            }
            debug!(
                source = %source,
                wait_hint_ms = wait_hint.as_millis() as u64,
                "no cached payload, waiting out the backoff"
            );
            match self.gate.acquire(source).await {
                Admission::Ok => {}
                Admission::Throttled { wait_hint } => {
                    // Still exhausted after one backoff: zero-record fetch,
                    // the next scheduled run tries again.
                    let err = EtlError::Throttled {
                        source,
                        wait_hint_ms: wait_hint.as_millis() as u64,
                    };
                    debug!(source = %source, error = %err, "admission denied twice, giving up");
                    return Vec::new();
                }
            }
        }

        let url = match self.urls.get(&source) {
            Some(url) => url,
            None => return Vec::new(),
        };

        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                self.note_fetch_failure(source, FetchErrorKind::Network, e.to_string());
                return Vec::new();
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            self.note_fetch_failure(source, FetchErrorKind::Network, format!("HTTP {status}"));
            return Vec::new();
        }

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                self.note_fetch_failure(source, FetchErrorKind::Data, e.to_string());
                return Vec::new();
            }
        };

        let records = match extract_records(body) {
            Some(records) => records,
            None => {
                self.note_fetch_failure(
                    source,
                    FetchErrorKind::Data,
                    "payload is not a record array".to_string(),
                );
                return Vec::new();
            }
        };

        let capped: Vec<RawRecord> = records.into_iter().take(self.cap(source)).collect();
        info!(source = %source, count = capped.len(), "fetched records");
        self.cache.put(source, capped.clone());
        capped
    }

    /// Stream-parse the CSV archive. Rows come out under their raw header
    /// names; mapping happens in the transform stage so drift detection sees
    /// the original header, the same as an API rename.
    fn fetch_csv(&self) -> Vec<RawRecord> {
        let source = SourceId::CsvArchive;
        let file = match std::fs::File::open(&self.csv_path) {
            Ok(file) => file,
            Err(e) => {
                self.note_fetch_failure(
                    source,
                    FetchErrorKind::Network,
                    format!("{}: {e}", self.csv_path),
                );
                return Vec::new();
            }
        };

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(file);

        let headers = match reader.headers() {
            Ok(headers) => headers.clone(),
            Err(e) => {
                self.note_fetch_failure(source, FetchErrorKind::Data, e.to_string());
                return Vec::new();
            }
        };

        let cap = self.cap(source);
        let mut records = Vec::new();
        for row in reader.records() {
            if records.len() >= cap {
                break;
            }
            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    warn!(source = %source, error = %e, "csv row parse failed, skipping");
                    self.metrics
                        .inc_error(source.as_str(), FetchErrorKind::Data.as_str());
                    continue;
                }
            };

            let mut record = RawRecord::new();
            for (header, value) in headers.iter().zip(row.iter()) {
                if !header.is_empty() {
                    record.insert(header.to_string(), Value::String(value.to_string()));
                }
            }
            if !record.is_empty() {
                records.push(record);
            }
        }

        info!(source = %source, count = records.len(), "parsed csv archive rows");
        records
    }
}

#[async_trait]
impl RecordFetcher for SourceExtractor {
    async fn fetch(&self, source: SourceId) -> Vec<RawRecord> {
        match source {
            SourceId::CoinGecko | SourceId::CoinPaprika => self.fetch_http(source).await,
            SourceId::CsvArchive => self.fetch_csv(),
        }
    }
}

/// Accept a bare array of objects or the common `{"data": [...]}` envelope.
fn extract_records(body: Value) -> Option<Vec<RawRecord>> {
    let array = match body {
        Value::Array(array) => array,
        Value::Object(mut object) => match object.remove("data") {
            Some(Value::Array(array)) => array,
            _ => return None,
        },
        _ => return None,
    };

    Some(
        array
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
    )
}
