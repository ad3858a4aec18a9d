//! Core data model: source identities, the unified record shape, and the
//! run-ledger entry written once per ETL invocation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A record as it arrives from a source, before mapping/validation.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Configured market-data sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    CoinGecko,
    CsvArchive,
    CoinPaprika,
}

impl SourceId {
    /// Processing order for a run (also the order sources appear in the ledger).
    pub const ALL: [SourceId; 3] = [
        SourceId::CoinGecko,
        SourceId::CsvArchive,
        SourceId::CoinPaprika,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::CoinGecko => "coingecko",
            SourceId::CsvArchive => "csv_archive",
            SourceId::CoinPaprika => "coinpaprika",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "coingecko" => Some(SourceId::CoinGecko),
            "csv_archive" => Some(SourceId::CsvArchive),
            "coinpaprika" => Some(SourceId::CoinPaprika),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for SourceId {}

/// Canonical snapshot shape written to both record tables.
///
/// Absent numeric fields stay `None`; zero is a real observation, never a
/// missing-value sentinel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedRecord {
    pub symbol: String,
    pub name: String,
    pub price_usd: f64,
    pub volume_24h: f64,
    pub market_cap: Option<f64>,
    pub percent_change_24h: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub source: SourceId,
}

impl UnifiedRecord {
    /// Natural key identifying one market snapshot across both tables.
    pub fn natural_key(&self) -> (String, String, &'static str) {
        (
            self.symbol.clone(),
            format_timestamp(&self.timestamp),
            self.source.as_str(),
        )
    }
}

/// Fixed-width UTC formatting so lexicographic order matches chronological
/// order in the store (watermark lookups rely on this).
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialSuccess,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::PartialSuccess => "partial_success",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(RunStatus::Success),
            "partial_success" => Some(RunStatus::PartialSuccess),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// Per-source counters accumulated during a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceStats {
    pub fetched: usize,
    /// Records upserted into both tables (insert or overwrite).
    pub processed: usize,
    /// Records inserted for the first time (natural key previously unseen).
    pub new_records: usize,
    pub skipped_by_watermark: usize,
    pub validation_errors: usize,
    /// Symbols of records that failed validation, for postmortems.
    pub failed_ids: Vec<String>,
}

/// One failed batch: the source loop stops here, other sources continue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedBatch {
    pub source: SourceId,
    pub batch_no: usize,
    pub error: String,
    pub record_count: usize,
}

/// Where a resumed source picked up.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResumePoint {
    pub resumed_from_batch: usize,
}

/// A field remap produced by drift detection, tiered by confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Field that disappeared from the source schema.
    pub from: String,
    /// Best-matching field among the newly appeared ones.
    pub to: String,
    pub confidence: f64,
}

/// Durable record of one ETL invocation. One entry per run id; a resumed
/// attempt finalizes the same logical run's entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLedgerEntry {
    pub run_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: RunStatus,
    pub source_stats: BTreeMap<String, SourceStats>,
    pub failed_batches: Vec<FailedBatch>,
    pub resume_info: BTreeMap<String, ResumePoint>,
    /// Confidence >= 0.8: used for mapping.
    pub applied_mappings: Vec<FieldMapping>,
    /// Confidence in [0.5, 0.8): logged, never used.
    pub quarantined_mappings: Vec<FieldMapping>,
    /// Confidence < 0.5: dropped.
    pub skipped_mappings: Vec<FieldMapping>,
    pub schema_versions: BTreeMap<String, u32>,
    pub throttle_events: u64,
    pub total_latency_ms: u64,
}

impl RunLedgerEntry {
    pub fn rows_processed(&self) -> usize {
        self.source_stats.values().map(|s| s.processed).sum()
    }

    pub fn new_records(&self) -> usize {
        self.source_stats.values().map(|s| s.new_records).sum()
    }

    pub fn skipped_by_watermark(&self) -> usize {
        self.source_stats.values().map(|s| s.skipped_by_watermark).sum()
    }
}
