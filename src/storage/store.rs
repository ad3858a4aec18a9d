//! Record store: raw mirror + normalized view of market snapshots.
//!
//! Both tables carry a unique index on the natural key
//! `(symbol, timestamp, source)`; upserts are idempotent by construction.
//! WAL mode so API reads proceed while a run is writing.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OpenFlags};
use serde::Serialize;
use tracing::{info, warn};

use crate::models::{format_timestamp, RawRecord, SourceId, UnifiedRecord};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS raw_crypto_data (
    id INTEGER PRIMARY KEY,
    symbol TEXT NOT NULL,
    name TEXT NOT NULL,
    price_usd REAL NOT NULL,
    volume_24h REAL NOT NULL,
    market_cap REAL,
    percent_change_24h REAL,
    timestamp TEXT NOT NULL,
    source TEXT NOT NULL,
    raw_data TEXT NOT NULL,
    run_id TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS normalized_crypto_data (
    id INTEGER PRIMARY KEY,
    symbol TEXT NOT NULL,
    name TEXT NOT NULL,
    price_usd REAL NOT NULL,
    volume_24h REAL NOT NULL,
    market_cap REAL,
    percent_change_24h REAL,
    timestamp TEXT NOT NULL,
    source TEXT NOT NULL,
    run_id TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

const INDEX_SQL: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_raw_natural_key
    ON raw_crypto_data(symbol, timestamp, source);

CREATE UNIQUE INDEX IF NOT EXISTS idx_normalized_natural_key
    ON normalized_crypto_data(symbol, timestamp, source);

CREATE INDEX IF NOT EXISTS idx_normalized_timestamp
    ON normalized_crypto_data(timestamp DESC);

CREATE INDEX IF NOT EXISTS idx_normalized_source
    ON normalized_crypto_data(source, timestamp DESC);
"#;

/// Result of one idempotent write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    MatchedExisting,
}

/// Sortable columns for /data queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    Timestamp,
    PriceUsd,
    Volume24h,
}

impl SortBy {
    pub fn column(&self) -> &'static str {
        match self {
            SortBy::Timestamp => "timestamp",
            SortBy::PriceUsd => "price_usd",
            SortBy::Volume24h => "volume_24h",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "timestamp" => Some(SortBy::Timestamp),
            "price_usd" => Some(SortBy::PriceUsd),
            "volume_24h" => Some(SortBy::Volume24h),
            _ => None,
        }
    }
}

/// Query over the normalized view with keyset pagination.
#[derive(Debug, Clone)]
pub struct DataQuery {
    pub symbol: Option<String>,
    pub source: Option<SourceId>,
    pub sort_by: SortBy,
    /// (last sort value, last row id) from the previous page.
    pub cursor: Option<(String, i64)>,
    pub limit: usize,
}

/// One row of the normalized view as served by /data.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedRow {
    pub id: i64,
    pub symbol: String,
    pub name: String,
    pub price_usd: f64,
    pub volume_24h: f64,
    pub market_cap: Option<f64>,
    pub percent_change_24h: Option<f64>,
    pub timestamp: String,
    pub source: String,
    pub run_id: String,
    pub created_at: String,
}

pub struct RecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl RecordStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open record store at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize record store schema")?;
        conn.execute_batch(INDEX_SQL)
            .context("Failed to create natural-key indexes")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!("record store initialized at {}", db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Idempotent: re-running is a no-op thanks to IF NOT EXISTS.
    pub fn ensure_indexes(&self) -> Result<()> {
        self.conn
            .lock()
            .execute_batch(INDEX_SQL)
            .context("Failed to ensure natural-key indexes")
    }

    /// Write one snapshot to both tables. The raw mirror keeps the verbatim
    /// source payload; the normalized view drops it. A duplicate natural key
    /// overwrites mutable fields and preserves `created_at`.
    pub fn upsert(
        &self,
        record: &UnifiedRecord,
        raw: &RawRecord,
        run_id: &str,
    ) -> Result<UpsertOutcome> {
        let ts = format_timestamp(&record.timestamp);
        let now = format_timestamp(&Utc::now());
        let raw_json = serde_json::to_string(raw).context("Failed to serialize raw payload")?;

        let conn = self.conn.lock();

        // INSERT OR IGNORE + UPDATE instead of INSERT OR REPLACE: keeps the
        // original rowid and created_at on overwrite.
        let raw_inserted = conn.execute(
            "INSERT OR IGNORE INTO raw_crypto_data
             (symbol, name, price_usd, volume_24h, market_cap, percent_change_24h,
              timestamp, source, raw_data, run_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.symbol,
                record.name,
                record.price_usd,
                record.volume_24h,
                record.market_cap,
                record.percent_change_24h,
                ts,
                record.source.as_str(),
                raw_json,
                run_id,
                now,
            ],
        )?;
        if raw_inserted == 0 {
            conn.execute(
                "UPDATE raw_crypto_data
                 SET name = ?1, price_usd = ?2, volume_24h = ?3, market_cap = ?4,
                     percent_change_24h = ?5, raw_data = ?6, run_id = ?7
                 WHERE symbol = ?8 AND timestamp = ?9 AND source = ?10",
                params![
                    record.name,
                    record.price_usd,
                    record.volume_24h,
                    record.market_cap,
                    record.percent_change_24h,
                    raw_json,
                    run_id,
                    record.symbol,
                    ts,
                    record.source.as_str(),
                ],
            )?;
        }

        let normalized_inserted = conn.execute(
            "INSERT OR IGNORE INTO normalized_crypto_data
             (symbol, name, price_usd, volume_24h, market_cap, percent_change_24h,
              timestamp, source, run_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.symbol,
                record.name,
                record.price_usd,
                record.volume_24h,
                record.market_cap,
                record.percent_change_24h,
                ts,
                record.source.as_str(),
                run_id,
                now,
            ],
        )?;
        if normalized_inserted == 0 {
            conn.execute(
                "UPDATE normalized_crypto_data
                 SET name = ?1, price_usd = ?2, volume_24h = ?3, market_cap = ?4,
                     percent_change_24h = ?5, run_id = ?6
                 WHERE symbol = ?7 AND timestamp = ?8 AND source = ?9",
                params![
                    record.name,
                    record.price_usd,
                    record.volume_24h,
                    record.market_cap,
                    record.percent_change_24h,
                    run_id,
                    record.symbol,
                    ts,
                    record.source.as_str(),
                ],
            )?;
        }

        Ok(if normalized_inserted > 0 {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::MatchedExisting
        })
    }

    /// Highest persisted timestamp for a source; the incremental-load cutoff.
    pub fn watermark(&self, source: SourceId) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let max_ts: Option<String> = conn.query_row(
            "SELECT MAX(timestamp) FROM normalized_crypto_data WHERE source = ?1",
            params![source.as_str()],
            |row| row.get(0),
        )?;

        match max_ts {
            Some(ts) => {
                let parsed = DateTime::parse_from_rfc3339(&ts)
                    .with_context(|| format!("Unparsable stored timestamp `{}`", ts))?
                    .with_timezone(&Utc);
                Ok(Some(parsed))
            }
            None => Ok(None),
        }
    }

    /// (raw, normalized) row counts.
    pub fn counts(&self) -> Result<(i64, i64)> {
        let conn = self.conn.lock();
        let raw: i64 = conn.query_row("SELECT COUNT(*) FROM raw_crypto_data", [], |r| r.get(0))?;
        let normalized: i64 =
            conn.query_row("SELECT COUNT(*) FROM normalized_crypto_data", [], |r| r.get(0))?;
        Ok((raw, normalized))
    }

    pub fn ping(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .context("Database ping failed")
    }

    /// Keyset-paginated query over the normalized view, ordered
    /// (sort column DESC, id ASC) so pages are stable under concurrent writes.
    pub fn query_normalized(&self, query: &DataQuery) -> Result<Vec<NormalizedRow>> {
        let column = query.sort_by.column();

        let mut sql = format!(
            "SELECT id, symbol, name, price_usd, volume_24h, market_cap,
                    percent_change_24h, timestamp, source, run_id, created_at
             FROM normalized_crypto_data WHERE 1=1"
        );
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(symbol) = &query.symbol {
            sql.push_str(" AND symbol = ?");
            args.push(SqlValue::Text(symbol.to_uppercase()));
        }
        if let Some(source) = query.source {
            sql.push_str(" AND source = ?");
            args.push(SqlValue::Text(source.as_str().to_string()));
        }
        if let Some((sort_val, last_id)) = &query.cursor {
            // id breaks ties deterministically when sort values collide.
            sql.push_str(&format!(
                " AND ({col} < ? OR ({col} = ? AND id > ?))",
                col = column
            ));
            match query.sort_by {
                SortBy::Timestamp => {
                    args.push(SqlValue::Text(sort_val.clone()));
                    args.push(SqlValue::Text(sort_val.clone()));
                }
                SortBy::PriceUsd | SortBy::Volume24h => {
                    let v: f64 = sort_val
                        .parse()
                        .with_context(|| format!("Bad cursor sort value `{}`", sort_val))?;
                    args.push(SqlValue::Real(v));
                    args.push(SqlValue::Real(v));
                }
            }
            args.push(SqlValue::Integer(*last_id));
        }

        sql.push_str(&format!(" ORDER BY {col} DESC, id LIMIT ?", col = column));
        args.push(SqlValue::Integer(query.limit as i64));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args), |row| {
                Ok(NormalizedRow {
                    id: row.get(0)?,
                    symbol: row.get(1)?,
                    name: row.get(2)?,
                    price_usd: row.get(3)?,
                    volume_24h: row.get(4)?,
                    market_cap: row.get(5)?,
                    percent_change_24h: row.get(6)?,
                    timestamp: row.get(7)?,
                    source: row.get(8)?,
                    run_id: row.get(9)?,
                    created_at: row.get(10)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// The cursor value a row contributes for the configured sort column.
    pub fn sort_value(row: &NormalizedRow, sort_by: SortBy) -> String {
        match sort_by {
            SortBy::Timestamp => row.timestamp.clone(),
            SortBy::PriceUsd => row.price_usd.to_string(),
            SortBy::Volume24h => row.volume_24h.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_store() -> (tempfile::TempDir, RecordStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let store = RecordStore::open(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    fn sample_record(symbol: &str, ts_secs: i64) -> UnifiedRecord {
        UnifiedRecord {
            symbol: symbol.to_string(),
            name: format!("{symbol} Coin"),
            price_usd: 50_000.0,
            volume_24h: 1e9,
            market_cap: Some(9.5e11),
            percent_change_24h: Some(2.5),
            timestamp: Utc.timestamp_opt(ts_secs, 0).unwrap(),
            source: SourceId::CoinGecko,
        }
    }

    #[test]
    fn test_upsert_then_rewrite_is_idempotent() {
        let (_dir, store) = test_store();
        let record = sample_record("BTC", 1_700_000_000);
        let raw = RawRecord::new();

        assert_eq!(
            store.upsert(&record, &raw, "run-1").unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store.upsert(&record, &raw, "run-2").unwrap(),
            UpsertOutcome::MatchedExisting
        );

        let (raw_count, normalized_count) = store.counts().unwrap();
        assert_eq!(raw_count, 1);
        assert_eq!(normalized_count, 1);
    }

    #[test]
    fn test_normalized_record_also_in_raw() {
        let (_dir, store) = test_store();
        store
            .upsert(&sample_record("ETH", 1_700_000_100), &RawRecord::new(), "r")
            .unwrap();
        let (raw_count, normalized_count) = store.counts().unwrap();
        assert_eq!(raw_count, normalized_count);
    }

    #[test]
    fn test_watermark_absent_then_tracks_max() {
        let (_dir, store) = test_store();
        assert!(store.watermark(SourceId::CoinGecko).unwrap().is_none());

        store
            .upsert(&sample_record("BTC", 1_700_000_000), &RawRecord::new(), "r")
            .unwrap();
        store
            .upsert(&sample_record("BTC", 1_700_000_500), &RawRecord::new(), "r")
            .unwrap();
        store
            .upsert(&sample_record("BTC", 1_700_000_200), &RawRecord::new(), "r")
            .unwrap();

        let watermark = store.watermark(SourceId::CoinGecko).unwrap().unwrap();
        assert_eq!(watermark, Utc.timestamp_opt(1_700_000_500, 0).unwrap());
        // Other sources are unaffected.
        assert!(store.watermark(SourceId::CoinPaprika).unwrap().is_none());
    }

    #[test]
    fn test_cursor_pagination_is_stable_and_complete() {
        let (_dir, store) = test_store();
        for i in 0..7 {
            store
                .upsert(
                    &sample_record(&format!("C{i}"), 1_700_000_000 + i),
                    &RawRecord::new(),
                    "r",
                )
                .unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = store
                .query_normalized(&DataQuery {
                    symbol: None,
                    source: None,
                    sort_by: SortBy::Timestamp,
                    cursor: cursor.clone(),
                    limit: 3,
                })
                .unwrap();
            if page.is_empty() {
                break;
            }
            let last = page.last().unwrap();
            cursor = Some((RecordStore::sort_value(last, SortBy::Timestamp), last.id));
            seen.extend(page.into_iter().map(|r| r.symbol));
        }

        assert_eq!(seen.len(), 7);
        assert_eq!(seen[0], "C6"); // newest first
        let unique: std::collections::HashSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), 7, "pages must not overlap");
    }

    #[test]
    fn test_query_filters_by_symbol_and_source() {
        let (_dir, store) = test_store();
        store
            .upsert(&sample_record("BTC", 1_700_000_000), &RawRecord::new(), "r")
            .unwrap();
        let mut other = sample_record("ETH", 1_700_000_001);
        other.source = SourceId::CoinPaprika;
        store.upsert(&other, &RawRecord::new(), "r").unwrap();

        let rows = store
            .query_normalized(&DataQuery {
                symbol: Some("btc".to_string()),
                source: None,
                sort_by: SortBy::Timestamp,
                cursor: None,
                limit: 50,
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "BTC");

        let rows = store
            .query_normalized(&DataQuery {
                symbol: None,
                source: Some(SourceId::CoinPaprika),
                sort_by: SortBy::PriceUsd,
                cursor: None,
                limit: 50,
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].source, "coinpaprika");
    }
}
