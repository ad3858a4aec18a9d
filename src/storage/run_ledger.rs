//! Append-only run ledger: one durable record per ETL invocation.
//!
//! The full entry is stored as JSON next to a few promoted columns that the
//! /stats aggregation reads without deserializing every entry. A resumed
//! attempt finalizes the same run id's record, so the write is an upsert on
//! the primary key rather than a blind insert.

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::info;

use crate::models::{format_timestamp, RunLedgerEntry};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS etl_runs (
    run_id TEXT PRIMARY KEY,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    status TEXT NOT NULL,
    rows_processed INTEGER NOT NULL,
    new_records INTEGER NOT NULL,
    skipped_by_watermark INTEGER NOT NULL,
    total_latency_ms INTEGER NOT NULL,
    entry_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_etl_runs_end_time
    ON etl_runs(end_time DESC);
"#;

/// Aggregates across all ledger entries, for /stats.
#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerTotals {
    pub runs: i64,
    pub rows_processed: i64,
    /// Cumulative watermark skips: every one is a duplicate write prevented.
    pub skipped_by_watermark: i64,
    pub avg_latency_ms: f64,
}

pub struct RunLedger {
    conn: Arc<Mutex<Connection>>,
}

impl RunLedger {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open run ledger at {}", db_path))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize run ledger schema")?;

        info!("run ledger initialized at {}", db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Must be total: data writes are never rolled back if this fails, the
    /// caller escalates instead.
    pub fn write_entry(&self, entry: &RunLedgerEntry) -> Result<()> {
        let entry_json =
            serde_json::to_string(entry).context("Failed to serialize run ledger entry")?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO etl_runs
             (run_id, start_time, end_time, status, rows_processed, new_records,
              skipped_by_watermark, total_latency_ms, entry_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(run_id) DO UPDATE SET
                 end_time = excluded.end_time,
                 status = excluded.status,
                 rows_processed = excluded.rows_processed,
                 new_records = excluded.new_records,
                 skipped_by_watermark = excluded.skipped_by_watermark,
                 total_latency_ms = excluded.total_latency_ms,
                 entry_json = excluded.entry_json",
            params![
                entry.run_id,
                format_timestamp(&entry.start_time),
                format_timestamp(&entry.end_time),
                entry.status.as_str(),
                entry.rows_processed() as i64,
                entry.new_records() as i64,
                entry.skipped_by_watermark() as i64,
                entry.total_latency_ms as i64,
                entry_json,
            ],
        )
        .context("Failed to write run ledger entry")?;
        Ok(())
    }

    pub fn list_recent(&self, limit: usize) -> Result<Vec<RunLedgerEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT entry_json FROM etl_runs ORDER BY end_time DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .filter_map(|json| serde_json::from_str(&json).ok())
            .collect();
        Ok(entries)
    }

    pub fn get_by_id(&self, run_id: &str) -> Result<Option<RunLedgerEntry>> {
        let conn = self.conn.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT entry_json FROM etl_runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(json) => {
                let entry =
                    serde_json::from_str(&json).context("Corrupt run ledger entry")?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Most recent entry, if any run has completed.
    pub fn last_entry(&self) -> Result<Option<RunLedgerEntry>> {
        Ok(self.list_recent(1)?.into_iter().next())
    }

    pub fn totals(&self) -> Result<LedgerTotals> {
        let conn = self.conn.lock();
        let totals = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(rows_processed), 0),
                    COALESCE(SUM(skipped_by_watermark), 0),
                    COALESCE(AVG(total_latency_ms), 0.0)
             FROM etl_runs",
            [],
            |row| {
                Ok(LedgerTotals {
                    runs: row.get(0)?,
                    rows_processed: row.get(1)?,
                    skipped_by_watermark: row.get(2)?,
                    avg_latency_ms: row.get(3)?,
                })
            },
        )?;
        Ok(totals)
    }
}
