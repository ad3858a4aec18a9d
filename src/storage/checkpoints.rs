//! Durable batch checkpoints: `(run_id, source) -> last_processed_index`.
//!
//! The stored index is the count of records consumed, so a resumed pass
//! continues at `records[last_processed_index..]`. A checkpoint row must
//! only be written after the batch's record writes are durable; that
//! ordering is the whole resume guarantee.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::info;

use crate::models::{format_timestamp, SourceId};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS etl_checkpoints (
    run_id TEXT NOT NULL,
    source TEXT NOT NULL,
    last_processed_index INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (run_id, source)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_checkpoints_updated_at
    ON etl_checkpoints(updated_at DESC);
"#;

pub struct CheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl CheckpointStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open checkpoint store at {}", db_path))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize checkpoint schema")?;

        info!("checkpoint store initialized at {}", db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Upsert, clamped so the stored index never decreases for the same key.
    pub fn save(&self, run_id: &str, source: SourceId, last_processed_index: usize) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO etl_checkpoints (run_id, source, last_processed_index, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(run_id, source) DO UPDATE SET
                 last_processed_index = MAX(last_processed_index, excluded.last_processed_index),
                 updated_at = excluded.updated_at",
            params![
                run_id,
                source.as_str(),
                last_processed_index as i64,
                format_timestamp(&Utc::now()),
            ],
        )
        .context("Failed to save checkpoint")?;
        Ok(())
    }

    /// 0 when no checkpoint exists.
    pub fn get(&self, run_id: &str, source: SourceId) -> Result<usize> {
        let conn = self.conn.lock();
        let index: Option<i64> = conn
            .query_row(
                "SELECT last_processed_index FROM etl_checkpoints
                 WHERE run_id = ?1 AND source = ?2",
                params![run_id, source.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(index.unwrap_or(0) as usize)
    }

    /// Remove every checkpoint tagged with this run. Called on SUCCESS only.
    pub fn clear(&self, run_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM etl_checkpoints WHERE run_id = ?1",
            params![run_id],
        )?;
        Ok(removed)
    }

    /// (source, last_processed_index) pairs for a run.
    pub fn list_for_run(&self, run_id: &str) -> Result<Vec<(String, usize)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT source, last_processed_index FROM etl_checkpoints
             WHERE run_id = ?1 ORDER BY source",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Run id of the most recently touched surviving checkpoints, if any.
    ///
    /// Checkpoints only survive a run that did not finish cleanly, so the
    /// presence of rows is itself the incomplete-run signal. The orchestrator
    /// adopts this run id to resume.
    pub fn latest_incomplete_run(&self) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let run_id: Option<String> = conn
            .query_row(
                "SELECT run_id FROM etl_checkpoints
                 GROUP BY run_id ORDER BY MAX(updated_at) DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_checkpoints() -> (tempfile::TempDir, CheckpointStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.db");
        let store = CheckpointStore::open(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_get_defaults_to_zero() {
        let (_dir, store) = test_checkpoints();
        assert_eq!(store.get("missing", SourceId::CoinGecko).unwrap(), 0);
    }

    #[test]
    fn test_save_is_monotonic_per_key() {
        let (_dir, store) = test_checkpoints();
        store.save("run-1", SourceId::CoinGecko, 10).unwrap();
        store.save("run-1", SourceId::CoinGecko, 5).unwrap();
        assert_eq!(store.get("run-1", SourceId::CoinGecko).unwrap(), 10);

        store.save("run-1", SourceId::CoinGecko, 15).unwrap();
        assert_eq!(store.get("run-1", SourceId::CoinGecko).unwrap(), 15);
    }

    #[test]
    fn test_clear_removes_only_the_given_run() {
        let (_dir, store) = test_checkpoints();
        store.save("run-1", SourceId::CoinGecko, 10).unwrap();
        store.save("run-1", SourceId::CoinPaprika, 3).unwrap();
        store.save("run-2", SourceId::CoinGecko, 7).unwrap();

        assert_eq!(store.clear("run-1").unwrap(), 2);
        assert!(store.list_for_run("run-1").unwrap().is_empty());
        assert_eq!(store.get("run-2", SourceId::CoinGecko).unwrap(), 7);
    }

    #[test]
    fn test_latest_incomplete_run_prefers_most_recent() {
        let (_dir, store) = test_checkpoints();
        assert!(store.latest_incomplete_run().unwrap().is_none());

        store.save("run-old", SourceId::CoinGecko, 5).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.save("run-new", SourceId::CsvArchive, 2).unwrap();

        assert_eq!(
            store.latest_incomplete_run().unwrap().as_deref(),
            Some("run-new")
        );
    }
}
