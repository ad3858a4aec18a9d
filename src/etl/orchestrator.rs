//! Run orchestration: one `run_etl` call drives fetch, transform, validate,
//! and load for every configured source, with batch checkpoints, watermark
//! skips, and a single run-ledger entry at the end.
//!
//! Ordering is the contract that makes resume correct:
//! record writes for batch N are durable before the checkpoint for batch N,
//! the checkpoint for batch N is durable before batch N+1 starts, and on the
//! success path checkpoints are cleared before the ledger entry is written.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::EtlError;
use crate::etl::extractor::RecordFetcher;
use crate::etl::outliers::OutlierDetector;
use crate::etl::schema_mapper::SchemaMapper;
use crate::etl::validator;
use crate::metrics::{EtlMetrics, Stage};
use crate::models::{
    FailedBatch, RawRecord, ResumePoint, RunLedgerEntry, RunStatus, SourceId, SourceStats,
};
use crate::storage::{CheckpointStore, RecordStore, RunLedger, UpsertOutcome};

/// Fraction of the fetched sequence at which the synthetic fault fires.
const FAULT_INJECTION_POINT: f64 = 0.6;

pub struct Orchestrator {
    store: Arc<RecordStore>,
    checkpoints: Arc<CheckpointStore>,
    ledger: Arc<RunLedger>,
    fetcher: Arc<dyn RecordFetcher>,
    mapper: Arc<SchemaMapper>,
    metrics: Arc<EtlMetrics>,
    outliers: OutlierDetector,
    batch_size: usize,
    fault_injection: AtomicBool,
    /// Two runs never overlap: the trigger is a no-op while this is held.
    run_guard: tokio::sync::Mutex<()>,
    shutdown: Arc<AtomicBool>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<RecordStore>,
        checkpoints: Arc<CheckpointStore>,
        ledger: Arc<RunLedger>,
        fetcher: Arc<dyn RecordFetcher>,
        mapper: Arc<SchemaMapper>,
        metrics: Arc<EtlMetrics>,
        batch_size: usize,
        fault_injection: bool,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            checkpoints,
            ledger,
            fetcher,
            mapper,
            outliers: OutlierDetector::new(Arc::clone(&metrics)),
            metrics,
            batch_size: batch_size.max(1),
            fault_injection: AtomicBool::new(fault_injection),
            run_guard: tokio::sync::Mutex::new(()),
            shutdown,
        }
    }

    /// Toggle the synthetic mid-batch fault (crash-recovery drills).
    pub fn set_fault_injection(&self, enabled: bool) {
        self.fault_injection.store(enabled, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.run_guard.try_lock().is_err()
    }

    #[cfg(test)]
    pub(crate) fn try_hold_guard_for_test(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.run_guard.try_lock().expect("run guard should be free")
    }

    /// The run id the next invocation will use: an incomplete run's id is
    /// adopted so its checkpoints resume, otherwise a fresh UUID.
    pub fn next_run_id(&self) -> String {
        match self.checkpoints.latest_incomplete_run() {
            Ok(Some(run_id)) => run_id,
            Ok(None) => Uuid::new_v4().to_string(),
            Err(e) => {
                warn!(error = %e, "checkpoint lookup failed, starting a fresh run id");
                Uuid::new_v4().to_string()
            }
        }
    }

    /// One end-to-end run with an auto-selected run id.
    pub async fn run_etl(&self) -> Result<RunLedgerEntry, EtlError> {
        let run_id = self.next_run_id();
        self.run_etl_with_id(run_id).await
    }

    /// One end-to-end run under the given run id.
    pub async fn run_etl_with_id(&self, run_id: String) -> Result<RunLedgerEntry, EtlError> {
        let _guard = self
            .run_guard
            .try_lock()
            .map_err(|_| EtlError::RunInProgress)?;

        let started = Instant::now();
        let start_time = Utc::now();
        let throttles_before = self.metrics.throttle_events_total();

        info!(run_id = %run_id, "ETL run starting");

        // Natural-key indexes must exist before any write. Failure here is
        // fatal: nothing has been processed yet.
        if let Err(e) = self.store.ensure_indexes() {
            let entry = self.finalize(
                &run_id,
                start_time,
                RunStatus::Failed,
                BTreeMap::new(),
                vec![],
                BTreeMap::new(),
                Accumulated::default(),
                throttles_before,
                started,
            );
            if let Err(ledger_err) = entry {
                return Err(ledger_err);
            }
            return Err(EtlError::FatalSetup(format!("index creation failed: {e}")));
        }

        // Fan out all source fetches concurrently.
        let fetch_started = Instant::now();
        let (gecko, csv, paprika) = tokio::join!(
            self.fetcher.fetch(SourceId::CoinGecko),
            self.fetcher.fetch(SourceId::CsvArchive),
            self.fetcher.fetch(SourceId::CoinPaprika),
        );
        self.metrics
            .observe_stage(Stage::Extract, fetch_started.elapsed().as_secs_f64());

        let fetched: [(SourceId, Vec<RawRecord>); 3] = [
            (SourceId::CoinGecko, gecko),
            (SourceId::CsvArchive, csv),
            (SourceId::CoinPaprika, paprika),
        ];

        let mut source_stats = BTreeMap::new();
        let mut failed_batches = Vec::new();
        let mut resume_info = BTreeMap::new();
        let mut acc = Accumulated::default();
        let mut cancelled = false;

        for (source, records) in &fetched {
            if cancelled {
                break;
            }
            let (stats, resumed) = self.process_source(
                &run_id,
                *source,
                records,
                &mut failed_batches,
                &mut acc,
                &mut cancelled,
            );
            if let Some(point) = resumed {
                resume_info.insert(source.as_str().to_string(), point);
            }
            source_stats.insert(source.as_str().to_string(), stats);
        }

        let status = if cancelled || !failed_batches.is_empty() {
            RunStatus::PartialSuccess
        } else {
            RunStatus::Success
        };

        // Success clears checkpoints BEFORE the ledger entry lands: a crash
        // between the two is recognizable as "no checkpoints, no entry" and
        // reconciled by the next run writing the entry fresh.
        if status == RunStatus::Success {
            if let Err(e) = self.checkpoints.clear(&run_id) {
                error!(run_id = %run_id, error = %e, "checkpoint clear failed");
            }
        }

        let entry = self.finalize(
            &run_id,
            start_time,
            status,
            source_stats,
            failed_batches,
            resume_info,
            acc,
            throttles_before,
            started,
        )?;

        info!(
            run_id = %run_id,
            status = entry.status.as_str(),
            rows = entry.rows_processed(),
            skipped = entry.skipped_by_watermark(),
            latency_ms = entry.total_latency_ms,
            "ETL run finished"
        );

        Ok(entry)
    }

    /// Batch loop for one source. Returns stats plus the resume point if the
    /// source picked up from a checkpoint.
    fn process_source(
        &self,
        run_id: &str,
        source: SourceId,
        records: &[RawRecord],
        failed_batches: &mut Vec<FailedBatch>,
        acc: &mut Accumulated,
        cancelled: &mut bool,
    ) -> (SourceStats, Option<ResumePoint>) {
        let mut stats = SourceStats {
            fetched: records.len(),
            ..Default::default()
        };

        if records.is_empty() {
            return (stats, None);
        }

        // Drift detection sees the representative record before any mapping.
        let drift = self.mapper.detect_drift(source, &records[0]);
        acc.schema_versions
            .insert(source.as_str().to_string(), drift.schema_version);
        acc.applied_mappings.extend(drift.applied_mappings);
        acc.quarantined_mappings.extend(drift.quarantined_mappings);
        acc.skipped_mappings.extend(drift.skipped_mappings);

        let watermark = match self.store.watermark(source) {
            Ok(watermark) => watermark,
            Err(e) => {
                failed_batches.push(FailedBatch {
                    source,
                    batch_no: 0,
                    error: format!("watermark lookup failed: {e}"),
                    record_count: 0,
                });
                return (stats, None);
            }
        };

        let start_index = match self.checkpoints.get(run_id, source) {
            Ok(index) => index.min(records.len()),
            Err(e) => {
                failed_batches.push(FailedBatch {
                    source,
                    batch_no: 0,
                    error: format!("checkpoint read failed: {e}"),
                    record_count: 0,
                });
                return (stats, None);
            }
        };
        let resume_point = (start_index > 0).then(|| {
            info!(
                run_id = %run_id,
                source = %source,
                start_index,
                "resuming from checkpoint"
            );
            ResumePoint {
                resumed_from_batch: start_index / self.batch_size,
            }
        });

        let fault_index = (records.len() as f64 * FAULT_INJECTION_POINT).floor() as usize;

        let mut index = start_index;
        while index < records.len() {
            // Cancellation only lands on batch boundaries.
            if self.shutdown.load(Ordering::Relaxed) {
                warn!(run_id = %run_id, source = %source, "shutdown requested, stopping at batch boundary");
                *cancelled = true;
                break;
            }

            let batch_no = index / self.batch_size;
            let end = (index + self.batch_size).min(records.len());
            let batch = &records[index..end];

            // The synthetic fault fires on the batch covering the 60% index.
            if self.fault_injection.load(Ordering::Relaxed)
                && index <= fault_index
                && fault_index < end
            {
                warn!(
                    run_id = %run_id,
                    source = %source,
                    batch_no,
                    "fault injection tripped"
                );
                failed_batches.push(FailedBatch {
                    source,
                    batch_no,
                    error: "synthetic fault injected".to_string(),
                    record_count: batch.len(),
                });
                self.metrics.inc_error(source.as_str(), "batch");
                break;
            }

            match self.process_batch(run_id, source, batch, watermark, &mut stats) {
                Ok(()) => {
                    // Checkpoint only after the batch's writes are durable.
                    if let Err(e) = self.checkpoints.save(run_id, source, end) {
                        failed_batches.push(FailedBatch {
                            source,
                            batch_no,
                            error: format!("checkpoint save failed: {e}"),
                            record_count: batch.len(),
                        });
                        self.metrics.inc_error(source.as_str(), "batch");
                        break;
                    }
                }
                Err(e) => {
                    // No checkpoint for a failing batch; resume replays it.
                    error!(
                        run_id = %run_id,
                        source = %source,
                        batch_no,
                        error = %e,
                        "batch failed"
                    );
                    failed_batches.push(FailedBatch {
                        source,
                        batch_no,
                        error: e.to_string(),
                        record_count: batch.len(),
                    });
                    self.metrics.inc_error(source.as_str(), "batch");
                    break;
                }
            }

            index = end;
        }

        (stats, resume_point)
    }

    /// Transform, validate, and load one batch. Any storage error aborts the
    /// batch; validation failures and watermark skips are per-record.
    fn process_batch(
        &self,
        run_id: &str,
        source: SourceId,
        batch: &[RawRecord],
        watermark: Option<chrono::DateTime<Utc>>,
        stats: &mut SourceStats,
    ) -> anyhow::Result<()> {
        for raw in batch {
            let transform_started = Instant::now();
            let (mapped, _renames) = self.mapper.map_row(source, raw);
            let validated = validator::validate(&mapped, source);
            self.metrics
                .observe_stage(Stage::Transform, transform_started.elapsed().as_secs_f64());

            let record = match validated {
                Ok(record) => record,
                Err(e) => {
                    stats.validation_errors += 1;
                    let id = mapped
                        .get("symbol")
                        .and_then(|v| v.as_str())
                        .unwrap_or("<unknown>")
                        .to_string();
                    warn!(source = %source, id = %id, error = %e, "record failed validation");
                    stats.failed_ids.push(id);
                    self.metrics.inc_error(source.as_str(), "validation");
                    continue;
                }
            };

            if let Some(watermark) = watermark {
                if record.timestamp <= watermark {
                    stats.skipped_by_watermark += 1;
                    continue;
                }
            }

            let load_started = Instant::now();
            let outcome = self.store.upsert(&record, raw, run_id)?;
            self.metrics
                .observe_stage(Stage::Load, load_started.elapsed().as_secs_f64());

            self.outliers
                .observe("price_usd", &record.symbol, record.price_usd);
            self.outliers
                .observe("volume_24h", &record.symbol, record.volume_24h);

            stats.processed += 1;
            if outcome == UpsertOutcome::Inserted {
                stats.new_records += 1;
            }
            self.metrics.inc_rows_processed(source.as_str(), 1);
        }
        Ok(())
    }

    /// Build the entry and write it to the ledger. The ledger write is the
    /// last step and must not roll back data; its failure is fatal upward.
    #[allow(clippy::too_many_arguments)]
    fn finalize(
        &self,
        run_id: &str,
        start_time: chrono::DateTime<Utc>,
        status: RunStatus,
        source_stats: BTreeMap<String, SourceStats>,
        failed_batches: Vec<FailedBatch>,
        resume_info: BTreeMap<String, ResumePoint>,
        acc: Accumulated,
        throttles_before: u64,
        started: Instant,
    ) -> Result<RunLedgerEntry, EtlError> {
        let entry = RunLedgerEntry {
            run_id: run_id.to_string(),
            start_time,
            end_time: Utc::now(),
            status,
            source_stats,
            failed_batches,
            resume_info,
            applied_mappings: acc.applied_mappings,
            quarantined_mappings: acc.quarantined_mappings,
            skipped_mappings: acc.skipped_mappings,
            schema_versions: acc.schema_versions,
            throttle_events: self
                .metrics
                .throttle_events_total()
                .saturating_sub(throttles_before),
            total_latency_ms: started.elapsed().as_millis() as u64,
        };

        self.ledger
            .write_entry(&entry)
            .map_err(|e| EtlError::FatalSetup(format!("run ledger write failed: {e}")))?;

        Ok(entry)
    }
}

/// Drift output gathered across sources during one run.
#[derive(Default)]
struct Accumulated {
    applied_mappings: Vec<crate::models::FieldMapping>,
    quarantined_mappings: Vec<crate::models::FieldMapping>,
    skipped_mappings: Vec<crate::models::FieldMapping>,
    schema_versions: BTreeMap<String, u32>,
}
