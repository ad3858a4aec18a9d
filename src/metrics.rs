//! Prometheus metrics for the ETL pipeline.
//!
//! Instrument names are contractual: scrapers depend on them staying stable
//! across releases. Exposition is the plain text format served at /metrics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Pipeline stages instrumented with latency histograms.
#[derive(Debug, Clone, Copy)]
pub enum Stage {
    Extract,
    Transform,
    Load,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Transform => "transform",
            Stage::Load => "load",
        }
    }
}

/// Fixed-bucket latency histogram.
///
/// Observations are stored in microseconds so sums stay atomic; boundaries
/// are rendered back as seconds in the exposition.
#[derive(Debug)]
pub struct LatencyHistogram {
    /// Bucket boundaries in microseconds.
    buckets: Vec<u64>,
    counts: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    /// Boundaries given in seconds.
    pub fn with_buckets(boundaries_secs: &[f64]) -> Self {
        let buckets: Vec<u64> = boundaries_secs
            .iter()
            .map(|s| (s * 1_000_000.0) as u64)
            .collect();
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe_seconds(&self, value_secs: f64) {
        let value_us = (value_secs * 1_000_000.0) as u64;
        for (i, &boundary) in self.buckets.iter().enumerate() {
            if value_us <= boundary {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
        self.sum.fetch_add(value_us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean_seconds(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.sum.load(Ordering::Relaxed) as f64 / count as f64 / 1_000_000.0
    }

    /// Render as Prometheus histogram lines with cumulative buckets.
    pub fn to_prometheus(&self, name: &str, labels: &str) -> String {
        let mut output = String::new();
        let mut cumulative = 0u64;

        for (i, &boundary) in self.buckets.iter().enumerate() {
            cumulative += self.counts[i].load(Ordering::Relaxed);
            output.push_str(&format!(
                "{}_bucket{{{},le=\"{}\"}} {}\n",
                name,
                labels,
                boundary as f64 / 1_000_000.0,
                cumulative
            ));
        }

        let total = self.count.load(Ordering::Relaxed);
        output.push_str(&format!(
            "{}_bucket{{{},le=\"+Inf\"}} {}\n",
            name, labels, total
        ));
        output.push_str(&format!(
            "{}_sum{{{}}} {}\n",
            name,
            labels,
            self.sum.load(Ordering::Relaxed) as f64 / 1_000_000.0
        ));
        output.push_str(&format!("{}_count{{{}}} {}\n", name, labels, total));

        output
    }
}

const STAGE_BUCKETS: [f64; 10] = [0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];
const RETRY_BUCKETS: [f64; 6] = [0.1, 0.5, 1.0, 2.0, 5.0, 10.0];

/// Process-wide metrics registry for the ETL pipeline.
#[derive(Debug, Default)]
pub struct EtlMetrics {
    /// source -> rows upserted
    rows_processed: RwLock<HashMap<String, AtomicU64>>,
    /// "source:type" -> error count
    errors: RwLock<HashMap<String, AtomicU64>>,
    /// stage -> latency histogram
    stage_latency: RwLock<HashMap<String, LatencyHistogram>>,
    /// source -> throttle count
    throttle_events: RwLock<HashMap<String, AtomicU64>>,
    /// source -> backoff-sleep latency histogram
    retry_latency: RwLock<HashMap<String, LatencyHistogram>>,
    /// source -> tokens left in the bucket after the last acquire
    tokens_remaining: RwLock<HashMap<String, f64>>,
    /// source -> configured quota, set once at startup
    quota_rpm: RwLock<HashMap<String, f64>>,
    /// "field:type:symbol" -> outlier count
    outliers: RwLock<HashMap<String, AtomicU64>>,
}

impl EtlMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_rows_processed(&self, source: &str, n: u64) {
        let mut map = self.rows_processed.write();
        map.entry(source.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_error(&self, source: &str, error_type: &str) {
        let key = format!("{}:{}", source, error_type);
        let mut map = self.errors.write();
        map.entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_stage(&self, stage: Stage, secs: f64) {
        let mut map = self.stage_latency.write();
        map.entry(stage.as_str().to_string())
            .or_insert_with(|| LatencyHistogram::with_buckets(&STAGE_BUCKETS))
            .observe_seconds(secs);
    }

    pub fn inc_throttle(&self, source: &str) {
        let mut map = self.throttle_events.write();
        map.entry(source.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_retry(&self, source: &str, secs: f64) {
        let mut map = self.retry_latency.write();
        map.entry(source.to_string())
            .or_insert_with(|| LatencyHistogram::with_buckets(&RETRY_BUCKETS))
            .observe_seconds(secs);
    }

    pub fn set_tokens_remaining(&self, source: &str, tokens: f64) {
        self.tokens_remaining
            .write()
            .insert(source.to_string(), tokens);
    }

    pub fn set_quota_rpm(&self, source: &str, rpm: f64) {
        self.quota_rpm.write().insert(source.to_string(), rpm);
    }

    pub fn inc_outlier(&self, field: &str, outlier_type: &str, symbol: &str) {
        let key = format!("{}:{}:{}", field, outlier_type, symbol);
        let mut map = self.outliers.write();
        map.entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn throttle_events_for(&self, source: &str) -> u64 {
        self.throttle_events
            .read()
            .get(source)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn throttle_events_total(&self) -> u64 {
        self.throttle_events
            .read()
            .values()
            .map(|v| v.load(Ordering::Relaxed))
            .sum()
    }

    pub fn retry_observations_for(&self, source: &str) -> u64 {
        self.retry_latency
            .read()
            .get(source)
            .map(|h| h.count())
            .unwrap_or(0)
    }

    pub fn rows_processed_total(&self) -> u64 {
        self.rows_processed
            .read()
            .values()
            .map(|v| v.load(Ordering::Relaxed))
            .sum()
    }

    pub fn errors_total(&self) -> u64 {
        self.errors
            .read()
            .values()
            .map(|v| v.load(Ordering::Relaxed))
            .sum()
    }

    /// Mean latency across all stages, in milliseconds. Used by /stats.
    pub fn mean_stage_latency_ms(&self) -> f64 {
        let map = self.stage_latency.read();
        let (mut sum_us, mut count) = (0.0f64, 0u64);
        for hist in map.values() {
            sum_us += hist.mean_seconds() * 1_000_000.0 * hist.count() as f64;
            count += hist.count();
        }
        if count == 0 {
            return 0.0;
        }
        sum_us / count as f64 / 1000.0
    }

    /// Export everything in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP etl_rows_processed_total Rows upserted per source\n");
        output.push_str("# TYPE etl_rows_processed_total counter\n");
        for (source, count) in self.rows_processed.read().iter() {
            output.push_str(&format!(
                "etl_rows_processed_total{{source=\"{}\"}} {}\n",
                source,
                count.load(Ordering::Relaxed)
            ));
        }

        output.push_str("\n# HELP etl_errors_total Pipeline errors per source and type\n");
        output.push_str("# TYPE etl_errors_total counter\n");
        for (key, count) in self.errors.read().iter() {
            if let Some((source, error_type)) = key.split_once(':') {
                output.push_str(&format!(
                    "etl_errors_total{{source=\"{}\",type=\"{}\"}} {}\n",
                    source,
                    error_type,
                    count.load(Ordering::Relaxed)
                ));
            }
        }

        output.push_str("\n# HELP etl_latency_seconds Stage latency\n");
        output.push_str("# TYPE etl_latency_seconds histogram\n");
        for (stage, hist) in self.stage_latency.read().iter() {
            let labels = format!("stage=\"{}\"", stage);
            output.push_str(&hist.to_prometheus("etl_latency_seconds", &labels));
        }

        output.push_str("\n# HELP throttle_events_total Rate-gate admissions denied\n");
        output.push_str("# TYPE throttle_events_total counter\n");
        for (source, count) in self.throttle_events.read().iter() {
            output.push_str(&format!(
                "throttle_events_total{{source=\"{}\"}} {}\n",
                source,
                count.load(Ordering::Relaxed)
            ));
        }

        output.push_str("\n# HELP retry_latency_seconds Backoff sleep before re-acquire\n");
        output.push_str("# TYPE retry_latency_seconds histogram\n");
        for (source, hist) in self.retry_latency.read().iter() {
            let labels = format!("source=\"{}\"", source);
            output.push_str(&hist.to_prometheus("retry_latency_seconds", &labels));
        }

        output.push_str("\n# HELP tokens_remaining Tokens left in the bucket\n");
        output.push_str("# TYPE tokens_remaining gauge\n");
        for (source, tokens) in self.tokens_remaining.read().iter() {
            output.push_str(&format!(
                "tokens_remaining{{source=\"{}\"}} {:.3}\n",
                source, tokens
            ));
        }

        output.push_str("\n# HELP quota_requests_per_minute Configured per-source quota\n");
        output.push_str("# TYPE quota_requests_per_minute gauge\n");
        for (source, rpm) in self.quota_rpm.read().iter() {
            output.push_str(&format!(
                "quota_requests_per_minute{{source=\"{}\"}} {}\n",
                source, rpm
            ));
        }

        output.push_str("\n# HELP outlier_detected_total Price/volume outliers observed on load\n");
        output.push_str("# TYPE outlier_detected_total counter\n");
        for (key, count) in self.outliers.read().iter() {
            let parts: Vec<&str> = key.splitn(3, ':').collect();
            if parts.len() == 3 {
                output.push_str(&format!(
                    "outlier_detected_total{{field=\"{}\",type=\"{}\",symbol=\"{}\"}} {}\n",
                    parts[0],
                    parts[1],
                    parts[2],
                    count.load(Ordering::Relaxed)
                ));
            }
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let h = LatencyHistogram::with_buckets(&RETRY_BUCKETS);
        h.observe_seconds(0.05);
        h.observe_seconds(0.3);
        h.observe_seconds(7.0);

        let out = h.to_prometheus("retry_latency_seconds", "source=\"coinpaprika\"");
        assert!(out.contains("le=\"0.1\"} 1"));
        assert!(out.contains("le=\"+Inf\"} 3"));
        assert!(out.contains("retry_latency_seconds_count{source=\"coinpaprika\"} 3"));
    }

    #[test]
    fn test_exposition_contains_contractual_names() {
        let m = EtlMetrics::new();
        m.inc_rows_processed("coingecko", 10);
        m.inc_error("coinpaprika", "network");
        m.observe_stage(Stage::Extract, 0.2);
        m.inc_throttle("coinpaprika");
        m.observe_retry("coinpaprika", 1.5);
        m.set_tokens_remaining("coingecko", 9.0);
        m.set_quota_rpm("coingecko", 30.0);
        m.inc_outlier("price_usd", "z_score", "BTC");

        let out = m.to_prometheus();
        for name in [
            "etl_rows_processed_total{source=\"coingecko\"} 10",
            "etl_errors_total{source=\"coinpaprika\",type=\"network\"} 1",
            "etl_latency_seconds_bucket{stage=\"extract\"",
            "throttle_events_total{source=\"coinpaprika\"} 1",
            "retry_latency_seconds_bucket{source=\"coinpaprika\"",
            "tokens_remaining{source=\"coingecko\"} 9.000",
            "quota_requests_per_minute{source=\"coingecko\"} 30",
            "outlier_detected_total{field=\"price_usd\",type=\"z_score\",symbol=\"BTC\"} 1",
        ] {
            assert!(out.contains(name), "missing exposition line: {name}\n{out}");
        }
    }

    #[test]
    fn test_mean_stage_latency() {
        let m = EtlMetrics::new();
        m.observe_stage(Stage::Load, 1.0);
        m.observe_stage(Stage::Load, 3.0);
        let mean = m.mean_stage_latency_ms();
        assert!((mean - 2000.0).abs() < 1.0, "mean was {mean}");
    }
}
