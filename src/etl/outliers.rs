//! Outlier metering on the load path.
//!
//! Two detectors per (field, symbol) series: a z-score test over a rolling
//! window and a percentage-jump test against the previous observation.
//! Detection only meters `outlier_detected_total`; records are never
//! quarantined or dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::metrics::EtlMetrics;

const WINDOW_SIZE: usize = 20;
/// Minimum samples before the z-score test fires.
const MIN_SAMPLES: usize = 5;
const Z_THRESHOLD: f64 = 3.0;
/// Relative jump vs. the previous observation.
const JUMP_THRESHOLD: f64 = 0.5;

pub struct OutlierDetector {
    windows: Mutex<HashMap<(String, String), VecDeque<f64>>>,
    metrics: Arc<EtlMetrics>,
}

impl OutlierDetector {
    pub fn new(metrics: Arc<EtlMetrics>) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Feed one observation and meter any outlier it trips.
    pub fn observe(&self, field: &str, symbol: &str, value: f64) {
        if !value.is_finite() {
            return;
        }

        let key = (field.to_string(), symbol.to_string());
        let mut windows = self.windows.lock();
        let window = windows.entry(key).or_insert_with(VecDeque::new);

        if let Some(&previous) = window.back() {
            if previous != 0.0 {
                let jump = ((value - previous) / previous).abs();
                if jump > JUMP_THRESHOLD {
                    debug!(field, symbol, previous, value, "percentage jump outlier");
                    self.metrics.inc_outlier(field, "percentage_jump", symbol);
                }
            }
        }

        if window.len() >= MIN_SAMPLES {
            let mean = window.iter().sum::<f64>() / window.len() as f64;
            let variance = window
                .iter()
                .map(|x| (x - mean) * (x - mean))
                .sum::<f64>()
                / (window.len() - 1) as f64;
            let stddev = variance.sqrt();
            if stddev > 0.0 {
                let z = ((value - mean) / stddev).abs();
                if z > Z_THRESHOLD {
                    debug!(field, symbol, z, "z-score outlier");
                    self.metrics.inc_outlier(field, "z_score", symbol);
                }
            }
        }

        if window.len() >= WINDOW_SIZE {
            window.pop_front();
        }
        window.push_back(value);
    }
}
