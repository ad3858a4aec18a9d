//! Per-source admission control: token buckets with burst capacity and a
//! single bounded backoff retry, plus a short-TTL cache of the last good
//! payload so a throttled source can serve stale-but-recent data instead of
//! sleeping.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::metrics::EtlMetrics;
use crate::models::{RawRecord, SourceId};

/// Refill interval the per-minute quota is spread over.
const REFILL_INTERVAL: Duration = Duration::from_secs(60);

/// Age past which a cached payload is no longer served.
const CACHE_TTL: Duration = Duration::from_secs(60);

/// Outcome of one `acquire` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Ok,
    /// Still exhausted after one backoff sleep; hint says when the next
    /// token lands. The caller decides whether to come back.
    Throttled { wait_hint: Duration },
}

#[derive(Debug)]
struct TokenBucket {
    limit_per_minute: f64,
    burst_capacity: f64,
    tokens: f64,
    last_refill: Instant,
    retry_backoff: Duration,
}

impl TokenBucket {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            limit_per_minute: config.requests_per_minute,
            burst_capacity: config.burst_capacity,
            // A fresh bucket starts full.
            tokens: config.burst_capacity,
            last_refill: Instant::now(),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    /// Lazy refill: whole tokens earned since the last refill are credited
    /// and the clock only advances when at least one token landed, so the
    /// fractional remainder keeps accruing.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill);
        let earned =
            (elapsed.as_secs_f64() / REFILL_INTERVAL.as_secs_f64() * self.limit_per_minute).floor();
        if earned > 0.0 {
            self.tokens = (self.tokens + earned).min(self.burst_capacity);
            self.last_refill = now;
        }
    }

    fn try_take(&mut self, now: Instant) -> Result<f64, Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(self.tokens)
        } else {
            let deficit = 1.0 - self.tokens;
            let wait_secs = deficit / self.limit_per_minute * REFILL_INTERVAL.as_secs_f64();
            Err(Duration::from_secs_f64(wait_secs))
        }
    }
}

/// Token-bucket admission per source. All bucket state lives behind one
/// mutex, so concurrent acquires on a source are serialized and the refill
/// happens once per critical section.
pub struct RateGate {
    buckets: Mutex<HashMap<SourceId, TokenBucket>>,
    metrics: Arc<EtlMetrics>,
}

impl RateGate {
    pub fn new(
        limits: impl IntoIterator<Item = (SourceId, RateLimitConfig)>,
        metrics: Arc<EtlMetrics>,
    ) -> Self {
        let mut buckets = HashMap::new();
        for (source, config) in limits {
            metrics.set_quota_rpm(source.as_str(), config.requests_per_minute);
            buckets.insert(source, TokenBucket::new(config));
        }
        Self {
            buckets: Mutex::new(buckets),
            metrics,
        }
    }

    /// Non-blocking admission check. Used by the extractor to prefer the
    /// payload cache over sleeping.
    pub fn try_acquire(&self, source: SourceId) -> Result<(), Duration> {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(source)
            .or_insert_with(|| TokenBucket::new(default_limit()));
        match bucket.try_take(Instant::now()) {
            Ok(remaining) => {
                self.metrics.set_tokens_remaining(source.as_str(), remaining);
                Ok(())
            }
            Err(wait_hint) => Err(wait_hint),
        }
    }

    /// Blocking admission: on exhaustion, count a throttle event, sleep the
    /// source's backoff once, observe the retry latency, and try again.
    /// At most one sleep per invocation.
    pub async fn acquire(&self, source: SourceId) -> Admission {
        if self.try_acquire(source).is_ok() {
            return Admission::Ok;
        }

        self.metrics.inc_throttle(source.as_str());
        let backoff = self.backoff_for(source);
        debug!(source = %source, backoff_ms = backoff.as_millis() as u64, "throttled, backing off");

        let slept_at = Instant::now();
        sleep(backoff).await;
        self.metrics
            .observe_retry(source.as_str(), slept_at.elapsed().as_secs_f64());

        match self.try_acquire(source) {
            Ok(()) => Admission::Ok,
            Err(wait_hint) => Admission::Throttled { wait_hint },
        }
    }

    fn backoff_for(&self, source: SourceId) -> Duration {
        self.buckets
            .lock()
            .get(&source)
            .map(|b| b.retry_backoff)
            .unwrap_or(Duration::from_secs(1))
    }

    /// Current token count, for introspection and tests.
    pub fn tokens(&self, source: SourceId) -> f64 {
        self.buckets
            .lock()
            .get(&source)
            .map(|b| b.tokens)
            .unwrap_or(0.0)
    }
}

fn default_limit() -> RateLimitConfig {
    RateLimitConfig {
        requests_per_minute: 60.0,
        burst_capacity: 10.0,
        retry_backoff_ms: 1000,
    }
}

/// Last successful payload per source, served while fresh when admission is
/// denied. Keyed by source identity (the keyspace is the source count, so no
/// eviction policy beyond expiry-at-read is needed).
#[derive(Default)]
pub struct PayloadCache {
    entries: Mutex<HashMap<SourceId, (Instant, Arc<Vec<RawRecord>>)>>,
}

impl PayloadCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, source: SourceId, records: Vec<RawRecord>) {
        self.entries
            .lock()
            .insert(source, (Instant::now(), Arc::new(records)));
    }

    /// Fresh payload, or None. Expired entries are dropped on read.
    pub fn get(&self, source: SourceId) -> Option<Arc<Vec<RawRecord>>> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(&source) {
            Some((stored_at, records)) => {
                if stored_at.elapsed() < CACHE_TTL {
                    return Some(Arc::clone(records));
                }
                true
            }
            None => false,
        };
        if expired {
            entries.remove(&source);
        }
        None
    }
}
