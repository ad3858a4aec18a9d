//! Environment-driven configuration.
//!
//! Everything has a sane default so a bare `cargo run` comes up against
//! public endpoints and a local SQLite file.

use std::collections::HashMap;

use anyhow::{ensure, Result};

use crate::models::SourceId;

/// Admission budget for one source.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub requests_per_minute: f64,
    pub burst_capacity: f64,
    pub retry_backoff_ms: u64,
}

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub coingecko_url: String,
    pub coinpaprika_url: String,
    pub csv_archive_path: String,
    pub batch_size: usize,
    pub fault_injection: bool,
    /// 0 disables the scheduler; runs are then trigger-only.
    pub etl_interval_secs: u64,
    pub rate_limits: HashMap<SourceId, RateLimitConfig>,
    pub record_caps: HashMap<SourceId, usize>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_path = std::env::var("DATABASE_PATH")
            .unwrap_or_else(|_| "./coinflow.db".to_string());

        let port = env_or("PORT", 8080u16);

        let coingecko_url = std::env::var("COINGECKO_URL").unwrap_or_else(|_| {
            "https://api.coingecko.com/api/v3/coins/markets?vs_currency=usd".to_string()
        });
        let coinpaprika_url = std::env::var("COINPAPRIKA_URL")
            .unwrap_or_else(|_| "https://api.coinpaprika.com/v1/tickers".to_string());
        let csv_archive_path = std::env::var("CSV_ARCHIVE_PATH")
            .unwrap_or_else(|_| "./data/crypto_archive.csv".to_string());

        let batch_size = env_or("BATCH_SIZE", 5usize);
        ensure!(batch_size >= 1, "BATCH_SIZE must be >= 1");

        let fault_injection = env_flag("FAULT_INJECTION", false);
        let etl_interval_secs = env_or("ETL_INTERVAL_SECS", 0u64);

        let mut rate_limits = HashMap::new();
        let mut record_caps = HashMap::new();
        for (source, prefix, rpm, burst, backoff_ms, cap) in [
            (SourceId::CoinGecko, "COINGECKO", 30.0, 10.0, 2000u64, 10usize),
            (SourceId::CsvArchive, "CSV_ARCHIVE", 60.0, 10.0, 1000, 5),
            (SourceId::CoinPaprika, "COINPAPRIKA", 3.0, 3.0, 1500, 3),
        ] {
            rate_limits.insert(
                source,
                RateLimitConfig {
                    requests_per_minute: env_or(&format!("{prefix}_REQUESTS_PER_MINUTE"), rpm),
                    burst_capacity: env_or(&format!("{prefix}_BURST_CAPACITY"), burst),
                    retry_backoff_ms: env_or(&format!("{prefix}_RETRY_BACKOFF_MS"), backoff_ms),
                },
            );
            record_caps.insert(source, env_or(&format!("{prefix}_RECORD_CAP"), cap));
        }

        Ok(Self {
            database_path,
            port,
            coingecko_url,
            coinpaprika_url,
            csv_archive_path,
            batch_size,
            fault_injection,
            etl_interval_secs,
            rate_limits,
            record_caps,
        })
    }

    pub fn rate_limit(&self, source: SourceId) -> RateLimitConfig {
        self.rate_limits
            .get(&source)
            .copied()
            .unwrap_or(RateLimitConfig {
                requests_per_minute: 60.0,
                burst_capacity: 10.0,
                retry_backoff_ms: 1000,
            })
    }

    pub fn record_cap(&self, source: SourceId) -> usize {
        self.record_caps.get(&source).copied().unwrap_or(usize::MAX)
    }
}
