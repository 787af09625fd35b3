//! Environment-driven configuration and scanner tuning constants.
//!
//! Every knob has a default so the scanner runs with no environment at all;
//! secrets never appear here; the scanner is read-only.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

/// Minimum consecutive arb ticks before a window is confirmed and published.
/// Anything shorter is a single-tick glitch and is discarded silently.
/// Must be >= 2: confirmation happens on a continuation tick.
pub const MIN_ARB_TICKS: u32 = 2;

/// Capacity for the price/window mpsc queues on the hot path.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Capacity for the persistence writer queue. Large on purpose: overflow
/// drops Opens before it ever drops Closes.
pub const WRITER_QUEUE_CAPACITY: usize = 4096;

/// Max token ids per subscribe frame; the server rejects oversized frames.
pub const SUBSCRIBE_CHUNK_SIZE: usize = 500;

/// Feed keepalive ping interval.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Reconnect backoff: start here, double per failure, cap below. Reset on a
/// successful open.
pub const RECONNECT_BASE: Duration = Duration::from_millis(100);
pub const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// Scorer cadence.
pub const SCORER_INTERVAL_SECS: u64 = 60;

/// Spread size categories (1.00 - combined ask cost).
pub mod spread_thresholds {
    use super::*;
    pub const NOISE_MAX: Decimal = dec!(0.02);
    pub const SMALL_MAX: Decimal = dec!(0.05);
    pub const MEDIUM_MAX: Decimal = dec!(0.10);
}

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path.
    pub db_path: String,
    /// HTTP API bind port.
    pub api_port: u16,
    /// tracing EnvFilter directive, e.g. "info" or "gapwatch=debug".
    pub log_level: String,
    /// Market-channel WebSocket URL.
    pub feed_ws_url: String,
    /// Catalog REST base URL.
    pub catalog_api_url: String,
    /// Cap on markets watched via the feed.
    pub max_subscriptions: usize,
    /// Admission gate: minimum 24h volume in USD.
    pub min_volume_24h: f64,
    /// Admission gate: minimum liquidity in USD.
    pub min_liquidity: f64,
    /// Markets expiring sooner than this are excluded (minutes).
    pub min_expiry_minutes: f64,
    /// Markets expiring further out than this are excluded (hours).
    pub max_expiry_hours: f64,
    /// Catalog reconciliation cadence (seconds).
    pub refresh_interval_secs: u64,
    /// Slug prefixes tracked by the pinned watcher regardless of filters,
    /// comma-separated. Example: "btc-updown-5m,eth-updown-5m".
    pub pinned_prefixes: Vec<String>,
}

fn default_feed_ws_url() -> String {
    "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string()
}

fn default_catalog_api_url() -> String {
    "https://gamma-api.polymarket.com".to_string()
}

impl Config {
    /// Build from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_port = match std::env::var("API_PORT") {
            Ok(raw) => raw.parse::<u16>().map_err(|_| ConfigError::Invalid {
                var: "API_PORT",
                value: raw,
            })?,
            Err(_) => 3000,
        };

        Ok(Self {
            db_path: env_or("DB_PATH", "gapwatch.db"),
            api_port,
            log_level: env_or("LOG_LEVEL", "info"),
            feed_ws_url: std::env::var("FEED_WS_URL").unwrap_or_else(|_| default_feed_ws_url()),
            catalog_api_url: std::env::var("CATALOG_API_URL")
                .unwrap_or_else(|_| default_catalog_api_url()),
            max_subscriptions: env_parse("SCANNER_MAX_SUBSCRIPTIONS", 200),
            min_volume_24h: env_parse("SCANNER_MIN_VOLUME_24H", 10_000.0),
            min_liquidity: env_parse("SCANNER_MIN_LIQUIDITY", 1_000.0),
            min_expiry_minutes: env_parse("SCANNER_MIN_EXPIRY_MINUTES", 30.0),
            max_expiry_hours: env_parse("SCANNER_MAX_EXPIRY_HOURS", 72.0),
            refresh_interval_secs: env_parse("REFRESH_INTERVAL_SECS", 60),
            pinned_prefixes: std::env::var("PINNED_PREFIXES")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }
}

fn env_or(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spread_thresholds_are_ordered() {
        assert!(spread_thresholds::NOISE_MAX < spread_thresholds::SMALL_MAX);
        assert!(spread_thresholds::SMALL_MAX < spread_thresholds::MEDIUM_MAX);
    }
}
