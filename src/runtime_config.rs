// =============================================================================
// Collector Configuration: JSON file with serde defaults + env overrides
// =============================================================================
//
// Every tunable of the pipeline lives here. All fields carry a serde default
// so an empty `{}` file (or no file at all) yields the production constants.
// Environment variables are applied on top of the file by `apply_env`.
//
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_exchange() -> String {
    "binance".to_string()
}

fn default_ws_url() -> String {
    "wss://stream.binance.com:9443/ws".to_string()
}

fn default_rest_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_symbols() -> Vec<String> {
    vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()]
}

fn default_candle_interval_ms() -> i64 {
    5_000
}

fn default_trade_buffer_size() -> usize {
    2_000
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_write_batch_size() -> usize {
    25
}

fn default_max_trade_ids() -> usize {
    5_000
}

fn default_storage_concurrency() -> usize {
    3
}

fn default_ingest_max_attempts() -> u32 {
    10
}

fn default_stats_interval_secs() -> u64 {
    60
}

fn default_receive_timeout_secs() -> u64 {
    30
}

fn default_backoff_step_secs() -> u64 {
    2
}

fn default_backoff_cap_secs() -> u64 {
    30
}

fn default_queue_put_timeout_ms() -> u64 {
    1_000
}

fn default_requeue_timeout_ms() -> u64 {
    100
}

fn default_queue_get_timeout_ms() -> u64 {
    1_000
}

fn default_builder_tick_ms() -> u64 {
    1_000
}

fn default_builder_error_sleep_secs() -> u64 {
    5
}

fn default_bucketizer_error_sleep_ms() -> u64 {
    1_000
}

fn default_flush_interval_secs() -> u64 {
    5
}

fn default_low_ratio_threshold() -> f64 {
    2.0
}

fn default_db_path() -> String {
    "data/candles_5s.db".to_string()
}

fn default_bind_addr() -> String {
    "127.0.0.1:3002".to_string()
}

// =============================================================================
// Enums
// =============================================================================

/// How the dedup cache chooses which IDs to forget once it overflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupEviction {
    /// Forget the oldest-inserted IDs first.
    Insertion,
    /// Keep the largest half of IDs in sorted order.
    Sorted,
}

impl Default for DedupEviction {
    fn default() -> Self {
        Self::Insertion
    }
}

/// Which storage backend candles are flushed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    /// Keep candles in process memory (dry runs).
    Memory,
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::Sqlite
    }
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite => write!(f, "sqlite"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

// =============================================================================
// CollectorConfig
// =============================================================================

/// Top-level configuration for the trade-to-candle collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    // --- Exchange -----------------------------------------------------------

    /// Exchange adapter identifier. Only `binance` is built in.
    #[serde(default = "default_exchange")]
    pub exchange: String,

    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    #[serde(default = "default_rest_url")]
    pub rest_url: String,

    /// Unified `BASE/QUOTE` symbols to collect.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    // --- Aggregation --------------------------------------------------------

    /// Bucket width.
    #[serde(default = "default_candle_interval_ms")]
    pub candle_interval_ms: i64,

    /// Rolling per-symbol trade history kept for diagnostics.
    #[serde(default = "default_trade_buffer_size")]
    pub trade_buffer_size: usize,

    /// Depth of each per-symbol trade and candle queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_write_batch_size")]
    pub write_batch_size: usize,

    /// Dedup cache cap; the cache is cut to half of this once exceeded.
    #[serde(default = "default_max_trade_ids")]
    pub max_trade_ids: usize,

    #[serde(default)]
    pub dedup_eviction: DedupEviction,

    // --- Ingestion ----------------------------------------------------------

    /// Consecutive failed receives before a symbol's ingestor gives up.
    #[serde(default = "default_ingest_max_attempts")]
    pub ingest_max_attempts: u32,

    #[serde(default = "default_receive_timeout_secs")]
    pub receive_timeout_secs: u64,

    /// Backoff is `attempt * step`, capped at `backoff_cap_secs`.
    #[serde(default = "default_backoff_step_secs")]
    pub backoff_step_secs: u64,

    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,

    // --- Queue timing -------------------------------------------------------

    #[serde(default = "default_queue_put_timeout_ms")]
    pub queue_put_timeout_ms: u64,

    /// Per-candle put timeout when re-queuing after a failed flush.
    #[serde(default = "default_requeue_timeout_ms")]
    pub requeue_timeout_ms: u64,

    #[serde(default = "default_queue_get_timeout_ms")]
    pub queue_get_timeout_ms: u64,

    #[serde(default = "default_builder_tick_ms")]
    pub builder_tick_ms: u64,

    #[serde(default = "default_builder_error_sleep_secs")]
    pub builder_error_sleep_secs: u64,

    #[serde(default = "default_bucketizer_error_sleep_ms")]
    pub bucketizer_error_sleep_ms: u64,

    // --- Storage ------------------------------------------------------------

    #[serde(default)]
    pub storage_backend: StorageBackend,

    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Simultaneous flushes allowed across all symbols.
    #[serde(default = "default_storage_concurrency")]
    pub storage_concurrency: usize,

    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Failed writes a single candle may accumulate before it is handed to
    /// the dead-letter sink. `0` retries forever.
    #[serde(default)]
    pub max_write_retries: u32,

    /// JSON-lines file receiving dead-lettered candles. Empty logs them only.
    #[serde(default)]
    pub dead_letter_path: String,

    // --- Monitoring ---------------------------------------------------------

    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,

    /// Trades-per-candle ratio under which the monitor warns.
    #[serde(default = "default_low_ratio_threshold")]
    pub low_ratio_threshold: f64,

    /// Status API bind address; empty disables the server.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            exchange: default_exchange(),
            ws_url: default_ws_url(),
            rest_url: default_rest_url(),
            symbols: default_symbols(),
            candle_interval_ms: default_candle_interval_ms(),
            trade_buffer_size: default_trade_buffer_size(),
            queue_capacity: default_queue_capacity(),
            write_batch_size: default_write_batch_size(),
            max_trade_ids: default_max_trade_ids(),
            dedup_eviction: DedupEviction::default(),
            ingest_max_attempts: default_ingest_max_attempts(),
            receive_timeout_secs: default_receive_timeout_secs(),
            backoff_step_secs: default_backoff_step_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
            queue_put_timeout_ms: default_queue_put_timeout_ms(),
            requeue_timeout_ms: default_requeue_timeout_ms(),
            queue_get_timeout_ms: default_queue_get_timeout_ms(),
            builder_tick_ms: default_builder_tick_ms(),
            builder_error_sleep_secs: default_builder_error_sleep_secs(),
            bucketizer_error_sleep_ms: default_bucketizer_error_sleep_ms(),
            storage_backend: StorageBackend::default(),
            db_path: default_db_path(),
            storage_concurrency: default_storage_concurrency(),
            flush_interval_secs: default_flush_interval_secs(),
            max_write_retries: 0,
            dead_letter_path: String::new(),
            stats_interval_secs: default_stats_interval_secs(),
            low_ratio_threshold: default_low_ratio_threshold(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl CollectorConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read collector config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse collector config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            backend = %config.storage_backend,
            "collector config loaded"
        );

        Ok(config)
    }

    /// Config file path, overridable through `COLLECTOR_CONFIG`.
    pub fn default_path() -> PathBuf {
        std::env::var("COLLECTOR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("collector_config.json"))
    }

    /// Apply `COLLECTOR_*` environment overrides on top of the file values.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(syms) = get("COLLECTOR_SYMBOLS") {
            self.symbols = parse_symbol_list(&syms);
        }
        if let Some(path) = get("COLLECTOR_DB_PATH") {
            self.db_path = path;
        }
        if let Some(addr) = get("COLLECTOR_BIND_ADDR") {
            self.bind_addr = addr.trim().to_string();
        }
        if let Some(path) = get("COLLECTOR_DEAD_LETTER_PATH") {
            self.dead_letter_path = path.trim().to_string();
        }
    }

    /// Reject values that would make the pipeline spin or deadlock.
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            bail!("no symbols configured");
        }
        if let Some(bad) = self.symbols.iter().find(|s| s.split('/').count() != 2) {
            bail!("symbol {bad:?} is not in BASE/QUOTE form");
        }
        if self.candle_interval_ms <= 0 {
            bail!("candle_interval_ms must be positive");
        }
        if self.queue_capacity == 0 {
            bail!("queue_capacity must be positive");
        }
        if self.write_batch_size == 0 {
            bail!("write_batch_size must be positive");
        }
        if self.max_trade_ids < 2 {
            bail!("max_trade_ids must be at least 2");
        }
        if self.storage_concurrency == 0 {
            bail!("storage_concurrency must be positive");
        }
        if self.ingest_max_attempts == 0 {
            bail!("ingest_max_attempts must be positive");
        }
        if self.builder_tick_ms == 0 || self.flush_interval_secs == 0 || self.stats_interval_secs == 0
        {
            bail!("tick intervals must be positive");
        }
        if self.queue_get_timeout_ms == 0 {
            bail!("queue_get_timeout_ms must be positive");
        }
        if self.receive_timeout_secs == 0 {
            bail!("receive_timeout_secs must be positive");
        }
        // Writer retries and reconnects both sleep `backoff(n)`.
        if self.backoff_step_secs == 0 || self.backoff_cap_secs == 0 {
            bail!("backoff_step_secs and backoff_cap_secs must be positive");
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Duration helpers
    // -------------------------------------------------------------------------

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }

    /// Backoff before reconnect attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let secs = (attempt as u64)
            .saturating_mul(self.backoff_step_secs)
            .min(self.backoff_cap_secs);
        Duration::from_secs(secs)
    }

    pub fn queue_put_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_put_timeout_ms)
    }

    pub fn requeue_timeout(&self) -> Duration {
        Duration::from_millis(self.requeue_timeout_ms)
    }

    pub fn queue_get_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_get_timeout_ms)
    }

    pub fn builder_tick(&self) -> Duration {
        Duration::from_millis(self.builder_tick_ms)
    }

    pub fn builder_error_sleep(&self) -> Duration {
        Duration::from_secs(self.builder_error_sleep_secs)
    }

    pub fn bucketizer_error_sleep(&self) -> Duration {
        Duration::from_millis(self.bucketizer_error_sleep_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

/// Split a comma-separated symbol list, upper-casing and dropping blanks.
fn parse_symbol_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}
