// =============================================================================
// Per-symbol pipeline counters
// =============================================================================
//
// Lock-free atomic counters, one `SymbolStats` per symbol. Stages bump them;
// the stats monitor and the status API only read. Counters live for the
// whole process and are never reset.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

use crate::types::RawTrade;

/// Counters for one symbol's pipeline.
#[derive(Debug)]
pub struct SymbolStats {
    symbol: String,
    trades_seen: AtomicU64,
    duplicates: AtomicU64,
    invalid_trades: AtomicU64,
    trades_dropped: AtomicU64,
    candles_built: AtomicU64,
    candles_dropped: AtomicU64,
    candles_written: AtomicU64,
    write_failures: AtomicU64,
    requeue_dropped: AtomicU64,
    dead_lettered: AtomicU64,
    pending_buckets: AtomicU64,
    ingest_alive: AtomicBool,
    /// Rolling window of recently admitted trades.
    recent_trades: RwLock<VecDeque<RawTrade>>,
    recent_capacity: usize,
}

/// Serialisable point-in-time copy of [`SymbolStats`].
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub symbol: String,
    pub trades_seen: u64,
    pub duplicates: u64,
    /// Trades rejected before dedup (non-finite or non-positive price/amount).
    pub invalid_trades: u64,
    pub trades_dropped: u64,
    pub candles_built: u64,
    pub candles_dropped: u64,
    pub candles_written: u64,
    pub write_failures: u64,
    pub requeue_dropped: u64,
    pub dead_lettered: u64,
    pub pending_buckets: u64,
    pub ingest_alive: bool,
    pub last_price: Option<f64>,
    /// Trades currently held in the rolling history.
    pub recent_trades: usize,
    /// `trades_seen / candles_built`, `None` until the first candle.
    pub trades_per_candle: Option<f64>,
}

impl SymbolStats {
    pub fn new(symbol: impl Into<String>, recent_capacity: usize) -> Self {
        Self {
            symbol: symbol.into(),
            trades_seen: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            invalid_trades: AtomicU64::new(0),
            trades_dropped: AtomicU64::new(0),
            candles_built: AtomicU64::new(0),
            candles_dropped: AtomicU64::new(0),
            candles_written: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            requeue_dropped: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            pending_buckets: AtomicU64::new(0),
            ingest_alive: AtomicBool::new(false),
            recent_trades: RwLock::new(VecDeque::with_capacity(recent_capacity)),
            recent_capacity,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    // -------------------------------------------------------------------------
    // Updates
    // -------------------------------------------------------------------------

    /// Record a batch of newly admitted trades.
    pub fn record_trades(&self, trades: &[RawTrade]) {
        self.trades_seen
            .fetch_add(trades.len() as u64, Ordering::Relaxed);

        if self.recent_capacity == 0 {
            return;
        }
        let mut ring = self.recent_trades.write();
        for t in trades {
            ring.push_back(t.clone());
        }
        // Trim oldest to stay within budget.
        while ring.len() > self.recent_capacity {
            ring.pop_front();
        }
    }

    pub fn add_duplicates(&self, n: u64) {
        self.duplicates.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_invalid_trades(&self, n: u64) {
        self.invalid_trades.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_trades_dropped(&self, n: u64) {
        self.trades_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_candles_built(&self) {
        self.candles_built.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_candles_dropped(&self) {
        self.candles_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_candles_written(&self, n: u64) {
        self.candles_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_write_failures(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requeue_dropped(&self) {
        self.requeue_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_pending_buckets(&self, n: usize) {
        self.pending_buckets.store(n as u64, Ordering::Relaxed);
    }

    pub fn set_ingest_alive(&self, alive: bool) {
        self.ingest_alive.store(alive, Ordering::Relaxed);
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub fn trades_seen(&self) -> u64 {
        self.trades_seen.load(Ordering::Relaxed)
    }

    pub fn candles_built(&self) -> u64 {
        self.candles_built.load(Ordering::Relaxed)
    }

    pub fn candles_written(&self) -> u64 {
        self.candles_written.load(Ordering::Relaxed)
    }

    pub fn trades_dropped(&self) -> u64 {
        self.trades_dropped.load(Ordering::Relaxed)
    }

    pub fn ingest_alive(&self) -> bool {
        self.ingest_alive.load(Ordering::Relaxed)
    }

    pub fn last_price(&self) -> Option<f64> {
        self.recent_trades.read().back().map(|t| t.price)
    }

    pub fn recent_len(&self) -> usize {
        self.recent_trades.read().len()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let trades_seen = self.trades_seen();
        let candles_built = self.candles_built();
        StatsSnapshot {
            symbol: self.symbol.clone(),
            trades_seen,
            duplicates: self.duplicates.load(Ordering::Relaxed),
            invalid_trades: self.invalid_trades.load(Ordering::Relaxed),
            trades_dropped: self.trades_dropped(),
            candles_built,
            candles_dropped: self.candles_dropped.load(Ordering::Relaxed),
            candles_written: self.candles_written(),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            requeue_dropped: self.requeue_dropped.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            pending_buckets: self.pending_buckets.load(Ordering::Relaxed),
            ingest_alive: self.ingest_alive(),
            last_price: self.last_price(),
            recent_trades: self.recent_len(),
            trades_per_candle: (candles_built > 0)
                .then(|| trades_seen as f64 / candles_built as f64),
        }
    }
}
