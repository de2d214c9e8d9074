// Test store whose writes take a fixed time and record how many overlap.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use super::{CandleStore, MemoryCandleStore};
use crate::types::CandleRow;

pub struct SlowCandleStore {
    inner: MemoryCandleStore,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl SlowCandleStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryCandleStore::new(),
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Most writes ever observed running at the same time.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.inner.calls()
    }

    pub fn rows_for(&self, symbol: &str) -> Vec<CandleRow> {
        self.inner.rows_for(symbol)
    }
}

#[async_trait]
impl CandleStore for SlowCandleStore {
    async fn insert_candles(&self, rows: &[CandleRow], symbol: &str) -> Result<usize> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let res = self.inner.insert_candles(rows, symbol).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        res
    }

    async fn recent_candles(&self, symbol: &str, limit: usize) -> Result<Vec<CandleRow>> {
        self.inner.recent_candles(symbol, limit).await
    }
}
