// In-process candle store: a map keyed on (symbol, timestamp_ms), so repeated
// writes overwrite just like the SQLite upsert. Used for dry runs and tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;

use super::CandleStore;
use crate::types::CandleRow;

#[derive(Default)]
pub struct MemoryCandleStore {
    rows: RwLock<BTreeMap<(String, i64), CandleRow>>,
    /// Number of upcoming `insert_candles` calls that should fail.
    fail_next: AtomicUsize,
    calls: AtomicUsize,
}

impl MemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` inserts return an error without writing anything.
    #[cfg(test)]
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Total `insert_candles` calls, failed ones included.
    #[cfg(test)]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// All stored rows for `symbol`, oldest first.
    pub fn rows_for(&self, symbol: &str) -> Vec<CandleRow> {
        self.rows
            .read()
            .iter()
            .filter(|((s, _), _)| s == symbol)
            .map(|(_, row)| *row)
            .collect()
    }
}

#[async_trait]
impl CandleStore for MemoryCandleStore {
    async fn insert_candles(&self, rows: &[CandleRow], symbol: &str) -> Result<usize> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            bail!("simulated storage failure");
        }

        let mut map = self.rows.write();
        for row in rows {
            map.insert((symbol.to_string(), row.0), *row);
        }
        Ok(rows.len())
    }

    async fn recent_candles(&self, symbol: &str, limit: usize) -> Result<Vec<CandleRow>> {
        let mut rows = self.rows_for(symbol);
        let skip = rows.len().saturating_sub(limit);
        Ok(rows.split_off(skip))
    }
}
