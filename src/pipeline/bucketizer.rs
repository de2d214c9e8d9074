// =============================================================================
// Trade Bucketizer: groups queued trades by bucket boundary
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::runtime_config::CollectorConfig;
use crate::stats::SymbolStats;
use crate::types::{candle_boundary, RawTrade};

/// Trades accumulated per not-yet-closed bucket, keyed by boundary.
///
/// Shared by exactly two tasks of the same symbol: the bucketizer (writes)
/// and the candle builder (removes closed buckets).
#[derive(Clone, Default)]
pub struct PendingBuckets {
    inner: Arc<Mutex<BTreeMap<i64, Vec<RawTrade>>>>,
}

impl PendingBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open buckets.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[cfg(test)]
    pub fn trade_count(&self) -> usize {
        self.inner.lock().values().map(Vec::len).sum()
    }

    /// Append every valid trade of `batch` to its bucket.
    ///
    /// The ingestor already discards invalid trades, so one arriving here
    /// means an upstream bug: it is skipped and reported as an error after
    /// the rest of the batch is stored.
    pub fn add_batch(&self, batch: Vec<RawTrade>, interval_ms: i64) -> Result<usize> {
        let mut rejected = 0usize;
        let mut added = 0usize;
        {
            let mut map = self.inner.lock();
            for trade in batch {
                if !trade.is_valid() {
                    rejected += 1;
                    continue;
                }
                let boundary = candle_boundary(trade.timestamp_ms, interval_ms);
                map.entry(boundary).or_default().push(trade);
                added += 1;
            }
        }
        if rejected > 0 {
            bail!("skipped {rejected} invalid trades ({added} bucketed)");
        }
        Ok(added)
    }

    /// Remove and return every bucket whose boundary is below `cutoff`,
    /// oldest first.
    pub fn take_before(&self, cutoff: i64) -> Vec<(i64, Vec<RawTrade>)> {
        let mut map = self.inner.lock();
        let still_open = map.split_off(&cutoff);
        std::mem::replace(&mut *map, still_open).into_iter().collect()
    }
}

/// Drain the trade queue into `pending` until cancelled or the queue closes.
pub async fn run_bucketizer(
    symbol: String,
    mut trade_rx: mpsc::Receiver<Vec<RawTrade>>,
    pending: PendingBuckets,
    stats: Arc<SymbolStats>,
    config: Arc<CollectorConfig>,
    cancel: CancellationToken,
) {
    info!(symbol = %symbol, "bucketizer started");
    let get_timeout = config.queue_get_timeout();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            r = tokio::time::timeout(get_timeout, trade_rx.recv()) => r,
        };

        let batch = match next {
            // Nothing arrived in time; loop to re-check the stop signal.
            Err(_elapsed) => continue,
            Ok(None) => {
                info!(symbol = %symbol, "trade queue closed");
                break;
            }
            Ok(Some(batch)) => batch,
        };

        match pending.add_batch(batch, config.candle_interval_ms) {
            Ok(n) => debug!(symbol = %symbol, trades = n, "trades bucketed"),
            Err(e) => {
                error!(symbol = %symbol, error = %e, "bucketizer error");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.bucketizer_error_sleep()) => {}
                }
            }
        }
        stats.set_pending_buckets(pending.len());
    }

    info!(symbol = %symbol, "bucketizer stopped");
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::trade;

    #[test]
    fn trades_grouped_by_boundary() {
        let pending = PendingBuckets::new();
        let batch = vec![
            trade("ETH/USDT", "1", 1_734_000_007_123, 1.0, 1.0),
            trade("ETH/USDT", "2", 1_734_000_005_000, 1.0, 1.0),
            trade("ETH/USDT", "3", 1_734_000_010_000, 1.0, 1.0),
        ];
        assert_eq!(pending.add_batch(batch, 5000).unwrap(), 3);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending.trade_count(), 3);

        let taken = pending.take_before(i64::MAX);
        assert_eq!(taken[0].0, 1_734_000_005_000);
        assert_eq!(taken[0].1.len(), 2);
        assert_eq!(taken[1].0, 1_734_000_010_000);
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn take_before_leaves_newer_buckets() {
        let pending = PendingBuckets::new();
        pending
            .add_batch(
                vec![
                    trade("ETH/USDT", "1", 0, 1.0, 1.0),
                    trade("ETH/USDT", "2", 5_000, 1.0, 1.0),
                    trade("ETH/USDT", "3", 10_000, 1.0, 1.0),
                ],
                5000,
            )
            .unwrap();

        let taken = pending.take_before(5_000);
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].0, 0);
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn invalid_trades_skipped_with_error() {
        let pending = PendingBuckets::new();
        let res = pending.add_batch(
            vec![
                trade("ETH/USDT", "1", 0, 1.0, 1.0),
                trade("ETH/USDT", "2", 0, f64::NAN, 1.0),
            ],
            5000,
        );
        assert!(res.is_err());
        assert_eq!(pending.trade_count(), 1);
    }

    #[tokio::test]
    async fn bucketizer_task_drains_queue() {
        let (tx, rx) = mpsc::channel(4);
        let pending = PendingBuckets::new();
        let stats = Arc::new(SymbolStats::new("ETH/USDT", 10));
        let mut cfg = CollectorConfig::default();
        cfg.queue_get_timeout_ms = 10;
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_bucketizer(
            "ETH/USDT".into(),
            rx,
            pending.clone(),
            stats.clone(),
            Arc::new(cfg),
            cancel.clone(),
        ));

        tx.send(vec![trade("ETH/USDT", "1", 0, 1.0, 1.0)]).await.unwrap();
        tx.send(vec![trade("ETH/USDT", "2", 6_000, 1.0, 1.0)]).await.unwrap();

        // Closing the sender ends the task once the queue is empty.
        drop(tx);
        handle.await.unwrap();

        assert_eq!(pending.len(), 2);
        assert_eq!(pending.trade_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn bucketizer_keeps_running_after_error() {
        let (tx, rx) = mpsc::channel(4);
        let pending = PendingBuckets::new();
        let stats = Arc::new(SymbolStats::new("ETH/USDT", 10));
        let mut cfg = CollectorConfig::default();
        cfg.queue_get_timeout_ms = 10;
        cfg.bucketizer_error_sleep_ms = 1_000;
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_bucketizer(
            "ETH/USDT".into(),
            rx,
            pending.clone(),
            stats.clone(),
            Arc::new(cfg),
            cancel.clone(),
        ));

        tx.send(vec![
            trade("ETH/USDT", "1", 0, 1.0, 1.0),
            trade("ETH/USDT", "2", 0, f64::NAN, 1.0),
        ])
        .await
        .unwrap();
        tx.send(vec![trade("ETH/USDT", "3", 6_000, 1.0, 1.0)]).await.unwrap();

        // Still inside the error sleep: only the first batch's valid trade.
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        assert_eq!(pending.trade_count(), 1);
        assert!(!handle.is_finished());

        tokio::time::sleep(std::time::Duration::from_millis(1_000)).await;
        assert_eq!(pending.trade_count(), 2);
        assert_eq!(pending.len(), 2);

        cancel.cancel();
        handle.await.unwrap();
    }
}
