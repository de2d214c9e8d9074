// =============================================================================
// Candle Builder: closes elapsed buckets and emits OHLCV candles
// =============================================================================
//
// A bucket with boundary B closes once the wall clock reaches B + 2*interval:
// its own window plus one full interval of grace for late trades. Closed
// buckets are always removed from the pending map, whether or not the candle
// makes it onto the (bounded, lossy) candle queue.
// =============================================================================

use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bucketizer::PendingBuckets;
use super::writer::CandleJob;
use crate::runtime_config::CollectorConfig;
use crate::stats::SymbolStats;
use crate::types::{candle_boundary, now_ms, Candle};

/// Close every bucket that is complete at `now_ms` and build its candle.
///
/// Trades inside each bucket are sorted by timestamp first (stable, so equal
/// timestamps keep arrival order). Empty buckets produce nothing.
pub fn build_closed_candles(
    symbol: &str,
    pending: &PendingBuckets,
    now_ms: i64,
    interval_ms: i64,
) -> Vec<Candle> {
    let current_boundary = candle_boundary(now_ms, interval_ms);
    pending
        .take_before(current_boundary - interval_ms)
        .into_iter()
        .filter_map(|(boundary, mut trades)| {
            trades.sort_by_key(|t| t.timestamp_ms);
            Candle::from_sorted_trades(symbol, boundary, &trades)
        })
        .collect()
}

/// Tick loop: build closed candles and offer them to the writer.
pub async fn run_candle_builder(
    symbol: String,
    pending: PendingBuckets,
    candle_tx: mpsc::Sender<CandleJob>,
    stats: Arc<SymbolStats>,
    config: Arc<CollectorConfig>,
    cancel: CancellationToken,
) {
    info!(symbol = %symbol, tick_ms = config.builder_tick_ms, "candle builder started");

    let mut ticker = tokio::time::interval(config.builder_tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = emit_closed(&symbol, &pending, &candle_tx, &stats, &config, now_ms()).await {
            error!(symbol = %symbol, error = %e, "candle builder error");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(config.builder_error_sleep()) => {}
            }
        }
    }

    info!(symbol = %symbol, "candle builder stopped");
}

async fn emit_closed(
    symbol: &str,
    pending: &PendingBuckets,
    candle_tx: &mpsc::Sender<CandleJob>,
    stats: &SymbolStats,
    config: &CollectorConfig,
    now_ms: i64,
) -> Result<()> {
    let candles = build_closed_candles(symbol, pending, now_ms, config.candle_interval_ms);
    stats.set_pending_buckets(pending.len());

    for candle in candles {
        stats.inc_candles_built();
        let ts = candle.timestamp_ms;
        debug!(
            symbol = %symbol,
            ts,
            close = candle.close,
            trades = candle.trade_count,
            "candle built"
        );

        match candle_tx
            .send_timeout(CandleJob::new(candle), config.queue_put_timeout())
            .await
        {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                stats.inc_candles_dropped();
                warn!(symbol = %symbol, ts, "candle queue full -- candle dropped");
            }
            Err(SendTimeoutError::Closed(_)) => {
                stats.inc_candles_dropped();
                bail!("candle queue closed");
            }
        }
    }
    Ok(())
}
