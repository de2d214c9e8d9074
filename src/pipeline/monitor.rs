// =============================================================================
// Stats Monitor: periodic cross-symbol throughput report
// =============================================================================
//
// One instance for the whole process. Every `stats_interval_secs` it logs a
// line per symbol and warns about symbols whose trades-per-candle ratio fell
// below `low_ratio_threshold`. Purely advisory: nothing is restarted.
// =============================================================================

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::runtime_config::CollectorConfig;
use crate::stats::{StatsSnapshot, SymbolStats};

/// `true` when a symbol has built candles from suspiciously few trades.
pub fn is_low_ratio(snap: &StatsSnapshot, threshold: f64) -> bool {
    match snap.trades_per_candle {
        Some(ratio) => snap.candles_built > 0 && ratio < threshold,
        None => false,
    }
}

/// Log one report; returns the symbols flagged as low-ratio.
pub fn report(stats: &[Arc<SymbolStats>], threshold: f64) -> Vec<String> {
    let mut flagged = Vec::new();

    for s in stats {
        let snap = s.snapshot();
        info!(
            symbol = %snap.symbol,
            trades = snap.trades_seen,
            candles_built = snap.candles_built,
            candles_written = snap.candles_written,
            ratio = snap.trades_per_candle.unwrap_or(0.0),
            duplicates = snap.duplicates,
            invalid = snap.invalid_trades,
            trades_dropped = snap.trades_dropped,
            candles_dropped = snap.candles_dropped,
            requeue_dropped = snap.requeue_dropped,
            pending_buckets = snap.pending_buckets,
            last_price = snap.last_price.unwrap_or(0.0),
            ingest_alive = snap.ingest_alive,
            "pipeline stats"
        );

        if is_low_ratio(&snap, threshold) {
            warn!(
                symbol = %snap.symbol,
                ratio = snap.trades_per_candle.unwrap_or(0.0),
                threshold,
                candles_built = snap.candles_built,
                "low trades-per-candle ratio"
            );
            flagged.push(snap.symbol);
        }
    }

    flagged
}

/// Report every `stats_interval_secs` until cancelled, then once more.
pub async fn run_stats_monitor(
    stats: Vec<Arc<SymbolStats>>,
    config: Arc<CollectorConfig>,
    cancel: CancellationToken,
) {
    info!(
        interval_secs = config.stats_interval_secs,
        symbols = stats.len(),
        "stats monitor started"
    );

    let mut ticker = tokio::time::interval(config.stats_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick; nothing has happened yet.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                report(&stats, config.low_ratio_threshold);
            }
        }
    }

    report(&stats, config.low_ratio_threshold);
    info!("stats monitor stopped");
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::trade;

    fn stats_with(symbol: &str, trades: usize, candles: usize) -> Arc<SymbolStats> {
        let s = Arc::new(SymbolStats::new(symbol, 10));
        let batch: Vec<_> = (0..trades)
            .map(|i| trade(symbol, &i.to_string(), 0, 1.0, 1.0))
            .collect();
        s.record_trades(&batch);
        for _ in 0..candles {
            s.inc_candles_built();
        }
        s
    }

    #[test]
    fn flags_only_low_ratio_symbols() {
        let stats = vec![
            stats_with("ETH/USDT", 100, 10),
            stats_with("BTC/USDT", 3, 3),
            stats_with("SOL/USDT", 0, 0),
        ];
        let flagged = report(&stats, 2.0);
        assert_eq!(flagged, vec!["BTC/USDT".to_string()]);
    }

    #[test]
    fn no_candles_is_not_low_ratio() {
        let snap = stats_with("ETH/USDT", 5, 0).snapshot();
        assert!(!is_low_ratio(&snap, 2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_exits_on_cancel() {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_stats_monitor(
            vec![stats_with("ETH/USDT", 1, 1)],
            Arc::new(CollectorConfig::default()),
            cancel.clone(),
        ));

        tokio::time::sleep(std::time::Duration::from_secs(125)).await;
        cancel.cancel();
        task.await.unwrap();
    }
}
