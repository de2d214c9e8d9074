// =============================================================================
// Stream Ingestor: live subscription, dedup, lossy hand-off to the bucketizer
// =============================================================================
//
// One ingestor per symbol. Connect + subscribe, then receive batches under a
// timeout. Each failure (connect, subscribe, receive error or timeout) bumps
// a consecutive-attempt counter and triggers a capped linear backoff before
// reconnecting; any successful receive resets the counter. Hitting the
// attempt ceiling stops this symbol's ingestion only.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dedup::TradeIdCache;
use crate::exchange::TradeStream;
use crate::runtime_config::CollectorConfig;
use crate::stats::SymbolStats;
use crate::types::RawTrade;

/// Why an ingestor returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestExit {
    /// Shutdown was requested.
    Cancelled,
    /// Consecutive failures reached the attempt ceiling.
    GaveUp,
}

pub struct Ingestor {
    symbol: String,
    stream: Box<dyn TradeStream>,
    trade_tx: mpsc::Sender<Vec<RawTrade>>,
    seen: TradeIdCache,
    stats: Arc<SymbolStats>,
    config: Arc<CollectorConfig>,
    attempts: u32,
}

impl Ingestor {
    pub fn new(
        symbol: impl Into<String>,
        stream: Box<dyn TradeStream>,
        trade_tx: mpsc::Sender<Vec<RawTrade>>,
        stats: Arc<SymbolStats>,
        config: Arc<CollectorConfig>,
    ) -> Self {
        let seen = TradeIdCache::new(config.max_trade_ids, config.dedup_eviction);
        Self {
            symbol: symbol.into(),
            stream,
            trade_tx,
            seen,
            stats,
            config,
            attempts: 0,
        }
    }

    /// Run until cancelled or the attempt ceiling is reached. The stream is
    /// closed on every exit path.
    pub async fn run(mut self, cancel: CancellationToken) -> IngestExit {
        info!(symbol = %self.symbol, "ingestor started");
        let exit = self.run_loop(&cancel).await;
        self.stream.close().await;
        self.stats.set_ingest_alive(false);

        match exit {
            IngestExit::Cancelled => info!(symbol = %self.symbol, "ingestor stopped"),
            IngestExit::GaveUp => error!(
                symbol = %self.symbol,
                attempts = self.attempts,
                "ingestor giving up after repeated failures"
            ),
        }
        exit
    }

    async fn run_loop(&mut self, cancel: &CancellationToken) -> IngestExit {
        let mut connected = false;

        while !cancel.is_cancelled() {
            if !connected {
                let res = tokio::select! {
                    _ = cancel.cancelled() => return IngestExit::Cancelled,
                    r = self.connect() => r,
                };
                match res {
                    Ok(()) => {
                        connected = true;
                        self.stats.set_ingest_alive(true);
                    }
                    Err(e) => {
                        warn!(symbol = %self.symbol, error = %e, "trade stream connect failed");
                        // A subscribe failure leaves the socket from `connect` open.
                        self.stream.close().await;
                        if let Some(exit) = self.back_off(cancel).await {
                            return exit;
                        }
                        continue;
                    }
                }
            }

            let received = tokio::select! {
                _ = cancel.cancelled() => return IngestExit::Cancelled,
                r = tokio::time::timeout(self.config.receive_timeout(), self.stream.receive()) => r,
            };

            let failure = match received {
                Ok(Ok(batch)) => {
                    self.attempts = 0;
                    self.handle_batch(batch).await;
                    continue;
                }
                Ok(Err(e)) => format!("{e:#}"),
                Err(_elapsed) => format!(
                    "no trades within {}s",
                    self.config.receive_timeout_secs
                ),
            };

            warn!(symbol = %self.symbol, error = %failure, "trade stream receive failed");
            connected = false;
            self.stats.set_ingest_alive(false);
            self.stream.close().await;
            if let Some(exit) = self.back_off(cancel).await {
                return exit;
            }
        }

        IngestExit::Cancelled
    }

    async fn connect(&mut self) -> Result<()> {
        self.stream.connect().await?;
        self.stream
            .subscribe(&self.symbol)
            .await
            .with_context(|| format!("subscribe to {} failed", self.symbol))?;
        info!(symbol = %self.symbol, "trade stream subscribed");
        Ok(())
    }

    /// Count a failure; return an exit if the ceiling is hit or shutdown
    /// arrives during the backoff sleep.
    async fn back_off(&mut self, cancel: &CancellationToken) -> Option<IngestExit> {
        self.attempts += 1;
        if self.attempts >= self.config.ingest_max_attempts {
            return Some(IngestExit::GaveUp);
        }

        let delay = self.config.backoff(self.attempts);
        warn!(
            symbol = %self.symbol,
            attempt = self.attempts,
            max_attempts = self.config.ingest_max_attempts,
            delay_secs = delay.as_secs(),
            "reconnecting after backoff"
        );
        tokio::select! {
            _ = cancel.cancelled() => Some(IngestExit::Cancelled),
            _ = tokio::time::sleep(delay) => None,
        }
    }

    /// Validate, dedup and forward. A full trade queue drops the whole batch.
    async fn handle_batch(&mut self, mut batch: Vec<RawTrade>) {
        let before = batch.len();
        batch.retain(RawTrade::is_valid);
        let invalid = before - batch.len();
        if invalid > 0 {
            self.stats.add_invalid_trades(invalid as u64);
            warn!(symbol = %self.symbol, invalid, "invalid trades discarded");
        }

        let (fresh, dupes) = self.seen.admit(batch);
        if dupes > 0 {
            self.stats.add_duplicates(dupes as u64);
        }
        if fresh.is_empty() {
            return;
        }

        self.stats.record_trades(&fresh);
        let count = fresh.len();

        match self
            .trade_tx
            .send_timeout(fresh, self.config.queue_put_timeout())
            .await
        {
            Ok(()) => debug!(symbol = %self.symbol, count, "trades queued"),
            Err(SendTimeoutError::Timeout(_)) => {
                self.stats.add_trades_dropped(count as u64);
                warn!(symbol = %self.symbol, count, "trade queue full -- batch dropped");
            }
            Err(SendTimeoutError::Closed(_)) => {
                self.stats.add_trades_dropped(count as u64);
                warn!(symbol = %self.symbol, count, "trade queue closed -- batch dropped");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::{trade, MockExchange, Step};
    use crate::exchange::Exchange;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn fast_config() -> CollectorConfig {
        let mut cfg = CollectorConfig::default();
        cfg.receive_timeout_secs = 1;
        cfg.backoff_step_secs = 0;
        cfg.queue_put_timeout_ms = 50;
        cfg
    }

    fn ingestor(
        exchange: &MockExchange,
        tx: mpsc::Sender<Vec<RawTrade>>,
        cfg: CollectorConfig,
    ) -> (Ingestor, Arc<SymbolStats>) {
        let stats = Arc::new(SymbolStats::new("ETH/USDT", 100));
        let ing = Ingestor::new(
            "ETH/USDT",
            exchange.trade_stream("ETH/USDT"),
            tx,
            stats.clone(),
            Arc::new(cfg),
        );
        (ing, stats)
    }

    #[tokio::test]
    async fn duplicates_across_batches_admitted_once() {
        let exchange = MockExchange::new().with_script(
            "ETH/USDT",
            vec![
                Step::Trades(vec![
                    trade("ETH/USDT", "1", 0, 1.0, 1.0),
                    trade("ETH/USDT", "2", 1, 1.0, 1.0),
                ]),
                Step::Trades(vec![
                    trade("ETH/USDT", "2", 1, 1.0, 1.0),
                    trade("ETH/USDT", "3", 2, 1.0, 1.0),
                ]),
                Step::Trades(vec![trade("ETH/USDT", "3", 2, 1.0, 1.0)]),
            ],
        );
        let (tx, mut rx) = mpsc::channel(10);
        let (ing, stats) = ingestor(&exchange, tx, fast_config());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(ing.run(cancel.clone()));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(), vec!["1", "2"]);
        assert_eq!(second.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(), vec!["3"]);

        // The third batch is all duplicates and never reaches the queue.
        for _ in 0..200 {
            if stats.snapshot().duplicates == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        assert_eq!(task.await.unwrap(), IngestExit::Cancelled);
        assert!(rx.try_recv().is_err());
        assert_eq!(stats.trades_seen(), 3);
        assert_eq!(stats.snapshot().duplicates, 2);
        assert_eq!(exchange.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let exchange = MockExchange::new()
            .with_script("ETH/USDT", vec![])
            .refusing("ETH/USDT");
        let (tx, _rx) = mpsc::channel(10);
        let mut cfg = fast_config();
        cfg.backoff_step_secs = 2;
        let (ing, stats) = ingestor(&exchange, tx, cfg);

        let exit = ing.run(CancellationToken::new()).await;

        assert_eq!(exit, IngestExit::GaveUp);
        assert_eq!(exchange.connects.load(Ordering::SeqCst), 10);
        // One close per failed connect plus the final close on exit.
        assert_eq!(exchange.closes.load(Ordering::SeqCst), 11);
        assert!(!stats.ingest_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_subscribe_closes_connected_stream() {
        let exchange = MockExchange::new()
            .with_script("ETH/USDT", vec![])
            .rejecting_subscribe("ETH/USDT");
        let (tx, _rx) = mpsc::channel(10);
        let (ing, _stats) = ingestor(&exchange, tx, fast_config());

        let exit = ing.run(CancellationToken::new()).await;

        assert_eq!(exit, IngestExit::GaveUp);
        let connects = exchange.connects.load(Ordering::SeqCst);
        assert_eq!(connects, 10);
        // Every socket opened by `connect` is closed before the next one.
        assert_eq!(exchange.closes.load(Ordering::SeqCst), connects + 1);
    }

    #[tokio::test]
    async fn invalid_trades_filtered_before_dedup() {
        let exchange = MockExchange::new().with_script(
            "ETH/USDT",
            vec![
                Step::Trades(vec![
                    trade("ETH/USDT", "7", 0, f64::NAN, 1.0),
                    trade("ETH/USDT", "8", 0, 1.0, 0.0),
                ]),
                Step::Trades(vec![trade("ETH/USDT", "7", 0, 1.0, 1.0)]),
            ],
        );
        let (tx, mut rx) = mpsc::channel(10);
        let (ing, stats) = ingestor(&exchange, tx, fast_config());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(ing.run(cancel.clone()));

        // The corrected trade "7" is not mistaken for a duplicate.
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, "7");
        assert_eq!(batch[0].price, 1.0);

        cancel.cancel();
        task.await.unwrap();
        let snap = stats.snapshot();
        assert_eq!(snap.invalid_trades, 2);
        assert_eq!(snap.duplicates, 0);
        assert_eq!(snap.trades_seen, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_receive_resets_attempts() {
        // Nine failures, a good batch, then nine more: never ten in a row.
        let mut steps: Vec<Step> = (0..9).map(|_| Step::Error("boom")).collect();
        steps.push(Step::Trades(vec![trade("ETH/USDT", "1", 0, 1.0, 1.0)]));
        steps.extend((0..9).map(|_| Step::Error("boom")));
        steps.push(Step::Trades(vec![trade("ETH/USDT", "2", 0, 1.0, 1.0)]));

        let exchange = MockExchange::new().with_script("ETH/USDT", steps);
        let (tx, mut rx) = mpsc::channel(10);
        let (ing, _stats) = ingestor(&exchange, tx, fast_config());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(ing.run(cancel.clone()));

        assert_eq!(rx.recv().await.unwrap()[0].id, "1");
        assert_eq!(rx.recv().await.unwrap()[0].id, "2");

        cancel.cancel();
        assert_eq!(task.await.unwrap(), IngestExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn receive_timeouts_count_as_failures() {
        // Empty script: the stream never yields, so every receive times out.
        let exchange = MockExchange::new().with_script("ETH/USDT", vec![]);
        let (tx, _rx) = mpsc::channel(10);
        let (ing, _stats) = ingestor(&exchange, tx, fast_config());

        let exit = ing.run(CancellationToken::new()).await;

        assert_eq!(exit, IngestExit::GaveUp);
        // Each failure closes the stream, plus the final close on exit.
        assert_eq!(exchange.closes.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn full_trade_queue_drops_within_timeout() {
        let exchange = MockExchange::new().with_script(
            "ETH/USDT",
            vec![Step::Trades(vec![
                trade("ETH/USDT", "1", 0, 1.0, 1.0),
                trade("ETH/USDT", "2", 0, 1.0, 1.0),
            ])],
        );
        let (tx, mut rx) = mpsc::channel(1);
        tx.send(vec![trade("ETH/USDT", "0", 0, 1.0, 1.0)]).await.unwrap();
        let (ing, stats) = ingestor(&exchange, tx, fast_config());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(ing.run(cancel.clone()));

        let started = std::time::Instant::now();
        while stats.trades_dropped() < 2 {
            assert!(started.elapsed() < Duration::from_secs(2), "put blocked past its timeout");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(rx.recv().await.unwrap()[0].id, "0");
        assert!(rx.try_recv().is_err());
    }
}
