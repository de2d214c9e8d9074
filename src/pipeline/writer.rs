// =============================================================================
// Durable Writer: batches candles and flushes them to storage
// =============================================================================
//
// Flush triggers:
//   1. The batch reaches `write_batch_size`.
//   2. The periodic flush timer fires with at least one candle pending.
//   3. Shutdown (one final best-effort flush after draining the queue).
//
// Every flush holds a permit from the limiter shared by all symbols while it
// talks to storage. A failed flush puts each candle back on this symbol's
// candle queue; candles that do not fit are dropped and counted. The writer
// then pauses for `backoff(n)` (n = consecutive failed flushes) before it
// reads the queue again. With `max_write_retries > 0` a candle that keeps
// failing goes to the dead-letter sink instead.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;

use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::runtime_config::CollectorConfig;
use crate::stats::SymbolStats;
use crate::storage::CandleStore;
use crate::types::{Candle, CandleRow};

/// A candle travelling through the candle queue, with its failed-write count.
#[derive(Debug, Clone)]
pub struct CandleJob {
    pub candle: Candle,
    pub failed_writes: u32,
}

impl CandleJob {
    pub fn new(candle: Candle) -> Self {
        Self {
            candle,
            failed_writes: 0,
        }
    }
}

/// Receives candles that exhausted their write retries.
pub trait DeadLetterSink: Send + Sync {
    fn dead_letter(&self, candle: &Candle, failed_writes: u32);
}

/// Default sink: log the candle so it can be recovered from the logs.
pub struct LogDeadLetter;

impl DeadLetterSink for LogDeadLetter {
    fn dead_letter(&self, candle: &Candle, failed_writes: u32) {
        error!(
            symbol = %candle.symbol,
            ts = candle.timestamp_ms,
            open = candle.open,
            high = candle.high,
            low = candle.low,
            close = candle.close,
            volume = candle.volume,
            failed_writes,
            "candle dead-lettered after repeated write failures"
        );
    }
}

/// Appends each dead-lettered candle to a JSON-lines file for later replay.
pub struct JsonlDeadLetter {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlDeadLetter {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open dead-letter file {}", path.display()))?;
        info!(path = %path.display(), "dead-letter file ready");
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }
}

impl DeadLetterSink for JsonlDeadLetter {
    fn dead_letter(&self, candle: &Candle, failed_writes: u32) {
        LogDeadLetter.dead_letter(candle, failed_writes);

        let line = serde_json::json!({ "failed_writes": failed_writes, "candle": candle });
        let mut file = self.file.lock();
        if let Err(e) = writeln!(file, "{line}") {
            error!(path = %self.path.display(), error = %e, "dead-letter append failed");
        }
    }
}

/// Per-symbol writer stage.
pub struct CandleWriter {
    symbol: String,
    store: Arc<dyn CandleStore>,
    limiter: Arc<Semaphore>,
    /// Sender side of this symbol's own candle queue, used for re-queuing.
    requeue_tx: mpsc::Sender<CandleJob>,
    dead_letter: Arc<dyn DeadLetterSink>,
    stats: Arc<SymbolStats>,
    config: Arc<CollectorConfig>,
    batch: Vec<CandleJob>,
    /// Failed flushes since the last success; drives the retry pause.
    consecutive_failures: u32,
}

impl CandleWriter {
    pub fn new(
        symbol: impl Into<String>,
        store: Arc<dyn CandleStore>,
        limiter: Arc<Semaphore>,
        requeue_tx: mpsc::Sender<CandleJob>,
        dead_letter: Arc<dyn DeadLetterSink>,
        stats: Arc<SymbolStats>,
        config: Arc<CollectorConfig>,
    ) -> Self {
        let batch = Vec::with_capacity(config.write_batch_size);
        Self {
            symbol: symbol.into(),
            store,
            limiter,
            requeue_tx,
            dead_letter,
            stats,
            config,
            batch,
            consecutive_failures: 0,
        }
    }

    /// Consume the candle queue until cancelled, then drain and flush once.
    pub async fn run(mut self, mut candle_rx: mpsc::Receiver<CandleJob>, cancel: CancellationToken) {
        info!(
            symbol = %self.symbol,
            batch_size = self.config.write_batch_size,
            "candle writer started"
        );

        let get_timeout = self.config.queue_get_timeout();
        let mut flush_timer = tokio::time::interval(self.config.flush_interval());
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        flush_timer.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = flush_timer.tick() => {
                    if !self.batch.is_empty() && !self.flush_or_pause(&cancel).await {
                        break;
                    }
                }
                next = tokio::time::timeout(get_timeout, candle_rx.recv()) => match next {
                    Ok(Some(job)) => {
                        self.batch.push(job);
                        if self.batch.len() >= self.config.write_batch_size
                            && !self.flush_or_pause(&cancel).await
                        {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(_elapsed) => {}
                }
            }
        }

        while let Ok(job) = candle_rx.try_recv() {
            self.batch.push(job);
        }
        if !self.batch.is_empty() {
            info!(symbol = %self.symbol, count = self.batch.len(), "final candle flush");
            self.flush(false).await;
        }

        info!(symbol = %self.symbol, "candle writer stopped");
    }

    /// Flush with re-queue. After a failure, wait `backoff(n)` before the
    /// caller reads the queue again; the re-queued candles would otherwise
    /// refill the batch at once. Returns `false` if cancelled while waiting.
    async fn flush_or_pause(&mut self, cancel: &CancellationToken) -> bool {
        if self.flush(true).await {
            self.consecutive_failures = 0;
            return true;
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let delay = self.config.backoff(self.consecutive_failures);
        warn!(
            symbol = %self.symbol,
            failures = self.consecutive_failures,
            delay_secs = delay.as_secs(),
            "storage unavailable -- pausing writes"
        );
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Write the current batch. On failure re-queue (when `requeue`) or count
    /// the candles as lost. Returns whether the write succeeded.
    async fn flush(&mut self, requeue: bool) -> bool {
        let jobs = std::mem::take(&mut self.batch);
        let rows: Vec<CandleRow> = jobs.iter().map(|j| j.candle.to_row()).collect();

        let result = match self.limiter.acquire().await {
            Ok(_permit) => self.store.insert_candles(&rows, &self.symbol).await,
            Err(e) => Err(anyhow::anyhow!("write limiter closed: {e}")),
        };

        match result {
            Ok(written) => {
                self.stats.add_candles_written(jobs.len() as u64);
                debug!(symbol = %self.symbol, candles = jobs.len(), written, "candle batch flushed");
                true
            }
            Err(e) => {
                self.stats.inc_write_failures();
                error!(
                    symbol = %self.symbol,
                    count = jobs.len(),
                    error = %e,
                    "candle flush failed"
                );
                self.handle_failed(jobs, requeue).await;
                false
            }
        }
    }

    async fn handle_failed(&self, jobs: Vec<CandleJob>, requeue: bool) {
        let max_retries = self.config.max_write_retries;
        let requeue_timeout = self.config.requeue_timeout();
        let mut requeued = 0usize;
        let mut dropped = 0usize;

        for mut job in jobs {
            job.failed_writes += 1;

            if max_retries > 0 && job.failed_writes >= max_retries {
                self.dead_letter.dead_letter(&job.candle, job.failed_writes);
                self.stats.inc_dead_lettered();
                continue;
            }

            if !requeue {
                self.stats.inc_requeue_dropped();
                dropped += 1;
                continue;
            }

            match self.requeue_tx.send_timeout(job, requeue_timeout).await {
                Ok(()) => requeued += 1,
                Err(SendTimeoutError::Timeout(_)) | Err(SendTimeoutError::Closed(_)) => {
                    self.stats.inc_requeue_dropped();
                    dropped += 1;
                }
            }
        }

        if dropped > 0 {
            warn!(symbol = %self.symbol, requeued, dropped, "candles lost after failed flush");
        } else if requeued > 0 {
            debug!(symbol = %self.symbol, requeued, "candles re-queued for retry");
        }
    }
}
