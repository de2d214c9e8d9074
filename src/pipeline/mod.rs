// =============================================================================
// Collector pipeline: per-symbol stage wiring and process lifecycle
// =============================================================================
//
// Per symbol:
//
//   Ingestor --trade queue--> Bucketizer --pending map--> CandleBuilder
//            --candle queue--> Writer --(shared limiter)--> CandleStore
//
// plus one StatsMonitor for all symbols. Each symbol owns its queues, pending
// map and dedup cache outright; the only things shared across symbols are the
// write limiter, the cancellation tokens and read-only stats handles.
//
// Lifecycle: NotStarted -> Running -> Stopping -> Stopped. Shutdown is
// process-wide and ordered: ingestors, bucketizers and builders stop first,
// then writers drain and flush what the builders emitted, then the monitor
// logs its final report.
// =============================================================================

pub mod bucketizer;
pub mod candle_builder;
pub mod dedup;
pub mod ingestor;
pub mod monitor;
pub mod writer;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::exchange::Exchange;
use crate::runtime_config::CollectorConfig;
use crate::stats::SymbolStats;
use crate::storage::CandleStore;
use crate::types::RawTrade;

use bucketizer::PendingBuckets;
use ingestor::{IngestExit, Ingestor};
use writer::{CandleJob, CandleWriter, DeadLetterSink, LogDeadLetter};

/// Process-wide pipeline lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Shared, cheaply cloneable view of the lifecycle state.
pub type StateHandle = Arc<RwLock<PipelineState>>;

// ---------------------------------------------------------------------------
// Per-symbol context
// ---------------------------------------------------------------------------

/// Everything one symbol's four stages own. Built once at startup and
/// consumed by `spawn`.
struct SymbolPipeline {
    symbol: String,
    stats: Arc<SymbolStats>,
    pending: PendingBuckets,
    trade_tx: mpsc::Sender<Vec<RawTrade>>,
    trade_rx: mpsc::Receiver<Vec<RawTrade>>,
    candle_tx: mpsc::Sender<CandleJob>,
    candle_rx: mpsc::Receiver<CandleJob>,
}

impl SymbolPipeline {
    fn new(symbol: &str, config: &CollectorConfig) -> Self {
        let (trade_tx, trade_rx) = mpsc::channel(config.queue_capacity);
        let (candle_tx, candle_rx) = mpsc::channel(config.queue_capacity);
        Self {
            symbol: symbol.to_string(),
            stats: Arc::new(SymbolStats::new(symbol, config.trade_buffer_size)),
            pending: PendingBuckets::new(),
            trade_tx,
            trade_rx,
            candle_tx,
            candle_rx,
        }
    }

    /// Returns the upstream stage handles and the writer handle separately
    /// so shutdown can stop them in order.
    fn spawn(self, shared: &Shared) -> (Vec<JoinHandle<()>>, JoinHandle<()>) {
        let Self {
            symbol,
            stats,
            pending,
            trade_tx,
            trade_rx,
            candle_tx,
            candle_rx,
        } = self;
        let mut handles = Vec::with_capacity(3);

        let ingestor = Ingestor::new(
            symbol.clone(),
            shared.exchange.trade_stream(&symbol),
            trade_tx,
            stats.clone(),
            shared.config.clone(),
        );
        let cancel = shared.cancel.clone();
        let sym = symbol.clone();
        handles.push(tokio::spawn(async move {
            if ingestor.run(cancel).await == IngestExit::GaveUp {
                warn!(symbol = %sym, "ingestion halted; buckets already queued will still be written");
            }
        }));

        handles.push(tokio::spawn(bucketizer::run_bucketizer(
            symbol.clone(),
            trade_rx,
            pending.clone(),
            stats.clone(),
            shared.config.clone(),
            shared.cancel.clone(),
        )));

        handles.push(tokio::spawn(candle_builder::run_candle_builder(
            symbol.clone(),
            pending,
            candle_tx.clone(),
            stats.clone(),
            shared.config.clone(),
            shared.cancel.clone(),
        )));

        let writer = CandleWriter::new(
            symbol.clone(),
            shared.store.clone(),
            shared.limiter.clone(),
            candle_tx,
            shared.dead_letter.clone(),
            stats,
            shared.config.clone(),
        );
        let writer = tokio::spawn(writer.run(candle_rx, shared.flush_cancel.clone()));

        info!(symbol = %symbol, "symbol pipeline launched");
        (handles, writer)
    }
}

/// Handles every symbol's stages share.
struct Shared {
    config: Arc<CollectorConfig>,
    exchange: Arc<dyn Exchange>,
    store: Arc<dyn CandleStore>,
    dead_letter: Arc<dyn DeadLetterSink>,
    limiter: Arc<Semaphore>,
    /// Stops ingestors, bucketizers and builders.
    cancel: CancellationToken,
    /// Stops writers once everything upstream has exited.
    flush_cancel: CancellationToken,
    /// Stops the monitor last.
    monitor_cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

/// Owns every pipeline task and drives the process lifecycle.
pub struct Collector {
    shared: Shared,
    state: StateHandle,
    stats: Vec<Arc<SymbolStats>>,
    handles: Vec<JoinHandle<()>>,
    writers: Vec<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl Collector {
    pub fn new(
        config: CollectorConfig,
        exchange: Arc<dyn Exchange>,
        store: Arc<dyn CandleStore>,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(config.storage_concurrency));
        Self {
            shared: Shared {
                config: Arc::new(config),
                exchange,
                store,
                dead_letter: Arc::new(LogDeadLetter),
                limiter,
                cancel: CancellationToken::new(),
                flush_cancel: CancellationToken::new(),
                monitor_cancel: CancellationToken::new(),
            },
            state: Arc::new(RwLock::new(PipelineState::NotStarted)),
            stats: Vec::new(),
            handles: Vec::new(),
            writers: Vec::new(),
            monitor: None,
        }
    }

    /// Replace the default log-only dead-letter sink.
    pub fn with_dead_letter(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.shared.dead_letter = sink;
        self
    }

    pub fn state(&self) -> PipelineState {
        *self.state.read()
    }

    pub fn state_handle(&self) -> StateHandle {
        self.state.clone()
    }

    /// Stats handles of every running symbol, in launch order.
    pub fn stats(&self) -> Vec<Arc<SymbolStats>> {
        self.stats.clone()
    }

    /// Token cancelled as soon as shutdown begins.
    pub fn cancel_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Validate symbols against the exchange and launch every stage.
    ///
    /// Failing to load the market list is fatal. Unknown symbols are skipped
    /// with a warning; having none left is fatal too.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != PipelineState::NotStarted {
            bail!("collector already started (state: {})", self.state());
        }

        let exchange = self.shared.exchange.clone();
        let markets = exchange
            .load_markets()
            .await
            .with_context(|| format!("failed to load markets from {}", exchange.name()))?;

        let symbols: Vec<String> = self
            .shared
            .config
            .symbols
            .iter()
            .filter(|s| {
                let known = markets.contains(s.as_str());
                if !known {
                    warn!(symbol = %s, exchange = exchange.name(), "symbol not listed -- skipping");
                }
                known
            })
            .cloned()
            .collect();

        if symbols.is_empty() {
            bail!("none of the configured symbols are listed on {}", exchange.name());
        }

        for symbol in &symbols {
            let pipeline = SymbolPipeline::new(symbol, &self.shared.config);
            self.stats.push(pipeline.stats.clone());
            let (handles, writer) = pipeline.spawn(&self.shared);
            self.handles.extend(handles);
            self.writers.push(writer);
        }

        self.monitor = Some(tokio::spawn(monitor::run_stats_monitor(
            self.stats.clone(),
            self.shared.config.clone(),
            self.shared.monitor_cancel.clone(),
        )));

        *self.state.write() = PipelineState::Running;
        info!(
            symbols = ?symbols,
            tasks = self.handles.len() + self.writers.len() + 1,
            "collector running"
        );
        Ok(())
    }

    /// Stop every stage and wait for all of them to exit.
    ///
    /// Writers keep consuming until the builders have returned, so a candle
    /// emitted during shutdown still reaches the final flush.
    pub async fn shutdown(&mut self) {
        *self.state.write() = PipelineState::Stopping;
        info!(
            tasks = self.handles.len() + self.writers.len(),
            "collector stopping"
        );

        self.shared.cancel.cancel();
        join_all(self.handles.drain(..)).await;

        self.shared.flush_cancel.cancel();
        join_all(self.writers.drain(..)).await;

        self.shared.monitor_cancel.cancel();
        join_all(self.monitor.take()).await;

        *self.state.write() = PipelineState::Stopped;
        info!("collector stopped");
    }
}

async fn join_all(handles: impl IntoIterator<Item = JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "pipeline task ended abnormally");
        }
    }
}
