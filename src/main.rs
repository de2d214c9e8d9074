// =============================================================================
// Candle Collector: Main Entry Point
// =============================================================================
//
// Streams raw trades for every configured symbol, folds them into fixed
// interval OHLCV candles and upserts the candles into storage. Runs until
// Ctrl+C / SIGTERM, then drains and flushes before exiting.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod exchange;
mod pipeline;
mod runtime_config;
mod stats;
mod storage;
mod types;

use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::exchange::binance::BinanceExchange;
use crate::exchange::Exchange;
use crate::pipeline::writer::JsonlDeadLetter;
use crate::pipeline::Collector;
use crate::runtime_config::CollectorConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Candle Collector -- Starting Up                  ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path = CollectorConfig::default_path();
    let mut config = CollectorConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(path = %config_path.display(), error = %e, "Failed to load config, using defaults");
        CollectorConfig::default()
    });
    config.apply_env();
    config.validate().context("invalid collector configuration")?;

    info!(
        exchange = %config.exchange,
        symbols = ?config.symbols,
        interval_ms = config.candle_interval_ms,
        storage = ?config.storage_backend,
        db_path = %config.db_path,
        "Configuration loaded"
    );

    // ── 2. Storage ───────────────────────────────────────────────────────
    let store = storage::open_store(&config).context("failed to open candle storage")?;

    // ── 3. Exchange adapter ──────────────────────────────────────────────
    let exchange: Arc<dyn Exchange> = match config.exchange.as_str() {
        "binance" => Arc::new(BinanceExchange::new(&config.ws_url, &config.rest_url)?),
        other => bail!("unsupported exchange: {other}"),
    };

    // ── 4. Pipeline ──────────────────────────────────────────────────────
    let bind_addr = config.bind_addr.clone();
    let dead_letter_path = config.dead_letter_path.clone();
    let mut collector = Collector::new(config, exchange, store.clone());
    if !dead_letter_path.is_empty() {
        let sink = JsonlDeadLetter::open(&dead_letter_path)
            .context("failed to open dead-letter file")?;
        info!(path = %dead_letter_path, "Dead-lettered candles go to file");
        collector = collector.with_dead_letter(Arc::new(sink));
    }
    if let Err(e) = collector.start().await {
        error!(error = %e, "Collector failed to start");
        return Err(e);
    }

    // ── 5. Status API ────────────────────────────────────────────────────
    if bind_addr.is_empty() {
        info!("Status API disabled");
    } else {
        let api_state =
            api::rest::ApiState::new(collector.state_handle(), collector.stats(), store);
        let cancel = collector.cancel_token();
        tokio::spawn(async move {
            let app = api::rest::router(api_state);
            let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(addr = %bind_addr, error = %e, "Failed to bind status API");
                    return;
                }
            };
            info!(addr = %bind_addr, "Status API listening");
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
            {
                error!(error = %e, "Status API failed");
            }
        });
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    wait_for_shutdown().await?;
    warn!("Shutdown signal received -- stopping gracefully");

    collector.shutdown().await;

    info!("Candle Collector shut down complete.");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
