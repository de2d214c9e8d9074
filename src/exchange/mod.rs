// =============================================================================
// Exchange abstraction: market listing + per-symbol trade streams
// =============================================================================

pub mod binance;
#[cfg(test)]
pub mod mock;

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::RawTrade;

/// A live trade subscription for one symbol.
///
/// Implementations may fail transiently on any call; the ingestor owns retry
/// and backoff.
#[async_trait]
pub trait TradeStream: Send {
    /// Open the underlying connection.
    async fn connect(&mut self) -> Result<()>;

    /// Subscribe to trades for `symbol` on the open connection.
    async fn subscribe(&mut self, symbol: &str) -> Result<()>;

    /// Wait for the next batch of trades. An empty batch is a valid result
    /// (e.g. a control frame arrived).
    async fn receive(&mut self) -> Result<Vec<RawTrade>>;

    /// Release the connection. Must be safe to call when not connected.
    async fn close(&mut self);
}

/// Exchange-level capabilities needed at startup and per symbol.
#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    /// Unified `BASE/QUOTE` symbols currently tradable. Failure here at
    /// startup aborts the run.
    async fn load_markets(&self) -> Result<HashSet<String>>;

    /// A fresh, unconnected stream handle for `symbol`.
    fn trade_stream(&self, symbol: &str) -> Box<dyn TradeStream>;
}
