// =============================================================================
// Candle storage: batched upsert keyed on (symbol, timestamp_ms)
// =============================================================================

pub mod memory;
#[cfg(test)]
pub mod slow;
pub mod sqlite;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::runtime_config::{CollectorConfig, StorageBackend};
use crate::types::CandleRow;

pub use memory::MemoryCandleStore;
pub use sqlite::SqliteCandleStore;

/// Durable candle sink shared by every symbol's writer.
///
/// Writes must be idempotent per `(symbol, timestamp_ms)`: a retried flush
/// replaces the earlier row instead of adding a second one. Callers bound
/// concurrency themselves.
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Upsert `rows` for `symbol`, returning the number of rows written.
    async fn insert_candles(&self, rows: &[CandleRow], symbol: &str) -> Result<usize>;

    /// The newest `limit` rows for `symbol`, oldest first.
    async fn recent_candles(&self, symbol: &str, limit: usize) -> Result<Vec<CandleRow>>;
}

/// Open the backend selected in `config`.
pub fn open_store(config: &CollectorConfig) -> Result<Arc<dyn CandleStore>> {
    match config.storage_backend {
        StorageBackend::Sqlite => {
            let label = format!("{}ms", config.candle_interval_ms);
            Ok(Arc::new(SqliteCandleStore::open(&config.db_path, label)?))
        }
        StorageBackend::Memory => Ok(Arc::new(MemoryCandleStore::new())),
    }
}
