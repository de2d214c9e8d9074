// =============================================================================
// Shared types used across the collector pipeline
// =============================================================================

use serde::{Deserialize, Serialize};

/// Aggressor side of a trade as reported by the exchange. Informational only;
/// aggregation never looks at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
    Unknown,
}

impl Default for Side {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// One executed trade as received from the exchange stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTrade {
    /// Exchange-assigned identifier, used for deduplication.
    pub id: String,
    /// Exchange-reported trade time in epoch milliseconds.
    pub timestamp_ms: i64,
    pub price: f64,
    pub amount: f64,
    /// Unified `BASE/QUOTE` symbol.
    pub symbol: String,
    #[serde(default)]
    pub side: Side,
}

impl RawTrade {
    /// Price and amount must both be positive finite numbers.
    pub fn is_valid(&self) -> bool {
        self.price.is_finite() && self.price > 0.0 && self.amount.is_finite() && self.amount > 0.0
    }
}

/// Storage row layout: `[timestamp_ms, open, high, low, close, volume]`.
pub type CandleRow = (i64, f64, f64, f64, f64, f64);

/// OHLCV summary of every trade inside one bucket of one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket start boundary, not the observation time.
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trade_count: u64,
    pub symbol: String,
}

impl Candle {
    /// Fold a timestamp-sorted trade sequence into a candle.
    ///
    /// Returns `None` for an empty slice: an empty bucket never yields a
    /// candle. Callers are responsible for sorting; the first and last
    /// elements become open and close.
    pub fn from_sorted_trades(symbol: &str, boundary_ms: i64, trades: &[RawTrade]) -> Option<Self> {
        let first = trades.first()?;
        let last = trades.last()?;

        let mut high = f64::MIN;
        let mut low = f64::MAX;
        let mut volume = 0.0;
        for t in trades {
            high = high.max(t.price);
            low = low.min(t.price);
            volume += t.amount;
        }

        Some(Self {
            timestamp_ms: boundary_ms,
            open: first.price,
            high,
            low,
            close: last.price,
            volume,
            trade_count: trades.len() as u64,
            symbol: symbol.to_string(),
        })
    }

    pub fn to_row(&self) -> CandleRow {
        (
            self.timestamp_ms,
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
        )
    }
}

/// Start of the fixed-width bucket containing `timestamp_ms`.
///
/// Uses floor division so pre-epoch timestamps still satisfy
/// `boundary <= t < boundary + interval`.
pub fn candle_boundary(timestamp_ms: i64, interval_ms: i64) -> i64 {
    timestamp_ms.div_euclid(interval_ms) * interval_ms
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
