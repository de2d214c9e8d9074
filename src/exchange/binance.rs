// =============================================================================
// Binance spot adapter: `@trade` WebSocket stream + REST market listing
// =============================================================================

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, instrument, warn};

use super::{Exchange, TradeStream};
use crate::types::{RawTrade, Side};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on trades returned by a single `receive` call.
const MAX_BATCH: usize = 500;

/// REST timeout for the market listing request.
const REST_TIMEOUT: Duration = Duration::from_secs(10);

/// Binance spot exchange: REST for market listing, WebSocket for trades.
#[derive(Clone)]
pub struct BinanceExchange {
    ws_url: String,
    rest_url: String,
    client: reqwest::Client,
}

impl BinanceExchange {
    pub fn new(ws_url: impl Into<String>, rest_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REST_TIMEOUT)
            .build()
            .context("failed to build reqwest client")?;

        Ok(Self {
            ws_url: ws_url.into(),
            rest_url: rest_url.into(),
            client,
        })
    }
}

#[async_trait]
impl Exchange for BinanceExchange {
    fn name(&self) -> &str {
        "binance"
    }

    /// GET /api/v3/exchangeInfo, keeping only symbols with status TRADING.
    #[instrument(skip(self), name = "binance::load_markets")]
    async fn load_markets(&self) -> Result<HashSet<String>> {
        let url = format!("{}/api/v3/exchangeInfo", self.rest_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("exchangeInfo request failed")?;

        let status = resp.status();
        if !status.is_success() {
            bail!("exchangeInfo returned HTTP {status}");
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to decode exchangeInfo JSON")?;

        let markets = parse_exchange_info(&body)?;
        info!(count = markets.len(), "binance markets loaded");
        Ok(markets)
    }

    fn trade_stream(&self, symbol: &str) -> Box<dyn TradeStream> {
        Box::new(BinanceTradeStream::new(self.ws_url.clone(), symbol))
    }
}

// ---------------------------------------------------------------------------
// Trade WebSocket stream
// ---------------------------------------------------------------------------

/// One raw-trade subscription on the Binance WebSocket API.
pub struct BinanceTradeStream {
    ws_url: String,
    symbol: String,
    ws: Option<WsStream>,
    request_id: u64,
}

impl BinanceTradeStream {
    pub fn new(ws_url: impl Into<String>, symbol: &str) -> Self {
        Self {
            ws_url: ws_url.into(),
            symbol: symbol.to_string(),
            ws: None,
            request_id: 0,
        }
    }

    fn ws_mut(&mut self) -> Result<&mut WsStream> {
        self.ws.as_mut().context("trade WebSocket is not connected")
    }

    /// Handle one frame. `Ok(None)` means "nothing to emit, keep reading".
    fn handle_frame(&self, msg: Message) -> Result<Option<RawTrade>> {
        match msg {
            Message::Text(text) => match parse_trade_message(&text, &self.symbol) {
                Ok(trade) => Ok(trade),
                Err(e) => {
                    warn!(symbol = %self.symbol, error = %e, "failed to parse trade message");
                    Ok(None)
                }
            },
            Message::Close(frame) => bail!("server closed trade WebSocket: {frame:?}"),
            // Ping / Pong / Binary -- tungstenite answers pings itself.
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl TradeStream for BinanceTradeStream {
    async fn connect(&mut self) -> Result<()> {
        info!(url = %self.ws_url, symbol = %self.symbol, "connecting to trade WebSocket");
        let (ws_stream, _response) = connect_async(self.ws_url.as_str())
            .await
            .context("failed to connect to trade WebSocket")?;
        self.ws = Some(ws_stream);
        info!(symbol = %self.symbol, "trade WebSocket connected");
        Ok(())
    }

    async fn subscribe(&mut self, symbol: &str) -> Result<()> {
        self.request_id += 1;
        let request = serde_json::json!({
            "method": "SUBSCRIBE",
            "params": [stream_name(symbol)],
            "id": self.request_id,
        });
        self.ws_mut()?
            .send(Message::Text(request.to_string()))
            .await
            .context("failed to send SUBSCRIBE")?;
        debug!(symbol = %symbol, id = self.request_id, "trade subscription sent");
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<RawTrade>> {
        let mut batch = Vec::new();

        // Block for the first trade.
        loop {
            let frame = match self.ws_mut()?.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(e).context("trade WebSocket read error"),
                None => bail!("trade WebSocket stream ended"),
            };
            if let Some(trade) = self.handle_frame(frame)? {
                batch.push(trade);
                break;
            }
        }

        // Then take whatever is already buffered without waiting.
        while batch.len() < MAX_BATCH {
            let ready = match self.ws_mut()?.next().now_or_never() {
                Some(Some(Ok(msg))) => msg,
                Some(Some(Err(e))) => return Err(e).context("trade WebSocket read error"),
                Some(None) | None => break,
            };
            if let Some(trade) = self.handle_frame(ready)? {
                batch.push(trade);
            }
        }

        Ok(batch)
    }

    async fn close(&mut self) {
        if let Some(mut ws) = self.ws.take() {
            if let Err(e) = ws.close(None).await {
                debug!(symbol = %self.symbol, error = %e, "trade WebSocket close failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// `ETH/USDT` -> `ethusdt@trade`.
pub fn stream_name(symbol: &str) -> String {
    format!("{}@trade", symbol.replace('/', "").to_lowercase())
}

/// Parse a Binance trade event.
///
/// Expected shape (optionally wrapped in a combined-stream `data` envelope):
/// ```json
/// { "e": "trade", "s": "ETHUSDT", "t": 12345, "p": "3000.10", "q": "0.5", "T": 1700000000000, "m": true }
/// ```
/// Subscription acknowledgements (`{"result":null,"id":1}`) yield `Ok(None)`.
fn parse_trade_message(text: &str, symbol: &str) -> Result<Option<RawTrade>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse trade JSON")?;

    if root.get("result").is_some() && root.get("id").is_some() {
        return Ok(None);
    }

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    if data["e"].as_str() != Some("trade") {
        return Ok(None);
    }

    let id = match &data["t"] {
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.clone(),
        _ => bail!("missing field t"),
    };
    let timestamp_ms = data["T"].as_i64().context("missing field T")?;
    let price = parse_string_f64(&data["p"], "p")?;
    let amount = parse_string_f64(&data["q"], "q")?;
    // Buyer is maker => taker is selling.
    let side = match data["m"].as_bool() {
        Some(true) => Side::Sell,
        Some(false) => Side::Buy,
        None => Side::Unknown,
    };

    let trade = RawTrade {
        id,
        timestamp_ms,
        price,
        amount,
        symbol: symbol.to_string(),
        side,
    };
    if !trade.is_valid() {
        bail!("trade {} has non-positive price or amount", trade.id);
    }
    Ok(Some(trade))
}

/// Binance sends numeric values as JSON strings.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => bail!("field {name} has unexpected JSON type"),
    }
}

/// Extract `BASE/QUOTE` names of all TRADING symbols from exchangeInfo.
fn parse_exchange_info(body: &serde_json::Value) -> Result<HashSet<String>> {
    let symbols = body["symbols"]
        .as_array()
        .context("exchangeInfo missing symbols array")?;

    Ok(symbols
        .iter()
        .filter(|s| s["status"].as_str() == Some("TRADING"))
        .filter_map(|s| {
            let base = s["baseAsset"].as_str()?;
            let quote = s["quoteAsset"].as_str()?;
            Some(format!("{base}/{quote}"))
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
