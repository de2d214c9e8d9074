// Scripted in-process exchange used by pipeline tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Exchange, TradeStream};
use crate::types::{RawTrade, Side};

/// One scripted `receive` outcome.
#[derive(Debug, Clone)]
pub enum Step {
    Trades(Vec<RawTrade>),
    Error(&'static str),
}

#[derive(Default)]
pub struct MockExchange {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    refuse_connect: HashSet<String>,
    refuse_subscribe: HashSet<String>,
    pub connects: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, symbol: &str, steps: Vec<Step>) -> Self {
        self.scripts.lock().insert(symbol.to_string(), steps.into());
        self
    }

    /// Every `connect` for `symbol` fails.
    pub fn refusing(mut self, symbol: &str) -> Self {
        self.refuse_connect.insert(symbol.to_string());
        self
    }

    /// `connect` succeeds but every `subscribe` for `symbol` fails.
    pub fn rejecting_subscribe(mut self, symbol: &str) -> Self {
        self.refuse_subscribe.insert(symbol.to_string());
        self
    }
}

#[async_trait]
impl Exchange for MockExchange {
    fn name(&self) -> &str {
        "mock"
    }

    async fn load_markets(&self) -> Result<HashSet<String>> {
        Ok(self.scripts.lock().keys().cloned().collect())
    }

    fn trade_stream(&self, symbol: &str) -> Box<dyn TradeStream> {
        let script = self.scripts.lock().remove(symbol).unwrap_or_default();
        Box::new(MockStream {
            script,
            refuse: self.refuse_connect.contains(symbol),
            reject_subscribe: self.refuse_subscribe.contains(symbol),
            connects: self.connects.clone(),
            closes: self.closes.clone(),
        })
    }
}

struct MockStream {
    script: VecDeque<Step>,
    refuse: bool,
    reject_subscribe: bool,
    connects: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl TradeStream for MockStream {
    async fn connect(&mut self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            bail!("connection refused");
        }
        Ok(())
    }

    async fn subscribe(&mut self, symbol: &str) -> Result<()> {
        if self.reject_subscribe {
            bail!("subscription to {symbol} rejected");
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<RawTrade>> {
        match self.script.pop_front() {
            Some(Step::Trades(trades)) => Ok(trades),
            Some(Step::Error(msg)) => bail!(msg),
            // Script exhausted: behave like a silent socket.
            None => futures_util::future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn trade(symbol: &str, id: &str, timestamp_ms: i64, price: f64, amount: f64) -> RawTrade {
    RawTrade {
        id: id.to_string(),
        timestamp_ms,
        price,
        amount,
        symbol: symbol.to_string(),
        side: Side::Buy,
    }
}
