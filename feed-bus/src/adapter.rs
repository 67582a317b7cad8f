//! The broker adapter boundary (C3).
//!
//! Every venue integration -- a real broker, a paper book, a mock used
//! in tests -- implements [`BrokerAdapter`]. The feed bus and the EMS
//! only ever talk to this trait; nothing upstream knows whether quotes
//! came from a live socket or a replay file.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::ring::OhlcRow;

/// A single normalized quote/tick, the unit the feed bus samples into
/// OHLC bars and relays to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Quote {
    pub symbol: String,
    /// Epoch nanoseconds, as received from the venue (not wall clock at
    /// receipt -- the bus stamps its own latency separately).
    pub time_ns: i64,
    pub bid: f64,
    pub bid_size: f64,
    pub ask: f64,
    pub ask_size: f64,
    pub last: f64,
    pub last_size: f64,
    pub ticks: Vec<TickType>,
}

/// Sub-events folded into a quote, mirroring the tagged `ticks` list in
/// the wire schema (clears, dark-triggered fills, venue-specific L2
/// deltas all ride along here without widening `Quote` itself).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TickType {
    Trade { price: f64, size: f64 },
    /// Uncrossed/untraded ticks some venues emit for indicative levels.
    Utrade { price: f64, size: f64 },
    Bid { price: f64, size: f64 },
    Ask { price: f64, size: f64 },
    Bsize { size: f64 },
    Asize { size: f64 },
    /// Last-traded-price echo, distinct from `Trade` on venues that
    /// repeat it outside the trade tape.
    Last { price: f64 },
}

impl TickType {
    /// The discriminant name used by tick-filter membership checks
    /// (`bid`, `ask`, `trade`, ...), independent of the tick's payload.
    pub fn kind(&self) -> &'static str {
        match self {
            TickType::Trade { .. } => "trade",
            TickType::Utrade { .. } => "utrade",
            TickType::Bid { .. } => "bid",
            TickType::Ask { .. } => "ask",
            TickType::Bsize { .. } => "bsize",
            TickType::Asize { .. } => "asize",
            TickType::Last { .. } => "last",
        }
    }

    /// The price carried by this tick, if any (size-only ticks have none).
    pub fn price(&self) -> Option<f64> {
        match self {
            TickType::Trade { price, .. }
            | TickType::Utrade { price, .. }
            | TickType::Bid { price, .. }
            | TickType::Ask { price, .. }
            | TickType::Last { price } => Some(*price),
            TickType::Bsize { .. } | TickType::Asize { .. } => None,
        }
    }
}

/// A symbol search hit returned by [`BrokerAdapter::open_symbol_search`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SymbolInfo {
    pub symbol: String,
    pub description: String,
    pub venue: String,
}

/// The boundary every venue integration implements. Mirrors the
/// `get_client`/`stream_quotes`/`backfill_bars`/`trades_dialogue`
/// surface a brokerd module exposes to the feed bus and EMS.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Human-readable name used in log lines and shm ring names.
    fn name(&self) -> &str;

    /// Opens a live quote subscription for `symbol`. The returned
    /// channel is read until it closes, at which point the caller (see
    /// [`crate::resilience::ResilientQuoteStream`]) reconnects.
    async fn stream_quotes(&self, symbol: &str) -> Result<QuoteReceiver>;

    /// Fetches up to `count` historical OHLC bars ending at `end_time`
    /// (or the most recent bars if `end_time` is `None`), oldest first.
    async fn backfill_bars(
        &self,
        symbol: &str,
        count: usize,
        end_time: Option<i64>,
    ) -> Result<Vec<OhlcRow>>;

    /// Opens the order-entry dialogue for this venue. Adapters that are
    /// quote-only (e.g. a pure market-data feed) return an error here;
    /// the EMS treats that as "no execution support for this broker".
    async fn trades_dialogue(&self) -> Result<()>;

    /// Fuzzy symbol search against the venue's instrument catalogue.
    async fn open_symbol_search(&self, pattern: &str) -> Result<Vec<SymbolInfo>>;
}

/// Thin wrapper so adapters don't leak `mpsc::Receiver` construction
/// details; also gives us a seam to add sequence-gap detection later.
pub struct QuoteReceiver {
    inner: mpsc::Receiver<Quote>,
}

impl QuoteReceiver {
    pub fn new(inner: mpsc::Receiver<Quote>) -> Self {
        Self { inner }
    }

    pub async fn recv(&mut self) -> Option<Quote> {
        self.inner.recv().await
    }
}
