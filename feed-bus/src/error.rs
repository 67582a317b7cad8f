//! Error types for the feed bus.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the feed bus and the shared OHLC ring.
#[derive(Debug, Error)]
pub enum FeedBusError {
    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("duplicate shm writer attempt for {name}")]
    DuplicateWriter { name: String },

    #[error("history provider rate-limited us, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("no historical data available for {symbol}")]
    NoHistoricalData { symbol: String },

    #[error("ring buffer {name} is full and cannot accept a prepend of {rows} rows")]
    RingOverflow { name: String, rows: usize },

    #[error("adapter transport error: {0}")]
    Transport(String),

    #[error("quote channel closed unexpectedly for {symbol}")]
    ChannelClosed { symbol: String },
}

pub type Result<T> = std::result::Result<T, FeedBusError>;
