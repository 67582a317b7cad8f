//! Shared market-data feed bus: one writer per symbol sampling into a
//! shared OHLC ring, fanned out to throttled subscribers.

pub mod adapter;
pub mod bus;
pub mod error;
pub mod metrics;
pub mod resilience;
pub mod ring;

pub mod prelude {
    pub use crate::adapter::{BrokerAdapter, Quote, QuoteReceiver, SymbolInfo, TickType};
    pub use crate::bus::FeedBus;
    pub use crate::error::{FeedBusError, Result};
    pub use crate::ring::{OhlcRing, OhlcRow, ShmToken};
}
