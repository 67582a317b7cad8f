//! Reconnection resilience for broker adapter streams.

pub mod backoff;
pub mod reconnect;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use reconnect::{ConnectionState, ReconnectionStats, ResilientConfig, ResilientQuoteStream};
