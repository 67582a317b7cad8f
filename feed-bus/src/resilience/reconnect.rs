//! Resilient quote stream wrapper with automatic reconnection
//!
//! Wraps a [`crate::adapter::BrokerAdapter`] quote subscription with
//! exponential backoff and connection health tracking, the same shape
//! the feed bus needs whether the adapter talks to a real venue or a
//! paper/mock one.

use crate::adapter::{BrokerAdapter, Quote};
use crate::error::{FeedBusError, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::backoff::{BackoffConfig, ExponentialBackoff};

/// Connection state for a resilient quote stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting,
    Failed,
}

/// Configuration for a resilient quote stream
#[derive(Debug, Clone)]
pub struct ResilientConfig {
    pub symbol: String,
    pub backoff_config: BackoffConfig,
    pub connection_timeout: Duration,
    pub stale_threshold: Duration,
}

impl Default for ResilientConfig {
    fn default() -> Self {
        Self {
            symbol: String::new(),
            backoff_config: BackoffConfig::unlimited(),
            connection_timeout: Duration::from_secs(5),
            stale_threshold: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconnectionStats {
    pub reconnection_attempts: u64,
    pub successful_reconnections: u64,
    pub failed_reconnections: u64,
    pub last_reconnection: Option<Instant>,
}

/// Drives a single symbol's quote subscription against an adapter,
/// reconnecting with backoff whenever the adapter's stream task dies.
/// Yields normalized [`Quote`]s on `rx`.
pub struct ResilientQuoteStream {
    config: ResilientConfig,
    adapter: Arc<dyn BrokerAdapter>,
    state: ConnectionState,
    backoff: ExponentialBackoff,
    stats: ReconnectionStats,
    last_quote_at: Option<Instant>,
}

impl ResilientQuoteStream {
    pub fn new(config: ResilientConfig, adapter: Arc<dyn BrokerAdapter>) -> Self {
        let backoff = ExponentialBackoff::with_config(config.backoff_config.clone());
        Self {
            config,
            adapter,
            state: ConnectionState::Reconnecting,
            backoff,
            stats: ReconnectionStats::default(),
            last_quote_at: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn reconnection_stats(&self) -> &ReconnectionStats {
        &self.stats
    }

    /// Runs the reconnect loop until `out` is dropped by the receiver,
    /// feeding normalized quotes to it. Intended to be spawned as its
    /// own task by the feed bus, one per live subscription.
    pub async fn run(mut self, out: mpsc::Sender<Quote>) {
        loop {
            self.stats.reconnection_attempts += 1;
            match self.adapter.stream_quotes(&self.config.symbol).await {
                Ok(mut stream) => {
                    info!(symbol = %self.config.symbol, "quote stream connected");
                    self.state = ConnectionState::Connected;
                    self.stats.successful_reconnections += 1;
                    self.stats.last_reconnection = Some(Instant::now());
                    self.backoff.reset();

                    loop {
                        match stream.recv().await {
                            Some(quote) => {
                                self.last_quote_at = Some(Instant::now());
                                if out.send(quote).await.is_err() {
                                    debug!(symbol = %self.config.symbol, "subscriber dropped, stopping stream");
                                    return;
                                }
                            }
                            None => {
                                warn!(symbol = %self.config.symbol, "quote stream ended, will reconnect");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(symbol = %self.config.symbol, error = %e, "failed to open quote stream");
                    self.stats.failed_reconnections += 1;
                }
            }

            self.state = ConnectionState::Reconnecting;
            match self.backoff.next_delay() {
                Some(delay) => {
                    debug!(symbol = %self.config.symbol, ?delay, attempt = self.backoff.attempt_number(), "backing off before reconnect");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(symbol = %self.config.symbol, "max reconnection attempts exceeded");
                    self.state = ConnectionState::Failed;
                    return;
                }
            }
        }
    }

    /// Whether the last received quote is older than the stale threshold.
    pub fn is_stale(&self) -> Result<bool> {
        match self.last_quote_at {
            Some(t) => Ok(t.elapsed() > self.config.stale_threshold),
            None => Err(FeedBusError::ChannelClosed {
                symbol: self.config.symbol.clone(),
            }),
        }
    }
}
