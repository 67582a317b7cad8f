//! The feed bus (C2): one writer per symbol, many throttled subscribers.
//!
//! Grounded directly on `_FeedsBus`/`allocate_persistent_feed`/
//! `attach_feed_bus` in the original feed daemon: the first caller to
//! ask for a symbol becomes its writer and samples the adapter's quote
//! stream into the shared OHLC ring; every later caller for the same
//! symbol attaches read-only and gets its own throttled quote channel
//! fed off the writer's broadcast.

use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::adapter::{BrokerAdapter, Quote};
use crate::error::{FeedBusError, Result};
use crate::ring::{OhlcRing, OhlcRow, ShmToken};
use crate::resilience::{ResilientConfig, ResilientQuoteStream};

const BROADCAST_CAPACITY: usize = 2048;
const DEFAULT_RING_CAPACITY: usize = 5 * 60 * 24; // a trading day of 1s bars
const DEFAULT_BACKFILL_BARS: usize = 2000;

/// A live, writer-owned feed for one symbol: the shared ring plus the
/// broadcast channel every subscriber taps into.
struct FeedState {
    ring: Arc<OhlcRing>,
    broadcast_tx: broadcast::Sender<Quote>,
}

/// Per-process registry of active feeds, keyed by `"{broker}.{symbol}"`.
/// One `FeedBus` is shared by every session on a host; whichever caller
/// gets to `allocate_persistent_feed` first for a given key becomes its
/// writer for the lifetime of the process.
pub struct FeedBus {
    feeds: DashMap<String, Arc<FeedState>>,
    shm_dir: PathBuf,
}

impl FeedBus {
    pub fn new(shm_dir: PathBuf) -> Self {
        Self {
            feeds: DashMap::new(),
            shm_dir,
        }
    }

    fn ring_name(broker: &str, symbol: &str) -> String {
        // mirrors `sym_to_shm_key`: lowercase, dot-joined, no path seps.
        format!("{}.{}", broker.to_lowercase(), symbol.to_lowercase())
    }

    /// Ensures a writer exists for `(broker, symbol)`, spawning one
    /// backed by `adapter` if this is the first request. Returns the
    /// ring's attach token regardless of who ends up the writer.
    pub async fn allocate_persistent_feed(
        &self,
        adapter: Arc<dyn BrokerAdapter>,
        symbol: &str,
    ) -> Result<ShmToken> {
        let key = Self::ring_name(adapter.name(), symbol);

        if let Some(existing) = self.feeds.get(&key) {
            debug!(%key, "feed already has a writer, reusing");
            return Ok(existing.ring.token());
        }

        // Create-then-insert race: only the caller that successfully
        // inserts becomes the writer; losers fall through to reuse.
        let ring = Arc::new(OhlcRing::create(&self.shm_dir, &key, DEFAULT_RING_CAPACITY)?);
        let backfill = adapter
            .backfill_bars(symbol, DEFAULT_BACKFILL_BARS, None)
            .await
            .unwrap_or_else(|e| {
                warn!(%key, error = %e, "backfill failed, starting from an empty ring");
                Vec::new()
            });
        if !backfill.is_empty() {
            ring.push(&backfill, true)?;
        }

        let token = ring.token();
        let (broadcast_tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        let state = Arc::new(FeedState {
            ring: ring.clone(),
            broadcast_tx: broadcast_tx.clone(),
        });

        match self.feeds.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                debug!(%key, "lost the writer race, reusing existing feed");
                return Ok(existing.get().ring.token());
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(state);
            }
        }

        info!(%key, "elected as writer, spawning sampler");
        let resilient = ResilientQuoteStream::new(
            ResilientConfig {
                symbol: symbol.to_string(),
                ..Default::default()
            },
            adapter,
        );
        let (quote_tx, quote_rx) = mpsc::channel(BROADCAST_CAPACITY);
        tokio::spawn(resilient.run(quote_tx));
        tokio::spawn(sample_and_broadcast(key, ring, broadcast_tx, quote_rx));

        Ok(token)
    }

    /// Attaches a new subscriber to an already-allocated feed, returning
    /// a channel throttled to at most `rate_hz` deliveries per second
    /// (unbounded if `None`). Mirrors `attach_feed_bus` + the sampler's
    /// `uniform_rate_send` fan-out in the original implementation.
    pub fn attach_feed_bus(&self, broker: &str, symbol: &str, rate_hz: Option<f64>) -> Result<mpsc::Receiver<Quote>> {
        let key = Self::ring_name(broker, symbol);
        let state = self
            .feeds
            .get(&key)
            .ok_or_else(|| FeedBusError::SymbolNotFound {
                symbol: symbol.to_string(),
            })?;
        let mut rx = state.broadcast_tx.subscribe();
        let (out_tx, out_rx) = mpsc::channel(256);

        tokio::spawn(async move {
            let min_interval = rate_hz.map(|hz| Duration::from_secs_f64(1.0 / hz));
            let mut last_sent: Option<tokio::time::Instant> = None;
            loop {
                let mut quote = match rx.recv().await {
                    Ok(q) => q,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "subscriber lagged, dropping intermediate quotes");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                if let Some(interval) = min_interval {
                    let now = tokio::time::Instant::now();
                    if let Some(last) = last_sent {
                        let elapsed = now.duration_since(last);
                        if elapsed < interval {
                            tokio::time::sleep(interval - elapsed).await;
                        }
                    }

                    // A subscriber paced below the feed's actual rate must
                    // not deliver the oldest quote queued up behind the
                    // pacing wait -- drain to whatever is newest so it
                    // never falls further behind than one throttle tick.
                    while let Ok(newer) = rx.try_recv() {
                        quote = newer;
                    }

                    last_sent = Some(tokio::time::Instant::now());
                }

                if out_tx.send(quote).await.is_err() {
                    break;
                }
            }
        });

        Ok(out_rx)
    }

    pub fn token_for(&self, broker: &str, symbol: &str) -> Option<ShmToken> {
        self.feeds
            .get(&Self::ring_name(broker, symbol))
            .map(|f| f.ring.token())
    }

    pub fn is_writer_for(&self, broker: &str, symbol: &str) -> bool {
        self.feeds.contains_key(&Self::ring_name(broker, symbol))
    }
}

/// Samples the adapter's raw quote stream into the shared ring (one
/// running OHLC bar, updated in place until its minute rolls over) and
/// rebroadcasts each quote verbatim to subscribers.
async fn sample_and_broadcast(
    key: String,
    ring: Arc<OhlcRing>,
    broadcast_tx: broadcast::Sender<Quote>,
    mut quote_rx: mpsc::Receiver<Quote>,
) {
    const BAR_NS: i64 = 1_000_000_000;
    let mut current_bar: Option<OhlcRow> = None;

    while let Some(quote) = quote_rx.recv().await {
        let bucket = quote.time_ns / BAR_NS;
        let price = if quote.last != 0.0 { quote.last } else { quote.bid };

        match current_bar.as_mut() {
            Some(bar) if bar.time == bucket => {
                bar.high = bar.high.max(price);
                bar.low = bar.low.min(price);
                bar.close = price;
                bar.volume += quote.last_size;
                bar.count += 1;
                if let Err(e) = ring.update_head(*bar) {
                    warn!(%key, error = %e, "failed to update head bar");
                }
            }
            _ => {
                let bar = OhlcRow {
                    index: 0,
                    time: bucket,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: quote.last_size,
                    bar_wap: price,
                    count: 1,
                };
                if let Err(e) = ring.push(&[bar], false) {
                    warn!(%key, error = %e, "failed to push new bar");
                }
                current_bar = Some(bar);
            }
        }

        // A send error here just means there are currently no
        // subscribers; the writer keeps sampling regardless.
        let _ = broadcast_tx.send(quote);
    }

    debug!(%key, "writer's quote stream ended, feed is now dormant");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{BrokerAdapter, QuoteReceiver, SymbolInfo};
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    struct MockAdapter {
        quotes: Mutex<Vec<Quote>>,
    }

    #[async_trait]
    impl BrokerAdapter for MockAdapter {
        fn name(&self) -> &str {
            "mock"
        }

        async fn stream_quotes(&self, _symbol: &str) -> Result<QuoteReceiver> {
            let (tx, rx) = mpsc::channel(16);
            let quotes = self.quotes.lock().await.clone();
            tokio::spawn(async move {
                for q in quotes {
                    let _ = tx.send(q).await;
                }
            });
            Ok(QuoteReceiver::new(rx))
        }

        async fn backfill_bars(
            &self,
            _symbol: &str,
            _count: usize,
            _end_time: Option<i64>,
        ) -> Result<Vec<OhlcRow>> {
            Ok(Vec::new())
        }

        async fn trades_dialogue(&self) -> Result<()> {
            Ok(())
        }

        async fn open_symbol_search(&self, _pattern: &str) -> Result<Vec<SymbolInfo>> {
            Ok(Vec::new())
        }
    }

    fn quote(t: i64, last: f64) -> Quote {
        Quote {
            symbol: "aapl".to_string(),
            time_ns: t,
            bid: last - 0.01,
            bid_size: 100.0,
            ask: last + 0.01,
            ask_size: 100.0,
            last,
            last_size: 10.0,
            ticks: Vec::new(),
        }
    }

    #[tokio::test]
    async fn writer_election_and_fan_out() {
        let dir = tempfile::tempdir().unwrap();
        let bus = FeedBus::new(dir.path().to_path_buf());
        let adapter: Arc<dyn BrokerAdapter> = Arc::new(MockAdapter {
            quotes: Mutex::new(vec![quote(1_000_000_000, 100.0), quote(1_000_000_000, 101.0)]),
        });

        let token1 = bus
            .allocate_persistent_feed(adapter.clone(), "aapl")
            .await
            .unwrap();
        let token2 = bus
            .allocate_persistent_feed(adapter.clone(), "aapl")
            .await
            .unwrap();
        assert_eq!(token1.name, token2.name);

        let mut sub = bus.attach_feed_bus("mock", "aapl", None).unwrap();
        let first = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap();
        assert!(first.is_some());
    }
}
