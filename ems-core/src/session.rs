//! EMS main session (C8): wires a single `(broker, symbol)` together --
//! opens a feed, seeds the dark book's last price, and spawns the three
//! concurrent tasks (C5 trigger, C6 translator, C7 command processor)
//! sharing one [`DarkBookHandle`].
//!
//! Broker order-entry is injected as a pair of channels rather than a
//! trait object: `ems-core` has no dependency on `feed-bus`'s adapter
//! trait for the execution side, so callers wire either the paper engine
//! ([`crate::paper::run_paper_engine`]) or a real brokerd bridge and hand
//! this module the resulting channels.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use feed_bus::bus::FeedBus;
use feed_bus::adapter::BrokerAdapter;

use crate::dark_book::DarkBookActor;
use crate::error::{EmsError, Result};
use crate::message::{BrokerdCancel, BrokerdEvent, BrokerdOrder, Order, Status};
use crate::metrics::EmsMetrics;
use crate::translator::translate_and_relay_brokerd_events_with_metrics;
use crate::trigger::clear_dark_triggers;

const DEFAULT_SUBSCRIBER_RATE_HZ: f64 = 20.0;

/// Everything needed to open a session for one `(broker, symbol)`.
pub struct SessionConfig {
    pub broker: String,
    pub symbol: String,
    /// Smallest price increment for the venue, used to scale a triggered
    /// dark order's slippage allowance (§4.5).
    pub min_tick: f64,
    /// Subscriber throttle for this session's own feed tap; `None` for
    /// unthrottled.
    pub rate_hz: Option<f64>,
    /// Positions snapshotted by the caller before handing over the event
    /// stream, returned verbatim ahead of the first status (§4.8/§6).
    pub initial_positions: Vec<BrokerdEvent>,
    /// Shared metrics registry; `None` disables per-session instrumentation
    /// (used in unit tests that don't stand up a metrics server).
    pub metrics: Option<Arc<EmsMetrics>>,
}

/// The client-facing half of an open session.
pub struct SessionHandle {
    pub positions: Vec<BrokerdEvent>,
    pub client_cmd_tx: mpsc::Sender<Order>,
    pub status_rx: mpsc::Receiver<Status>,
}

/// Opens a session: allocates/attaches the feed, seeds `lasts`, and spawns
/// C5/C6/C7 against a freshly spawned [`DarkBookActor`].
pub async fn spawn_session(
    config: SessionConfig,
    feed_bus: Arc<FeedBus>,
    adapter: Arc<dyn BrokerAdapter>,
    brokerd_order_tx: mpsc::Sender<BrokerdOrder>,
    brokerd_cancel_tx: mpsc::Sender<BrokerdCancel>,
    brokerd_event_rx: mpsc::Receiver<BrokerdEvent>,
) -> Result<SessionHandle> {
    let SessionConfig { broker, symbol, min_tick, rate_hz, initial_positions, metrics } = config;

    feed_bus
        .allocate_persistent_feed(adapter, &symbol)
        .await
        .map_err(EmsError::FeedBus)?;
    let mut quote_rx = feed_bus
        .attach_feed_bus(&broker, &symbol, rate_hz.or(Some(DEFAULT_SUBSCRIBER_RATE_HZ)))
        .map_err(EmsError::FeedBus)?;

    let book = DarkBookActor::spawn_with_metrics(broker.clone(), metrics.clone());

    let seed_last = match quote_rx.recv().await {
        Some(quote) => {
            let price = if quote.last != 0.0 { quote.last } else { quote.bid };
            book.update_last(broker.clone(), symbol.clone(), price).await;
            price
        }
        None => {
            warn!(%broker, %symbol, "feed closed before first quote, seeding last price at 0");
            0.0
        }
    };
    info!(%broker, %symbol, seed_last, "session opened");

    let (status_tx, status_rx) = mpsc::channel(256);
    let (client_cmd_tx, mut client_cmd_rx) = mpsc::channel::<Order>(256);

    tokio::spawn(clear_dark_triggers(
        broker.clone(),
        symbol.clone(),
        book.clone(),
        quote_rx,
        brokerd_order_tx.clone(),
        status_tx.clone(),
    ));

    tokio::spawn(translate_and_relay_brokerd_events_with_metrics(
        book.clone(),
        brokerd_event_rx,
        brokerd_cancel_tx.clone(),
        status_tx.clone(),
        broker.clone(),
        metrics,
    ));

    let cmd_broker = broker.clone();
    let cmd_symbol = symbol.clone();
    let cmd_book = book.clone();
    let cmd_status_tx = status_tx.clone();
    tokio::spawn(async move {
        while let Some(cmd) = client_cmd_rx.recv().await {
            let known_last = cmd_book
                .get_last(cmd_broker.clone(), cmd_symbol.clone())
                .await
                .unwrap_or(seed_last);
            crate::client_cmds::process_client_cmd(
                cmd_broker.clone(),
                cmd_symbol.clone(),
                cmd,
                known_last,
                min_tick,
                &cmd_book,
                &brokerd_order_tx,
                &brokerd_cancel_tx,
                &cmd_status_tx,
            )
            .await;
        }
    });

    Ok(SessionHandle { positions: initial_positions, client_cmd_tx, status_rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Action, ExecMode};
    use async_trait::async_trait;
    use feed_bus::adapter::{Quote, QuoteReceiver, SymbolInfo, TickType};
    use feed_bus::ring::OhlcRow;
    use tokio::sync::Mutex as AsyncMutex;

    struct ScriptedAdapter {
        quotes: AsyncMutex<Vec<Quote>>,
    }

    #[async_trait]
    impl BrokerAdapter for ScriptedAdapter {
        fn name(&self) -> &str {
            "mock"
        }

        async fn stream_quotes(&self, _symbol: &str) -> feed_bus::error::Result<QuoteReceiver> {
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
        ) -> feed_bus::error::Result<Vec<OhlcRow>> {
            Ok(Vec::new())
        }

        async fn trades_dialogue(&self) -> feed_bus::error::Result<()> {
            Ok(())
        }

        async fn open_symbol_search(&self, _pattern: &str) -> feed_bus::error::Result<Vec<SymbolInfo>> {
            Ok(Vec::new())
        }
    }

    fn quote(last: f64) -> Quote {
        Quote {
            symbol: "aapl".into(),
            time_ns: 1_000_000_000,
            bid: last - 0.01,
            bid_size: 10.0,
            ask: last + 0.01,
            ask_size: 10.0,
            last,
            last_size: 10.0,
            ticks: vec![TickType::Ask { price: last + 0.01, size: 10.0 }],
        }
    }

    #[tokio::test]
    async fn session_seeds_last_and_submits_dark_order() {
        let dir = tempfile::tempdir().unwrap();
        let feed_bus = Arc::new(FeedBus::new(dir.path().to_path_buf()));
        let adapter: Arc<dyn BrokerAdapter> = Arc::new(ScriptedAdapter {
            quotes: AsyncMutex::new(vec![quote(150.0), quote(150.0)]),
        });

        let (order_tx, _order_rx) = mpsc::channel(8);
        let (cancel_tx, _cancel_rx) = mpsc::channel(8);
        let (_event_tx, event_rx) = mpsc::channel(8);

        let handle = spawn_session(
            SessionConfig {
                broker: "mock".into(),
                symbol: "aapl".into(),
                min_tick: 0.01,
                rate_hz: None,
                initial_positions: Vec::new(),
                metrics: None,
            },
            feed_bus,
            adapter,
            order_tx,
            cancel_tx,
            event_rx,
        )
        .await
        .unwrap();

        handle
            .client_cmd_tx
            .send(Order {
                oid: "o1".into(),
                symbol: "aapl".into(),
                brokers: vec!["mock".into()],
                action: Action::Buy,
                price: 140.0,
                size: 5.0,
                exec_mode: ExecMode::Dark,
            })
            .await
            .unwrap();

        let mut status_rx = handle.status_rx;
        let status = status_rx.recv().await.unwrap();
        assert_eq!(status.oid, "o1");
    }
}
