//! End-to-end fan-out scenario: two sessions attach to the same
//! `(broker, symbol)` feed, only one of them drives the writer race, and
//! both see the identical quote stream, in order, independent of the
//! other's lifetime.

use std::sync::Arc;

use async_trait::async_trait;
use feed_bus::adapter::{BrokerAdapter, Quote, QuoteReceiver, SymbolInfo};
use feed_bus::bus::FeedBus;
use feed_bus::error::Result;
use feed_bus::ring::OhlcRow;
use tokio::sync::{mpsc, Mutex};

struct ScriptedAdapter {
    quotes: Mutex<Vec<Quote>>,
}

#[async_trait]
impl BrokerAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "ib"
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

    async fn backfill_bars(&self, _symbol: &str, _count: usize, _end_time: Option<i64>) -> Result<Vec<OhlcRow>> {
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
        symbol: "AAPL".into(),
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
async fn two_sessions_share_one_writer_and_see_identical_fifo_quotes() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(FeedBus::new(dir.path().to_path_buf()));
    let adapter: Arc<dyn BrokerAdapter> = Arc::new(ScriptedAdapter {
        quotes: Mutex::new(vec![quote(1, 150.0), quote(2, 150.5), quote(3, 151.0)]),
    });

    let token_a = bus.allocate_persistent_feed(adapter, "AAPL").await.unwrap();
    // The second session's call (a distinct `Arc<dyn BrokerAdapter>`
    // instance, never touched once the writer race is settled) must reuse
    // the existing writer rather than sampling a second time.
    let late_adapter: Arc<dyn BrokerAdapter> = Arc::new(ScriptedAdapter { quotes: Mutex::new(Vec::new()) });
    let token_b = bus.allocate_persistent_feed(late_adapter, "AAPL").await.unwrap();
    assert_eq!(token_a.name, token_b.name);
    assert!(bus.is_writer_for("ib", "AAPL"));

    let mut sub_one = bus.attach_feed_bus("ib", "AAPL", None).unwrap();
    let mut sub_two = bus.attach_feed_bus("ib", "AAPL", None).unwrap();

    let first = sub_one.recv().await.unwrap();
    assert_eq!(first.last, 150.0);

    // Cancelling one subscriber (dropping its receiver) must not disturb
    // the other: each holds its own broadcast subscription and throttle
    // task, so the remaining two quotes still reach `sub_two` in order.
    drop(sub_one);
    for expected in [150.0, 150.5, 151.0] {
        let q = sub_two.recv().await.unwrap();
        assert_eq!(q.last, expected);
    }
}
