//! A programmable [`BrokerAdapter`] for integration tests, grounded on
//! `testing::mock_huginn::MockHuginnFeed`: push scripted quotes/bars ahead
//! of time, then drive a session against them without a real venue.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use feed_bus::adapter::{BrokerAdapter, Quote, QuoteReceiver, SymbolInfo};
use feed_bus::error::Result;
use feed_bus::ring::OhlcRow;

/// A mock venue whose quote stream and backfill response are set up ahead
/// of time by the test, then drained in order as the session runs.
pub struct MockAdapter {
    name: String,
    quotes: Mutex<Vec<Quote>>,
    backfill: Mutex<Vec<OhlcRow>>,
    search_results: Mutex<Vec<SymbolInfo>>,
}

impl MockAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            quotes: Mutex::new(Vec::new()),
            backfill: Mutex::new(Vec::new()),
            search_results: Mutex::new(Vec::new()),
        }
    }

    pub fn push_quote(&self, quote: Quote) {
        self.quotes.lock().push(quote);
    }

    pub fn push_quotes(&self, quotes: impl IntoIterator<Item = Quote>) {
        self.quotes.lock().extend(quotes);
    }

    pub fn set_backfill(&self, rows: Vec<OhlcRow>) {
        *self.backfill.lock() = rows;
    }

    pub fn set_search_results(&self, results: Vec<SymbolInfo>) {
        *self.search_results.lock() = results;
    }

    pub fn pending_count(&self) -> usize {
        self.quotes.lock().len()
    }
}

#[async_trait]
impl BrokerAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream_quotes(&self, _symbol: &str) -> Result<QuoteReceiver> {
        let queued = std::mem::take(&mut *self.quotes.lock());
        let (tx, rx) = mpsc::channel(queued.len().max(1));
        tokio::spawn(async move {
            for quote in queued {
                if tx.send(quote).await.is_err() {
                    break;
                }
            }
        });
        Ok(QuoteReceiver::new(rx))
    }

    async fn backfill_bars(
        &self,
        _symbol: &str,
        count: usize,
        _end_time: Option<i64>,
    ) -> Result<Vec<OhlcRow>> {
        let rows = self.backfill.lock().clone();
        Ok(rows.into_iter().take(count).collect())
    }

    async fn trades_dialogue(&self) -> Result<()> {
        Ok(())
    }

    async fn open_symbol_search(&self, _pattern: &str) -> Result<Vec<SymbolInfo>> {
        Ok(self.search_results.lock().clone())
    }
}

/// Convenience constructor matching the adapter trait's `Arc<dyn _>`
/// object-safety requirement at call sites.
pub fn mock_adapter(name: impl Into<String>) -> Arc<dyn BrokerAdapter> {
    Arc::new(MockAdapter::new(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(last: f64) -> Quote {
        Quote {
            symbol: "aapl".into(),
            time_ns: 1,
            bid: last - 0.01,
            bid_size: 1.0,
            ask: last + 0.01,
            ask_size: 1.0,
            last,
            last_size: 1.0,
            ticks: Vec::new(),
        }
    }

    #[tokio::test]
    async fn streams_pushed_quotes_in_order() {
        let adapter = MockAdapter::new("mock");
        adapter.push_quotes(vec![quote(100.0), quote(101.0)]);
        assert_eq!(adapter.pending_count(), 2);

        let mut rx = adapter.stream_quotes("aapl").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().last, 100.0);
        assert_eq!(rx.recv().await.unwrap().last, 101.0);
        assert!(rx.recv().await.is_none());
    }
}
