//! Dark trigger loop (C5): scans the live quote stream against the dark
//! book's registered predicates and fires broker orders / client alerts.

use tokio::sync::mpsc;
use tracing::info;

use crate::dark_book::DarkBookHandle;
use crate::message::{Action, BrokerdOrder, LiveFlowEntry, Resp, Status};
use feed_bus::adapter::Quote;

/// Runs until the quote stream closes. Grounded on `clear_dark_triggers`:
/// for every tick in every incoming quote, update `lasts` then scan the
/// symbol's dark entries and relay whatever fired.
pub async fn clear_dark_triggers(
    broker: String,
    symbol: String,
    book: DarkBookHandle,
    mut quote_rx: mpsc::Receiver<Quote>,
    brokerd_tx: mpsc::Sender<BrokerdOrder>,
    client_tx: mpsc::Sender<Status>,
) {
    while let Some(quote) = quote_rx.recv().await {
        for tick in &quote.ticks {
            let Some(price) = tick.price() else { continue };
            book.update_last(broker.clone(), symbol.clone(), price).await;

            let outcomes = book.scan_symbol(symbol.clone(), tick.clone()).await;
            for outcome in outcomes {
                let is_alert = outcome.cmd.action == Action::Alert;

                if let Some(submit_price) = outcome.submit_price {
                    let order = BrokerdOrder {
                        oid: outcome.oid.clone(),
                        reqid: None,
                        time_ns: quote.time_ns,
                        symbol: symbol.clone(),
                        action: outcome.cmd.action,
                        price: submit_price,
                        size: outcome.cmd.size,
                    };
                    book.set_ems_entry(outcome.oid.clone(), LiveFlowEntry::Order(order.clone()))
                        .await;
                    info!(oid = %outcome.oid, price = submit_price, "dark order triggered");
                    if brokerd_tx.send(order).await.is_err() {
                        return;
                    }
                }

                let resp = if is_alert { Resp::AlertTriggered } else { Resp::DarkTriggered };
                let status = Status::new(outcome.oid, resp, 0).with_trigger_price(outcome.trigger_price);
                if client_tx.send(status).await.is_err() {
                    return;
                }
            }
        }
    }
}
