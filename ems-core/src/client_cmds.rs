//! Client command processor (C7): turns an incoming [`Order`] into dark
//! book registrations, paper/live broker requests, or cancels, per the
//! submit/cancel algorithm in `piker/clearing/_ems.py`'s `process_order_cmds`.

use tokio::sync::mpsc;
use tracing::warn;

use crate::dark_book::{mk_check, tick_filter_for, DarkBookHandle, DarkOrderEntry};
use crate::message::{Action, BrokerdCancel, BrokerdOrder, ExecMode, LiveFlowEntry, Order, Resp, Status};

/// Dollars-equivalent slippage allowance applied to a triggered dark order's
/// submit price, expressed in ticks (§4.5).
const SPREAD_SLAP: f64 = 5.0;

/// Processes one client command against a single `(broker, symbol)` dark
/// book, emitting at most one broker-bound request and one client status.
pub async fn process_client_cmd(
    broker: String,
    symbol: String,
    cmd: Order,
    known_last: f64,
    min_tick: f64,
    book: &DarkBookHandle,
    brokerd_order_tx: &mpsc::Sender<BrokerdOrder>,
    brokerd_cancel_tx: &mpsc::Sender<BrokerdCancel>,
    client_tx: &mpsc::Sender<Status>,
) {
    match cmd.action {
        Action::Cancel => handle_cancel(symbol, cmd, book, brokerd_cancel_tx, client_tx).await,
        Action::Buy | Action::Sell if cmd.exec_mode == ExecMode::Live => {
            handle_live_submit(cmd, book, brokerd_order_tx, client_tx).await
        }
        _ => handle_dark_or_alert_submit(broker, symbol, cmd, known_last, min_tick, book, client_tx).await,
    }
}

async fn handle_cancel(
    symbol: String,
    cmd: Order,
    book: &DarkBookHandle,
    brokerd_cancel_tx: &mpsc::Sender<BrokerdCancel>,
    client_tx: &mpsc::Sender<Status>,
) {
    let oid = cmd.oid;

    // Still resting as a dark/alert predicate: cancel locally, no broker
    // round trip needed.
    if book.cancel_dark(symbol, oid.clone()).await {
        let _ = client_tx
            .send(Status::new(oid, Resp::DarkCancelled, 0))
            .await;
        return;
    }

    match book.get_ems_entry(oid.clone()).await {
        Some(entry @ (LiveFlowEntry::Order(_) | LiveFlowEntry::Ack { .. })) => {
            let reqid = entry.reqid().map(str::to_string);
            let cancel = BrokerdCancel { oid: oid.clone(), reqid, time_ns: 0 };
            if reqid_missing(&cancel) {
                // No ack yet: buffer the cancel so the translator can
                // relay it once the ack (and its reqid) arrives.
                book.set_ems_entry(oid, LiveFlowEntry::Cancel(cancel)).await;
                return;
            }
            let _ = brokerd_cancel_tx.send(cancel).await;
        }
        Some(LiveFlowEntry::Cancel(_)) => {
            // Already buffered or already sent; nothing new to do.
        }
        None => {
            warn!(%oid, "cancel for unknown order id");
            let _ = client_tx.send(Status::new(oid, Resp::Error, 0)).await;
        }
    }
}

fn reqid_missing(cancel: &BrokerdCancel) -> bool {
    cancel.reqid.is_none()
}

async fn handle_live_submit(
    cmd: Order,
    book: &DarkBookHandle,
    brokerd_order_tx: &mpsc::Sender<BrokerdOrder>,
    client_tx: &mpsc::Sender<Status>,
) {
    let order = BrokerdOrder {
        oid: cmd.oid.clone(),
        reqid: None,
        time_ns: 0,
        symbol: cmd.symbol,
        action: cmd.action,
        price: cmd.price,
        size: cmd.size,
    };
    // Recorded before the ack arrives so a cancel racing ahead of it finds
    // a live-flow entry to buffer against instead of an unknown oid.
    book.set_ems_entry(cmd.oid.clone(), LiveFlowEntry::Order(order.clone())).await;
    if brokerd_order_tx.send(order).await.is_ok() {
        let _ = client_tx
            .send(Status::new(cmd.oid, Resp::BrokerSubmitted, 0))
            .await;
    }
}

async fn handle_dark_or_alert_submit(
    broker: String,
    symbol: String,
    cmd: Order,
    known_last: f64,
    min_tick: f64,
    book: &DarkBookHandle,
    client_tx: &mpsc::Sender<Status>,
) {
    let oid = cmd.oid.clone();

    let Some(predicate) = mk_check(cmd.price, known_last) else {
        let _ = client_tx
            .send(Status::new(oid, Resp::Error, 0).with_broker_details(serde_json::json!({
                "reason": "trigger price ambiguous against known last",
            })))
            .await;
        return;
    };

    // Reject immediately: a predicate that already matches the known last
    // would otherwise fire the instant it's registered, surprising a
    // client expecting a resting conditional order.
    if predicate.check(known_last) {
        let _ = client_tx
            .send(Status::new(oid, Resp::Error, 0).with_broker_details(serde_json::json!({
                "reason": "trigger price already crossed by known last",
            })))
            .await;
        return;
    }

    let (filter, percent_away, direction) = tick_filter_for(cmd.action);
    let entry = DarkOrderEntry {
        predicate,
        tick_filter: filter.to_vec(),
        cmd: cmd.clone(),
        percent_away,
        abs_diff_away: direction * SPREAD_SLAP * min_tick,
    };
    book.register_dark(symbol, oid.clone(), entry).await;
    book.update_last(broker, cmd.symbol, known_last).await;

    let resp = if cmd.action == Action::Alert { Resp::AlertSubmitted } else { Resp::DarkSubmitted };
    let _ = client_tx.send(Status::new(oid, resp, 0)).await;
}
