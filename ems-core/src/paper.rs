//! Paper-clearing adapter (§4.9): substitutes for a real broker's
//! `trades_dialogue` so an EMS session runs end to end without touching a
//! live venue. Supplements the distillation; `piker` keeps its paper engine
//! in a separate `_paper_engine.py` not carried into this pack, so this is
//! grounded on the ack/fill event shapes `_ems.py` itself expects a broker
//! daemon to emit.

use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::info;

use crate::message::{Action, BrokerStatus, BrokerdCancel, BrokerdEvent, BrokerdOrder, PaperInfo};

/// Simulated fill latency. The real engine makes this configurable per
/// venue; fixed here since nothing in this repo varies it at runtime.
const FILL_LATENCY: Duration = Duration::from_millis(50);

/// Runs until `order_rx` and `cancel_rx` both close. Every accepted order
/// gets an `ack` immediately, then a `status(filled)` + `fill` after
/// [`FILL_LATENCY`]; a cancel racing ahead of the fill short-circuits it.
pub async fn run_paper_engine(
    mut order_rx: mpsc::Receiver<BrokerdOrder>,
    mut cancel_rx: mpsc::Receiver<BrokerdCancel>,
    event_tx: mpsc::Sender<BrokerdEvent>,
) {
    use tokio::sync::oneshot;
    use std::collections::HashMap;

    // oid -> sender the in-flight fill task listens on to learn it was
    // cancelled before the simulated latency elapsed.
    let mut cancel_signals: HashMap<String, oneshot::Sender<()>> = HashMap::new();

    loop {
        tokio::select! {
            Some(order) = order_rx.recv() => {
                let reqid = format!("PAPER-{:08x}", rand::thread_rng().gen::<u32>());
                let oid = order.oid.clone();
                info!(%oid, %reqid, "paper engine accepted order");

                let _ = event_tx
                    .send(BrokerdEvent::Ack { oid: Some(oid.clone()), reqid: reqid.clone(), time_ns: 0 })
                    .await;

                let (cancel_tx, cancel_rx_one) = oneshot::channel();
                cancel_signals.insert(oid.clone(), cancel_tx);

                tokio::spawn(settle_order(order, reqid, event_tx.clone(), cancel_rx_one));
            }
            Some(cancel) = cancel_rx.recv() => {
                if let Some(tx) = cancel_signals.remove(&cancel.oid) {
                    let _ = tx.send(());
                    let _ = event_tx
                        .send(BrokerdEvent::Status {
                            reqid: cancel.reqid.unwrap_or_default(),
                            oid: Some(cancel.oid),
                            status: BrokerStatus::Cancelled,
                            filled: 0.0,
                            remaining: 0.0,
                            reason: None,
                            time_ns: 0,
                            paper_info: None,
                        })
                        .await;
                }
                // Already filled (or unknown oid): no-op, per §4.9.
            }
            else => break,
        }
    }
}

async fn settle_order(
    order: BrokerdOrder,
    reqid: String,
    event_tx: mpsc::Sender<BrokerdEvent>,
    cancelled: tokio::sync::oneshot::Receiver<()>,
) {
    tokio::select! {
        _ = tokio::time::sleep(FILL_LATENCY) => {}
        _ = cancelled => return,
    }

    let paper_info = Some(PaperInfo { oid: order.oid.clone() });

    let _ = event_tx
        .send(BrokerdEvent::Status {
            reqid: reqid.clone(),
            oid: Some(order.oid.clone()),
            status: BrokerStatus::Filled,
            filled: order.size,
            remaining: 0.0,
            reason: None,
            time_ns: 0,
            paper_info: paper_info.clone(),
        })
        .await;

    let _ = event_tx
        .send(BrokerdEvent::Fill {
            reqid,
            oid: Some(order.oid),
            execid: format!("PAPER-FILL-{:08x}", rand::thread_rng().gen::<u32>()),
            broker_time: 0.0,
            size: order.size,
            price: order.price,
            action: order.action,
            time_ns: 0,
            paper_info,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn order_settles_into_status_then_fill() {
        let (order_tx, order_rx) = mpsc::channel(4);
        let (_cancel_tx, cancel_rx) = mpsc::channel(4);
        let (event_tx, mut event_rx) = mpsc::channel(16);

        tokio::spawn(run_paper_engine(order_rx, cancel_rx, event_tx));

        order_tx
            .send(BrokerdOrder {
                oid: "o1".into(),
                reqid: None,
                time_ns: 0,
                symbol: "aapl".into(),
                action: Action::Buy,
                price: 145.0,
                size: 10.0,
            })
            .await
            .unwrap();

        let ack = event_rx.recv().await.unwrap();
        assert!(matches!(ack, BrokerdEvent::Ack { .. }));

        let status = event_rx.recv().await.unwrap();
        assert!(matches!(status, BrokerdEvent::Status { status: BrokerStatus::Filled, .. }));

        let fill = event_rx.recv().await.unwrap();
        assert!(matches!(fill, BrokerdEvent::Fill { .. }));
    }

    #[tokio::test]
    async fn cancel_before_settlement_prevents_fill() {
        let (order_tx, order_rx) = mpsc::channel(4);
        let (cancel_tx, cancel_rx) = mpsc::channel(4);
        let (event_tx, mut event_rx) = mpsc::channel(16);

        tokio::spawn(run_paper_engine(order_rx, cancel_rx, event_tx));

        order_tx
            .send(BrokerdOrder {
                oid: "o2".into(),
                reqid: None,
                time_ns: 0,
                symbol: "aapl".into(),
                action: Action::Buy,
                price: 145.0,
                size: 10.0,
            })
            .await
            .unwrap();
        let _ack = event_rx.recv().await.unwrap();

        cancel_tx
            .send(BrokerdCancel { oid: "o2".into(), reqid: Some("x".into()), time_ns: 0 })
            .await
            .unwrap();

        let status = event_rx.recv().await.unwrap();
        assert!(matches!(status, BrokerdEvent::Status { status: BrokerStatus::Cancelled, .. }));

        // No further events: the fill task observed the cancel and exited.
        let timeout = tokio::time::timeout(Duration::from_millis(200), event_rx.recv()).await;
        assert!(timeout.is_err(), "no fill should follow a successful cancel");
    }
}
