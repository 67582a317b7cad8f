//! Broker event translator (C6), grounded on
//! `translate_and_relay_brokerd_events()`: turns whatever a broker
//! adapter emits into client-facing [`Status`] updates, resolving `oid`
//! through the ack/reqid bimap and never forwarding a raw broker error.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::dark_book::DarkBookHandle;
use crate::message::{BrokerStatus, BrokerdCancel, BrokerdEvent, LiveFlowEntry, Resp, Status};
use crate::metrics::EmsMetrics;

/// Runs until the broker event stream closes.
pub async fn translate_and_relay_brokerd_events(
    book: DarkBookHandle,
    brokerd_rx: mpsc::Receiver<BrokerdEvent>,
    brokerd_cancel_tx: mpsc::Sender<BrokerdCancel>,
    client_tx: mpsc::Sender<Status>,
) {
    translate_and_relay_brokerd_events_with_metrics(
        book,
        brokerd_rx,
        brokerd_cancel_tx,
        client_tx,
        String::new(),
        None,
    )
    .await
}

/// Same as [`translate_and_relay_brokerd_events`], additionally recording
/// per-broker/per-kind event counts when a registry is supplied.
pub async fn translate_and_relay_brokerd_events_with_metrics(
    book: DarkBookHandle,
    mut brokerd_rx: mpsc::Receiver<BrokerdEvent>,
    brokerd_cancel_tx: mpsc::Sender<BrokerdCancel>,
    client_tx: mpsc::Sender<Status>,
    broker: String,
    metrics: Option<Arc<EmsMetrics>>,
) {
    while let Some(event) = brokerd_rx.recv().await {
        if let Some(metrics) = &metrics {
            metrics.broker_events_total.with_label_values(&[&broker, event.kind()]).inc();
        }

        let Some(oid) = resolve_oid(&book, &event).await else {
            warn!(event = ?event, "brokerd event with unresolvable oid, dropping");
            continue;
        };

        match event {
            BrokerdEvent::Ack { reqid, time_ns, .. } => {
                book.set_ack(oid.clone(), reqid.clone()).await;

                // A cancel sent before the ack arrived is buffered as an
                // ems_entry; now that a reqid exists, dispatch it for real.
                if let Some(LiveFlowEntry::Cancel(mut cancel)) = book.get_ems_entry(oid.clone()).await {
                    cancel.reqid = Some(reqid);
                    book.set_ems_entry(oid.clone(), LiveFlowEntry::Cancel(cancel.clone())).await;
                    let _ = brokerd_cancel_tx.send(cancel).await;
                } else {
                    book.set_ems_entry(oid.clone(), LiveFlowEntry::Ack { oid: oid.clone(), reqid, time_ns })
                        .await;
                }
            }

            BrokerdEvent::Status { status, filled, remaining, time_ns, reason, .. } => {
                let resp = match status {
                    BrokerStatus::PreSubmitted | BrokerStatus::Submitted => Resp::BrokerSubmitted,
                    BrokerStatus::Cancelled => Resp::BrokerCancelled,
                    BrokerStatus::Filled if remaining > 0.0 => Resp::BrokerFilled,
                    BrokerStatus::Filled => Resp::BrokerExecuted,
                    BrokerStatus::Inactive => Resp::Error,
                };
                let _ = filled;

                // A terminal status (cancelled/fully executed) for an oid
                // whose ems_entry is already gone is a repeat of one the
                // fill/cancel path already relayed -- dedup by oid+resp.
                if matches!(resp, Resp::BrokerCancelled | Resp::BrokerExecuted)
                    && book.get_ems_entry(oid.clone()).await.is_none()
                {
                    continue;
                }

                let mut out = Status::new(oid.clone(), resp, time_ns);
                if let Some(reason) = reason {
                    out = out.with_broker_details(serde_json::json!({ "reason": reason }));
                }
                if matches!(resp, Resp::BrokerCancelled | Resp::BrokerExecuted) {
                    book.remove_ems_entry(oid.clone()).await;
                    book.remove_mapping(oid).await;
                }
                if client_tx.send(out).await.is_err() {
                    return;
                }
            }

            BrokerdEvent::Fill { execid, price, size, time_ns, .. } => {
                // A fill is non-terminal on its own -- the matching terminal
                // `status(filled, remaining=0)` is what resolves the oid and
                // tears down its live-flow entry. If that status already
                // beat this fill to the client, the entry is gone; drop the
                // repeat rather than reporting a now-closed oid again.
                if book.get_ems_entry(oid.clone()).await.is_none() {
                    continue;
                }

                let status = Status::new(oid.clone(), Resp::BrokerFilled, time_ns)
                    .with_broker_details(serde_json::json!({
                        "execid": execid,
                        "price": price,
                        "size": size,
                    }));
                if client_tx.send(status).await.is_err() {
                    return;
                }
            }

            BrokerdEvent::Error { reason, .. } => {
                // Broker-internal errors are logged, never handed to the
                // client verbatim -- the client only sees EMS-level Resp.
                error!(oid = %oid, reason = %reason, "brokerd error");
            }

            BrokerdEvent::Position { .. } => {
                // Position snapshots are consumed by the session bootstrap,
                // not relayed as order status.
            }
        }
    }
}

/// Resolves the client-facing `oid` for an incoming event: the event's own
/// `oid` (set directly or via `paper_info`) wins; otherwise fall back to
/// the reqid bimap populated by a prior ack.
async fn resolve_oid(book: &DarkBookHandle, event: &BrokerdEvent) -> Option<String> {
    if let Some(oid) = event.oid() {
        return Some(oid.to_string());
    }
    let reqid = event.reqid()?;
    book.resolve_oid_by_reqid(reqid.to_string()).await
}
