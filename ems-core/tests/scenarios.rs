//! End-to-end session scenarios, driven the same way `emsd` drives a
//! real session: a [`MockAdapter`] feeding [`spawn_session`], client
//! commands in, broker events in, client statuses out.

use std::sync::Arc;

use ems_core::message::{Action, BrokerdEvent, BrokerStatus, ExecMode, Order, Resp};
use ems_core::mock_adapter::MockAdapter;
use ems_core::session::{spawn_session, SessionConfig, SessionHandle};
use feed_bus::adapter::{BrokerAdapter, Quote, TickType};
use feed_bus::bus::FeedBus;
use tempfile::TempDir;
use tokio::sync::mpsc;

fn quote_with_ticks(last: f64, ticks: Vec<TickType>) -> Quote {
    Quote {
        symbol: "aapl".into(),
        time_ns: 1,
        bid: last - 0.01,
        bid_size: 10.0,
        ask: last + 0.01,
        ask_size: 10.0,
        last,
        last_size: 10.0,
        ticks,
    }
}

fn seed_quote(last: f64) -> Quote {
    quote_with_ticks(last, vec![TickType::Last { price: last }])
}

fn order(oid: &str, action: Action, price: f64, exec_mode: ExecMode) -> Order {
    Order { oid: oid.into(), symbol: "aapl".into(), brokers: vec!["ib".into()], action, price, size: 10.0, exec_mode }
}

/// Opens a session against `quotes` (all queued on the mock adapter ahead
/// of time; the subscriber's default 20Hz throttle gives test code room
/// to act between deliveries). Keeps the backing `TempDir` alive for the
/// caller's scope -- dropping it would unlink the feed's shm ring file --
/// and keeps the broker-bound order/cancel receivers alive so a triggered
/// dark order doesn't find its outbound channel already closed.
async fn open_session(
    quotes: Vec<Quote>,
) -> (
    TempDir,
    SessionHandle,
    mpsc::Sender<BrokerdEvent>,
    mpsc::Receiver<ems_core::message::BrokerdOrder>,
    mpsc::Receiver<ems_core::message::BrokerdCancel>,
) {
    let dir = tempfile::tempdir().unwrap();
    let feed_bus = Arc::new(FeedBus::new(dir.path().to_path_buf()));
    let adapter = MockAdapter::new("ib");
    adapter.push_quotes(quotes);
    let adapter: Arc<dyn BrokerAdapter> = Arc::new(adapter);

    let (order_tx, order_rx) = mpsc::channel(16);
    let (cancel_tx, cancel_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::channel(16);

    let handle = spawn_session(
        SessionConfig {
            broker: "ib".into(),
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

    (dir, handle, event_tx, order_rx, cancel_rx)
}

#[tokio::test]
async fn scenario_1_dark_buy_triggers() {
    let (_dir, mut handle, _event_tx, _order_rx, _cancel_rx) = open_session(vec![
        seed_quote(150.0),
        quote_with_ticks(144.9, vec![TickType::Ask { price: 144.9, size: 1.0 }]),
        quote_with_ticks(144.8, vec![TickType::Ask { price: 144.8, size: 1.0 }]),
    ])
    .await;

    handle
        .client_cmd_tx
        .send(order("o1", Action::Buy, 145.0, ExecMode::Dark))
        .await
        .unwrap();
    let submitted = handle.status_rx.recv().await.unwrap();
    assert_eq!(submitted.resp, Resp::DarkSubmitted);

    let triggered = handle.status_rx.recv().await.unwrap();
    assert_eq!(triggered.oid, "o1");
    assert_eq!(triggered.resp, Resp::DarkTriggered);
    assert_eq!(triggered.trigger_price, Some(144.9));

    // The second ask tick has nothing left to match against; no further
    // status should show up.
    let extra = tokio::time::timeout(std::time::Duration::from_millis(300), handle.status_rx.recv()).await;
    assert!(extra.is_err(), "dark entry already fired once, should not fire again");
}

#[tokio::test]
async fn scenario_2_cancel_before_ack() {
    let (_dir, mut handle, event_tx, _order_rx, mut cancel_rx) = open_session(vec![seed_quote(150.0)]).await;

    handle
        .client_cmd_tx
        .send(order("o2", Action::Sell, 140.0, ExecMode::Live))
        .await
        .unwrap();
    let submitted = handle.status_rx.recv().await.unwrap();
    assert_eq!(submitted.resp, Resp::BrokerSubmitted);

    handle
        .client_cmd_tx
        .send(order("o2", Action::Cancel, 0.0, ExecMode::Live))
        .await
        .unwrap();

    // No ack yet: the cancel must not reach the broker channel.
    let too_early = tokio::time::timeout(std::time::Duration::from_millis(200), cancel_rx.recv()).await;
    assert!(too_early.is_err(), "cancel must stay buffered until the ack arrives");

    event_tx
        .send(BrokerdEvent::Ack { oid: Some("o2".into()), reqid: "R1".into(), time_ns: 1 })
        .await
        .unwrap();

    let dispatched = cancel_rx.recv().await.unwrap();
    assert_eq!(dispatched.oid, "o2");
    assert_eq!(dispatched.reqid.as_deref(), Some("R1"));
}

#[tokio::test]
async fn scenario_3_alert_fires_once() {
    let (_dir, mut handle, _event_tx, _order_rx, _cancel_rx) = open_session(vec![
        seed_quote(99.0),
        quote_with_ticks(100.5, vec![TickType::Trade { price: 100.5, size: 1.0 }]),
        quote_with_ticks(101.0, vec![TickType::Trade { price: 101.0, size: 1.0 }]),
    ])
    .await;

    handle
        .client_cmd_tx
        .send(order("o3", Action::Alert, 100.0, ExecMode::Dark))
        .await
        .unwrap();
    let submitted = handle.status_rx.recv().await.unwrap();
    assert_eq!(submitted.resp, Resp::AlertSubmitted);

    let triggered = handle.status_rx.recv().await.unwrap();
    assert_eq!(triggered.resp, Resp::AlertTriggered);
    assert_eq!(triggered.trigger_price, Some(100.5));

    let extra = tokio::time::timeout(std::time::Duration::from_millis(300), handle.status_rx.recv()).await;
    assert!(extra.is_err(), "an alert fires at most once");
}

#[tokio::test]
async fn scenario_4_immediate_fire_is_rejected() {
    let (_dir, mut handle, _event_tx, _order_rx, _cancel_rx) = open_session(vec![seed_quote(100.0)]).await;

    handle
        .client_cmd_tx
        .send(order("o4", Action::Buy, 100.0, ExecMode::Dark))
        .await
        .unwrap();

    let status = handle.status_rx.recv().await.unwrap();
    assert_eq!(status.resp, Resp::Error);
}

#[tokio::test]
async fn scenario_5_fill_executes_exactly_once() {
    let (_dir, mut handle, event_tx, _order_rx, _cancel_rx) = open_session(vec![seed_quote(150.0)]).await;

    handle
        .client_cmd_tx
        .send(order("o5", Action::Buy, 140.0, ExecMode::Live))
        .await
        .unwrap();
    let submitted = handle.status_rx.recv().await.unwrap();
    assert_eq!(submitted.resp, Resp::BrokerSubmitted);

    event_tx
        .send(BrokerdEvent::Ack { oid: Some("o5".into()), reqid: "R5".into(), time_ns: 1 })
        .await
        .unwrap();

    event_tx
        .send(BrokerdEvent::Status {
            reqid: "R5".into(),
            oid: Some("o5".into()),
            status: BrokerStatus::Filled,
            filled: 5.0,
            remaining: 5.0,
            reason: None,
            time_ns: 2,
            paper_info: None,
        })
        .await
        .unwrap();
    event_tx
        .send(BrokerdEvent::Fill {
            reqid: "R5".into(),
            oid: Some("o5".into()),
            execid: "E5".into(),
            broker_time: 0.0,
            size: 5.0,
            price: 140.1,
            action: Action::Buy,
            time_ns: 3,
            paper_info: None,
        })
        .await
        .unwrap();
    event_tx
        .send(BrokerdEvent::Status {
            reqid: "R5".into(),
            oid: Some("o5".into()),
            status: BrokerStatus::Filled,
            filled: 10.0,
            remaining: 0.0,
            reason: None,
            time_ns: 4,
            paper_info: None,
        })
        .await
        .unwrap();

    // Both the partial status and the matching fill are non-terminal.
    let partial = handle.status_rx.recv().await.unwrap();
    assert_eq!(partial.resp, Resp::BrokerFilled);

    let fill = handle.status_rx.recv().await.unwrap();
    assert_eq!(fill.resp, Resp::BrokerFilled);

    // Only the remaining==0 terminal status resolves the oid.
    let executed = handle.status_rx.recv().await.unwrap();
    assert_eq!(executed.resp, Resp::BrokerExecuted);

    // The repeat terminal status is deduped -- no fourth status arrives.
    let extra = tokio::time::timeout(std::time::Duration::from_millis(300), handle.status_rx.recv()).await;
    assert!(extra.is_err(), "a fully-filled oid reports broker_executed exactly once");
}
