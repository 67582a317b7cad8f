//! Wire messages exchanged between clients, the EMS, and brokers (§3).
//!
//! Every type here round-trips through `serde_json` for the
//! length-delimited socket transport in `ems-bins`, and is moved
//! directly (no serialization) over in-memory `tokio::mpsc` channels in
//! tests -- one set of definitions, two transports.

use serde::{Deserialize, Serialize};

/// A client order intent. Immutable once sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub oid: String,
    pub symbol: String,
    pub brokers: Vec<String>,
    pub action: Action,
    pub price: f64,
    pub size: f64,
    pub exec_mode: ExecMode,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Buy,
    Sell,
    Alert,
    Cancel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    Live,
    Dark,
    Paper,
}

/// EMS response values a client may see, per the error-handling table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Resp {
    AlertSubmitted,
    AlertTriggered,
    DarkSubmitted,
    DarkTriggered,
    DarkCancelled,
    BrokerSubmitted,
    BrokerCancelled,
    BrokerExecuted,
    BrokerFilled,
    Error,
}

/// EMS → client status update. Emitted repeatedly across an order's life.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Status {
    pub oid: String,
    pub resp: Resp,
    pub time_ns: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_reqid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
}

impl Status {
    pub fn new(oid: impl Into<String>, resp: Resp, time_ns: i64) -> Self {
        Self {
            oid: oid.into(),
            resp,
            time_ns,
            trigger_price: None,
            broker_reqid: None,
            broker_details: None,
            symbol: None,
        }
    }

    pub fn with_trigger_price(mut self, price: f64) -> Self {
        self.trigger_price = Some(price);
        self
    }

    pub fn with_broker_reqid(mut self, reqid: impl Into<String>) -> Self {
        self.broker_reqid = Some(reqid.into());
        self
    }

    pub fn with_broker_details(mut self, details: serde_json::Value) -> Self {
        self.broker_details = Some(details);
        self
    }
}

/// EMS → broker new-order / modify request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerdOrder {
    pub oid: String,
    /// `None` on first submit; set on modify.
    pub reqid: Option<String>,
    pub time_ns: i64,
    pub symbol: String,
    pub action: Action,
    pub price: f64,
    pub size: f64,
}

/// EMS → broker cancel request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerdCancel {
    pub oid: String,
    pub reqid: Option<String>,
    pub time_ns: i64,
}

/// A live-flow entry in the dark book: whatever we most recently sent to
/// (or were told by) the broker for a given `oid`, so C6 can resume the
/// conversation (e.g. fill in a buffered cancel's `reqid` on ack).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LiveFlowEntry {
    Order(BrokerdOrder),
    Cancel(BrokerdCancel),
    Ack { oid: String, reqid: String, time_ns: i64 },
}

impl LiveFlowEntry {
    pub fn oid(&self) -> &str {
        match self {
            LiveFlowEntry::Order(o) => &o.oid,
            LiveFlowEntry::Cancel(c) => &c.oid,
            LiveFlowEntry::Ack { oid, .. } => oid,
        }
    }

    pub fn reqid(&self) -> Option<&str> {
        match self {
            LiveFlowEntry::Order(o) => o.reqid.as_deref(),
            LiveFlowEntry::Cancel(c) => c.reqid.as_deref(),
            LiveFlowEntry::Ack { reqid, .. } => Some(reqid),
        }
    }
}

/// Broker-native order status, before EMS relabeling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BrokerStatus {
    PreSubmitted,
    Submitted,
    Cancelled,
    Filled,
    Inactive,
}

/// Paper-engine breadcrumb carried in broker events so the translator can
/// recover `oid` before the ack/oid bimap is populated (§4.9).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaperInfo {
    pub oid: String,
}

/// Broker → EMS event, a tagged union discriminated on `name`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum BrokerdEvent {
    Ack {
        oid: Option<String>,
        reqid: String,
        time_ns: i64,
    },
    Status {
        reqid: String,
        oid: Option<String>,
        status: BrokerStatus,
        filled: f64,
        remaining: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        time_ns: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        paper_info: Option<PaperInfo>,
    },
    Fill {
        reqid: String,
        oid: Option<String>,
        execid: String,
        broker_time: f64,
        size: f64,
        price: f64,
        action: Action,
        time_ns: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        paper_info: Option<PaperInfo>,
    },
    Error {
        reqid: Option<String>,
        oid: Option<String>,
        reason: String,
        time_ns: i64,
    },
    Position {
        broker: String,
        account: String,
        symbol: String,
        size: f64,
        avg_price: f64,
        currency: String,
    },
}

impl BrokerdEvent {
    pub fn reqid(&self) -> Option<&str> {
        match self {
            BrokerdEvent::Ack { reqid, .. } => Some(reqid),
            BrokerdEvent::Status { reqid, .. } => Some(reqid),
            BrokerdEvent::Fill { reqid, .. } => Some(reqid),
            BrokerdEvent::Error { reqid, .. } => reqid.as_deref(),
            BrokerdEvent::Position { .. } => None,
        }
    }

    /// The tag name, matching the wire discriminant (`ack`, `status`, ...).
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerdEvent::Ack { .. } => "ack",
            BrokerdEvent::Status { .. } => "status",
            BrokerdEvent::Fill { .. } => "fill",
            BrokerdEvent::Error { .. } => "error",
            BrokerdEvent::Position { .. } => "position",
        }
    }

    pub fn oid(&self) -> Option<&str> {
        match self {
            BrokerdEvent::Ack { oid, .. } => oid.as_deref(),
            BrokerdEvent::Status { oid, paper_info, .. } => {
                oid.as_deref().or(paper_info.as_ref().map(|p| p.oid.as_str()))
            }
            BrokerdEvent::Fill { oid, paper_info, .. } => {
                oid.as_deref().or(paper_info.as_ref().map(|p| p.oid.as_str()))
            }
            BrokerdEvent::Error { oid, .. } => oid.as_deref(),
            BrokerdEvent::Position { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_round_trips() {
        let order = Order {
            oid: "o1".into(),
            symbol: "aapl".into(),
            brokers: vec!["ib".into()],
            action: Action::Buy,
            price: 145.0,
            size: 10.0,
            exec_mode: ExecMode::Dark,
        };
        let json = serde_json::to_string(&order).unwrap();
        let back: Order = serde_json::from_str(&json).unwrap();
        assert_eq!(order, back);
    }

    #[test]
    fn brokerd_event_tag_round_trips() {
        let event = BrokerdEvent::Fill {
            reqid: "R1".into(),
            oid: Some("o1".into()),
            execid: "E1".into(),
            broker_time: 123.0,
            size: 5.0,
            price: 144.9,
            action: Action::Buy,
            time_ns: 42,
            paper_info: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"name\":\"fill\""));
        let back: BrokerdEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn oid_resolution_falls_back_to_paper_info() {
        let event = BrokerdEvent::Status {
            reqid: "R2".into(),
            oid: None,
            status: BrokerStatus::Filled,
            filled: 5.0,
            remaining: 0.0,
            reason: None,
            time_ns: 1,
            paper_info: Some(PaperInfo { oid: "o2".into() }),
        };
        assert_eq!(event.oid(), Some("o2"));
    }

    #[test]
    fn status_builder_omits_none_fields() {
        let status = Status::new("o1", Resp::DarkSubmitted, 1);
        let json = serde_json::to_string(&status).unwrap();
        assert!(!json.contains("trigger_price"));
    }
}
