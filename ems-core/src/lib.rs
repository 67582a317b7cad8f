//! Execution management session: dark book, trigger loop, broker-event
//! translator, and client command processor, wired together per session
//! in [`session`].

pub mod client_cmds;
pub mod config;
pub mod dark_book;
pub mod error;
pub mod message;
pub mod metrics;
pub mod mock_adapter;
pub mod paper;
pub mod session;
pub mod translator;
pub mod trigger;

pub mod prelude {
    pub use crate::config::EmsConfig;
    pub use crate::dark_book::{DarkBookActor, DarkBookHandle};
    pub use crate::error::{EmsError, Result};
    pub use crate::metrics::EmsMetrics;
    pub use crate::message::{
        Action, BrokerdCancel, BrokerdEvent, BrokerdOrder, ExecMode, LiveFlowEntry, Order, Resp, Status,
    };
    pub use crate::session::{spawn_session, SessionConfig, SessionHandle};
}
