//! Error types for the execution management session.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmsError {
    #[error("unknown order id: {oid}")]
    UnknownOrder { oid: String },

    #[error("no dark book entry for broker {broker}")]
    NoDarkBook { broker: String },

    #[error("broker adapter does not support trades dialogue: {broker}")]
    NoTradesDialogue { broker: String },

    #[error("invalid execution mode: {0}")]
    InvalidExecMode(String),

    #[error("invalid order command: {0}")]
    InvalidCommand(String),

    #[error("feed bus error: {0}")]
    FeedBus(#[from] feed_bus::error::FeedBusError),

    #[error("session actor channel closed")]
    ChannelClosed,

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, EmsError>;
