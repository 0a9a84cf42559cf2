//! Message sink port
//!
//! The outbound half of the message channel, as seen by use cases. The
//! infrastructure `MessageChannel` implements it over a byte stream; tests
//! substitute in-memory fakes.

use async_trait::async_trait;
use relay_domain::{EncodeError, Message};
use serde_json::Value;
use thiserror::Error;

/// Errors raised by message channel operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel not started")]
    NotStarted,

    #[error("Channel already started")]
    AlreadyStarted,

    #[error("Channel closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<EncodeError> for ChannelError {
    fn from(e: EncodeError) -> Self {
        ChannelError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        ChannelError::Io(e.to_string())
    }
}

/// Writes records to the engine.
///
/// Each call produces exactly one record on the wire, or fails without
/// writing anything.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Write a fully built message.
    async fn send_message(&self, message: Message) -> Result<(), ChannelError>;

    /// Write `{type, timestamp=now, data}`.
    async fn send(&self, kind: &str, data: Value) -> Result<(), ChannelError> {
        self.send_message(Message::new(kind, data)).await
    }
}
