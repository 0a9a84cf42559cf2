//! Inbound channel events.

use relay_domain::Message;
use tokio::sync::mpsc;

/// Something observed on the inbound side of the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A well-formed record.
    Message(Message),
    /// A line that could not be parsed. The channel stays open.
    ParseError { line: String, reason: String },
    /// A record the relay has no handler for. An `error` reply was sent.
    ProtocolError {
        kind: String,
        error_code: String,
        message: String,
    },
    /// A diagnostic line from the engine's stderr.
    EngineLog(String),
    /// The transport is gone. No further records will arrive.
    Disconnected { reason: String },
}

impl ChannelEvent {
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected { .. })
    }
}

/// Receiving end of an event subscription.
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// Receive the next event, or wait forever once there is no receiver.
///
/// Lets `tokio::select!` loops treat a detached or exhausted subscription as
/// a branch that never fires. Callers reset the option to `None` after it
/// yields `None`.
pub async fn next_event(events: &mut Option<ChannelEvents>) -> Option<ChannelEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
