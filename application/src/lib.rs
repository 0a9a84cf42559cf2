//! Application layer for engine-relay
//!
//! This crate contains use cases, port definitions, and application configuration.
//! It depends only on the domain layer.

pub mod config;
pub mod ports;
pub mod use_cases;

// Re-export commonly used types
pub use config::{DispatcherSettings, HeartbeatSettings, MAX_CONCURRENT_OPS_LIMIT};
pub use ports::{
    audit_logger::{AuditEvent, AuditLogger, NoAuditLogger},
    channel_event::{ChannelEvent, ChannelEvents, next_event},
    message_sink::{ChannelError, MessageSink},
};
pub use use_cases::dispatch::{
    DispatchError, DispatchResult, DispatcherStats, RequestDispatcher, ResponseTicket,
};
pub use use_cases::heartbeat::HeartbeatMonitor;
