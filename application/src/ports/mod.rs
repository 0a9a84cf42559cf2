//! Ports (interfaces) for the application layer
//!
//! Ports define the boundaries between the application layer and the
//! infrastructure layer. Adapters in the infrastructure layer implement them.

pub mod audit_logger;
pub mod channel_event;
pub mod message_sink;
