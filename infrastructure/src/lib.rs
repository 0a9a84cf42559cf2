//! Infrastructure layer for engine-relay
//!
//! This crate contains adapters that implement the ports defined
//! in the application layer: the line-delimited JSON channel over the
//! engine's stdio, the engine process itself, the JSONL audit trail, and
//! configuration file loading.

pub mod channel;
pub mod config;
pub mod engine;
pub mod logging;

// Re-export commonly used types
pub use channel::{ChannelOptions, MessageChannel};
pub use config::{ConfigLoader, ConfigValidationError, FileConfig};
pub use engine::{EngineError, EngineProcess, EngineSettings};
pub use logging::JsonlAuditLogger;
