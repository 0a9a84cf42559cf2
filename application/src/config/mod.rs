//! Application-level configuration.
//!
//! This module provides configuration types that control how use cases behave:
//!
//! - [`DispatcherSettings`]: concurrency ceiling, batching, caching, timeouts
//! - [`HeartbeatSettings`]: heartbeat period and source tag

pub mod dispatcher_settings;
pub mod heartbeat_settings;

pub use dispatcher_settings::{DispatcherSettings, MAX_CONCURRENT_OPS_LIMIT};
pub use heartbeat_settings::HeartbeatSettings;
