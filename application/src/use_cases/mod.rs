//! Use cases for the application layer

pub mod dispatch;
pub mod heartbeat;
