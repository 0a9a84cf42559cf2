//! Line-delimited JSON transport.

pub mod message_channel;

pub use message_channel::{ChannelOptions, MessageChannel};
