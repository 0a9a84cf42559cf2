//! Wire messages exchanged with the engine process.
//!
//! - [`envelope::Message`]: the `{type, timestamp, data}` record
//! - [`kind::MessageKind`]: classified message types and control payloads
//! - [`framer::LineFramer`]: chunk-invariant newline framing

pub mod envelope;
pub mod framer;
pub mod kind;
