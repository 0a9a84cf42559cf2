//! Domain layer for engine-relay
//!
//! This crate contains the wire model, framing and authority rules. It has no
//! dependencies on I/O, async runtimes or infrastructure concerns.
//!
//! # Core Concepts
//!
//! ## Messages
//!
//! Every record exchanged with the engine is a single JSON object
//! `{type, timestamp, data}` terminated by a newline:
//!
//! - **Framing**: [`LineFramer`] turns arbitrary byte chunks into records
//! - **Kinds**: [`MessageKind`] classifies the `type` field
//!
//! ## Authority
//!
//! Agents are registered with a role and a ring layer (0 = most privileged).
//! [`AuthorityGate`] enforces the single-commander rule and answers
//! `check_authority` for the dispatcher.
//!
//! ## Dispatch
//!
//! [`ToolRequest`] / [`ToolResponse`] and the correlation and cache keys used
//! to multiplex tool calls over the message channel.

pub mod authority;
pub mod dispatch;
pub mod message;

// Re-export commonly used types
pub use authority::{
    AgentAuthority, AgentRole, AuthorityError, AuthorityGate, AuthorityOperation,
    OperationLogEntry, RingLayer,
};
pub use dispatch::{
    CacheKey, CorrelationId, RequestEnvelope, RequestState, ResponseEnvelope, ToolRequest,
    ToolResponse,
};
pub use message::{
    envelope::{DecodeError, EncodeError, Message, RECORD_DELIMITER, now_timestamp},
    framer::{FrameOutcome, LineFramer, MAX_LINE_BYTES},
    kind::{ErrorData, HeartbeatData, MessageKind, error_codes},
};
