//! Authority domain
//!
//! Roles, ring layers, the agent registry and its audit log.

pub mod entities;
pub mod error;
pub mod gate;
pub mod role;

pub use entities::{
    AgentAuthority, AuthorityOperation, DEFAULT_LOG_QUERY_LIMIT, OPERATION_LOG_CAPACITY,
    OperationLog, OperationLogEntry,
};
pub use error::AuthorityError;
pub use gate::AuthorityGate;
pub use role::{AgentRole, RingLayer, WILDCARD_PERMISSION};
