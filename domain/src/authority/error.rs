//! Authority errors

use thiserror::Error;

/// Errors raised by [`AuthorityGate`](super::gate::AuthorityGate) mutations
/// and by parsing authority configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthorityError {
    #[error("Commander already exists ({existing}). Only one commander allowed.")]
    DuplicateCommander { existing: String },

    #[error("Only the commander can {operation} (caller: {caller})")]
    NotCommander {
        caller: String,
        operation: &'static str,
    },

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Invalid ring layer: {0} (expected 0, 1 or 2)")]
    InvalidRingLayer(u8),

    #[error("Invalid agent role: {0}")]
    InvalidRole(String),
}
