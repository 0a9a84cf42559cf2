//! Tool request value objects.

use crate::authority::RingLayer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Correlation identifier embedded in every outbound tool request.
///
/// Allocated by the dispatcher from a private counter; never reused within a
/// dispatcher's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Deterministic cache key over `(backend, action, payload)`.
///
/// Two requests share a key only when their serialized payloads are
/// byte-identical. Object keys are serialized in sorted order, so key
/// insertion order does not matter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(backend: &str, action: &str, payload: &Value) -> Self {
        // A JSON array keeps the three parts unambiguous even when they
        // contain separators. Serializing a `Value` cannot fail.
        let encoded = serde_json::to_string(&(backend, action, payload)).unwrap_or_default();
        Self(encoded)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Lifecycle of a dispatched request.
///
/// ```text
/// Queued ──> Admitted ──> Completed             (cache hit)
///                 ├────> Failed                (transport gone)
///                 └────> InFlight ──> Completed | Failed
///
/// Rejected                                     (refused at submit)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Queued,
    Admitted,
    InFlight,
    Completed,
    Failed,
    Rejected,
}

impl RequestState {
    /// Completed, failed or rejected requests never change state again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Rejected)
    }
}

/// A caller's request for a tool back-end operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRequest {
    pub agent_id: String,
    pub backend: String,
    pub action: String,
    pub payload: Value,
    pub required_layer: RingLayer,
    pub permission: Option<String>,
}

impl ToolRequest {
    /// Build a request whose required layer is derived from the back-end.
    pub fn new(
        agent_id: impl Into<String>,
        backend: impl Into<String>,
        action: impl Into<String>,
        payload: Value,
    ) -> Self {
        let backend = backend.into();
        let required_layer = RingLayer::for_backend(&backend);
        Self {
            agent_id: agent_id.into(),
            backend,
            action: action.into(),
            payload,
            required_layer,
            permission: None,
        }
    }

    pub fn with_required_layer(mut self, layer: RingLayer) -> Self {
        self.required_layer = layer;
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permission = Some(permission.into());
        self
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.backend, &self.action, &self.payload)
    }

    /// Wire payload for the `mcp_request` message.
    pub fn to_envelope(&self, request_id: CorrelationId) -> RequestEnvelope {
        RequestEnvelope {
            request_id,
            server: self.backend.clone(),
            action: self.action.clone(),
            data: self.payload.clone(),
        }
    }
}

/// Data of an outbound `mcp_request` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub request_id: CorrelationId,
    pub server: String,
    pub action: String,
    #[serde(default)]
    pub data: Value,
}
