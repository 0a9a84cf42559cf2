//! Tool response value objects.

use super::request::CorrelationId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Data of an inbound `mcp_response` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub request_id: CorrelationId,
    pub success: bool,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// Outcome of a completed tool request, as handed to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub success: bool,
    pub server: String,
    pub action: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    /// Served from the response cache without a round trip.
    #[serde(default)]
    pub from_cache: bool,
}

impl ToolResponse {
    /// Human-readable error text, if any.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| match e {
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| e.to_string()),
            other => other.to_string(),
        })
    }

    /// Copy marked as a cache hit.
    pub fn cached(&self) -> Self {
        Self {
            from_cache: true,
            ..self.clone()
        }
    }
}

impl From<ResponseEnvelope> for ToolResponse {
    fn from(envelope: ResponseEnvelope) -> Self {
        Self {
            success: envelope.success,
            server: envelope.server,
            action: envelope.action,
            data: envelope.data,
            error: envelope.error,
            from_cache: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_minimal_failure() {
        let envelope: ResponseEnvelope = serde_json::from_value(json!({
            "requestId": 3,
            "success": false,
            "error": "repository not found",
        }))
        .unwrap();
        assert_eq!(envelope.request_id, CorrelationId::new(3));
        let response = ToolResponse::from(envelope);
        assert!(!response.success);
        assert_eq!(response.data, Value::Null);
        assert_eq!(response.error_message().as_deref(), Some("repository not found"));
    }

    #[test]
    fn structured_error_message_is_extracted() {
        let response = ToolResponse {
            success: false,
            server: "git".into(),
            action: "commit".into(),
            data: Value::Null,
            error: Some(json!({"code": 128, "message": "nothing to commit"})),
            from_cache: false,
        };
        assert_eq!(response.error_message().as_deref(), Some("nothing to commit"));
        assert!(response.cached().from_cache);
    }
}
