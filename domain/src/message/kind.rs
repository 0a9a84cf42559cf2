//! Message kinds and canonical control payloads.
//!
//! Inbound records are classified into explicit [`MessageKind`] variants
//! instead of being looked up by string at every call site. Anything the
//! relay does not recognise lands in [`MessageKind::Other`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable error codes carried in `error` messages.
pub mod error_codes {
    /// The peer sent a record whose `type` has no handler.
    pub const UNKNOWN_MESSAGE_TYPE: &str = "UNKNOWN_MESSAGE_TYPE";
    /// The peer sent a line that is not a valid record.
    pub const PARSE_ERROR: &str = "PARSE_ERROR";
}

/// Classified message type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    // Control
    Ready,
    Heartbeat,
    Error,
    Shutdown,
    ShutdownAck,
    // Engine domain requests and replies
    Initialize,
    SceneLoaded,
    Update,
    UpdateAck,
    Render,
    RenderComplete,
    Camera,
    CameraUpdated,
    PostProcessing,
    PostProcessingUpdated,
    // Tool dispatch
    ToolRequest,
    ToolResponse,
    /// Not part of the canonical protocol.
    Other(String),
}

impl MessageKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "ready" => Self::Ready,
            "heartbeat" => Self::Heartbeat,
            "error" => Self::Error,
            "shutdown" => Self::Shutdown,
            "shutdown-ack" => Self::ShutdownAck,
            "initialize" => Self::Initialize,
            "scene-loaded" => Self::SceneLoaded,
            "update" => Self::Update,
            "update-ack" => Self::UpdateAck,
            "render" => Self::Render,
            "render-complete" => Self::RenderComplete,
            "camera" => Self::Camera,
            "camera-updated" => Self::CameraUpdated,
            "postprocessing" => Self::PostProcessing,
            "postprocessing-updated" => Self::PostProcessingUpdated,
            "mcp_request" => Self::ToolRequest,
            "mcp_response" => Self::ToolResponse,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Ready => "ready",
            Self::Heartbeat => "heartbeat",
            Self::Error => "error",
            Self::Shutdown => "shutdown",
            Self::ShutdownAck => "shutdown-ack",
            Self::Initialize => "initialize",
            Self::SceneLoaded => "scene-loaded",
            Self::Update => "update",
            Self::UpdateAck => "update-ack",
            Self::Render => "render",
            Self::RenderComplete => "render-complete",
            Self::Camera => "camera",
            Self::CameraUpdated => "camera-updated",
            Self::PostProcessing => "postprocessing",
            Self::PostProcessingUpdated => "postprocessing-updated",
            Self::ToolRequest => "mcp_request",
            Self::ToolResponse => "mcp_response",
            Self::Other(s) => s,
        }
    }

    pub fn is_canonical(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

/// Payload of an `error` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorData {
    pub error_code: String,
    pub message: String,
    #[serde(default)]
    pub stack_trace: String,
}

impl ErrorData {
    pub fn new(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            message: message.into(),
            stack_trace: String::new(),
        }
    }

    /// Reply for a record whose type has no handler.
    pub fn unknown_type(kind: &str) -> Self {
        Self::new(
            error_codes::UNKNOWN_MESSAGE_TYPE,
            format!("Unknown message type: {}", kind),
        )
    }

    /// Reply for a line that is not a valid record.
    pub fn parse_error(reason: &str) -> Self {
        Self::new(
            error_codes::PARSE_ERROR,
            format!("Failed to parse message: {}", reason),
        )
    }
}

/// Payload of a `heartbeat` message sent by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatData {
    pub sequence: u64,
    pub uptime_ms: u64,
    pub pid: u32,
    pub source: String,
}
