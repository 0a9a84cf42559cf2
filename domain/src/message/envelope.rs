//! The wire-level message envelope.
//!
//! Every record crossing the process boundary is a single JSON object of the
//! shape `{"type": ..., "timestamp": ..., "data": ...}` terminated by `\n`.

use super::kind::MessageKind;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Record delimiter on the wire.
pub const RECORD_DELIMITER: u8 = b'\n';

/// Errors raised while turning a [`Message`] into a wire record.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("payload is not serializable: {0}")]
    Json(#[from] serde_json::Error),

    #[error("encoded record contains a raw record delimiter")]
    ContainsDelimiter,
}

/// Errors raised while parsing a wire record into a [`Message`].
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("invalid record: {0}")]
    Json(#[from] serde_json::Error),
}

/// A single message exchanged with the engine process.
///
/// `timestamp` is kept as the raw ISO-8601 string seen on the wire so that
/// records from peers using a different precision round-trip untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub data: Value,
}

impl Message {
    /// Create a message stamped with the current UTC time.
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            timestamp: now_timestamp(),
            data,
        }
    }

    /// Create a message from any serializable payload.
    pub fn from_payload<T: Serialize + ?Sized>(
        kind: impl Into<String>,
        data: &T,
    ) -> Result<Self, EncodeError> {
        Ok(Self::new(kind, serde_json::to_value(data)?))
    }

    /// Classified message type.
    pub fn message_kind(&self) -> MessageKind {
        MessageKind::parse(&self.kind)
    }

    /// Encode as a single newline-terminated record.
    pub fn encode_line(&self) -> Result<String, EncodeError> {
        let mut line = serde_json::to_string(self)?;
        if line.as_bytes().contains(&RECORD_DELIMITER) {
            return Err(EncodeError::ContainsDelimiter);
        }
        line.push(RECORD_DELIMITER as char);
        Ok(line)
    }

    /// Parse one record (without its trailing delimiter).
    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(line)?)
    }

    /// Deserialize `data` into a typed payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

/// Current UTC time as RFC 3339 with millisecond precision.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
