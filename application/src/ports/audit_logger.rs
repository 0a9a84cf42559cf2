//! Port for structured audit logging.
//!
//! Defines the [`AuditLogger`] trait for recording dispatcher lifecycle
//! events (request sent, completed, failed, rejected, cache hits) to a
//! structured log.
//!
//! This is separate from `tracing`-based diagnostics: tracing handles
//! human-readable messages, while this port captures a machine-readable
//! trail (JSONL).

use serde_json::Value;

/// A structured audit event.
///
/// Each event has a type string and a JSON payload containing
/// event-specific fields. The timestamp is added by the logger.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    /// Event type identifier (e.g., "request_sent", "cache_hit").
    pub event_type: &'static str,
    /// JSON payload with event-specific data.
    pub payload: Value,
}

impl AuditEvent {
    pub fn new(event_type: &'static str, payload: Value) -> Self {
        Self {
            event_type,
            payload,
        }
    }
}

/// Port for logging audit events.
///
/// Implementations write each event as a single record (e.g., one JSONL line).
/// `log` is synchronous and non-fallible; write failures are the
/// implementation's concern and never reach the caller.
pub trait AuditLogger: Send + Sync {
    fn log(&self, event: AuditEvent);
}

/// No-op implementation for tests and when audit logging is disabled.
pub struct NoAuditLogger;

impl AuditLogger for NoAuditLogger {
    fn log(&self, _event: AuditEvent) {}
}
