//! Authority entities: registered agents and the audit trail.

use super::role::{AgentRole, RingLayer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};

/// Maximum number of operation log entries retained.
pub const OPERATION_LOG_CAPACITY: usize = 10_000;

/// Default number of entries returned by log queries.
pub const DEFAULT_LOG_QUERY_LIMIT: usize = 100;

/// A registered agent and its current authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentAuthority {
    pub agent_id: String,
    pub role: AgentRole,
    pub ring_layer: RingLayer,
    pub permissions: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl AgentAuthority {
    /// Create an agent with the default permissions of its role.
    pub fn new(agent_id: impl Into<String>, role: AgentRole, ring_layer: RingLayer) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.into(),
            role,
            ring_layer,
            permissions: role
                .default_permissions()
                .iter()
                .map(|p| p.to_string())
                .collect(),
            created_at: now,
            last_active: now,
        }
    }

    pub fn can_access(&self, required: RingLayer) -> bool {
        self.ring_layer.permits(required)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.role == AgentRole::Commander || self.permissions.contains(permission)
    }

    pub fn is_commander(&self) -> bool {
        self.role == AgentRole::Commander
    }
}

/// Kind of audited authority operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthorityOperation {
    Register,
    AssignRingLayer,
    GrantPermission,
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationLogEntry {
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub operation: AuthorityOperation,
    pub details: Value,
}

/// Append-only audit trail with oldest-first eviction.
#[derive(Debug, Clone)]
pub struct OperationLog {
    entries: VecDeque<OperationLogEntry>,
    capacity: usize,
}

impl Default for OperationLog {
    fn default() -> Self {
        Self::with_capacity(OPERATION_LOG_CAPACITY)
    }
}

impl OperationLog {
    /// A log retaining at most `capacity` entries (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::new(),
            capacity,
        }
    }

    pub fn append(&mut self, agent_id: &str, operation: AuthorityOperation, details: Value) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(OperationLogEntry {
            timestamp: Utc::now(),
            agent_id: agent_id.to_string(),
            operation,
            details,
        });
    }

    /// The most recent `limit` entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<OperationLogEntry> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_permissions_follow_role() {
        let op = AgentAuthority::new("op", AgentRole::Operator, RingLayer::Layer1);
        assert!(op.has_permission("mcp:layer2"));
        assert!(!op.has_permission("execute"));

        let cmd = AgentAuthority::new("cmd", AgentRole::Commander, RingLayer::Layer0);
        assert!(cmd.permissions.contains("*"));
        assert!(cmd.has_permission("anything:at-all"));
    }

    #[test]
    fn log_evicts_oldest_entries() {
        let mut log = OperationLog::with_capacity(3);
        for i in 0..5 {
            log.append(&format!("agent-{}", i), AuthorityOperation::Register, json!({}));
        }
        assert_eq!(log.len(), 3);
        let ids: Vec<_> = log.recent(10).into_iter().map(|e| e.agent_id).collect();
        assert_eq!(ids, vec!["agent-2", "agent-3", "agent-4"]);
    }

    #[test]
    fn recent_returns_tail_in_order() {
        let mut log = OperationLog::default();
        for i in 0..4 {
            log.append(&i.to_string(), AuthorityOperation::GrantPermission, json!(i));
        }
        let tail: Vec<_> = log.recent(2).into_iter().map(|e| e.agent_id).collect();
        assert_eq!(tail, vec!["2", "3"]);
        assert_eq!(log.capacity(), OPERATION_LOG_CAPACITY);
    }
}
