//! Authority registry.
//!
//! [`AuthorityGate`] owns every registered agent and the operation log. All
//! mutations go through it so the single-commander rule is enforced in one
//! place and every change leaves an audit entry.

use super::entities::{AgentAuthority, AuthorityOperation, OperationLog, OperationLogEntry};
use super::error::AuthorityError;
use super::role::{AgentRole, RingLayer};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Default)]
pub struct AuthorityGate {
    agents: HashMap<String, AgentAuthority>,
    /// Registration order, for stable listings.
    order: Vec<String>,
    commander_id: Option<String>,
    log: OperationLog,
}

impl AuthorityGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate whose operation log retains at most `capacity` entries.
    pub fn with_log_capacity(capacity: usize) -> Self {
        Self {
            log: OperationLog::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Register (or re-register) an agent with the default permissions of
    /// `role`.
    ///
    /// Registering a second commander fails and leaves the registry untouched.
    /// Re-registering the current commander under a different role releases
    /// the commander slot.
    pub fn register_agent(
        &mut self,
        agent_id: &str,
        role: AgentRole,
        ring_layer: RingLayer,
    ) -> Result<AgentAuthority, AuthorityError> {
        if role == AgentRole::Commander
            && let Some(existing) = &self.commander_id
            && existing != agent_id
        {
            return Err(AuthorityError::DuplicateCommander {
                existing: existing.clone(),
            });
        }

        let authority = AgentAuthority::new(agent_id, role, ring_layer);
        if self
            .agents
            .insert(agent_id.to_string(), authority.clone())
            .is_none()
        {
            self.order.push(agent_id.to_string());
        }

        if role == AgentRole::Commander {
            self.commander_id = Some(agent_id.to_string());
        } else if self.commander_id.as_deref() == Some(agent_id) {
            self.commander_id = None;
        }

        debug!(agent_id, role = %role, ring_layer = %ring_layer, "Agent registered");
        self.log.append(
            agent_id,
            AuthorityOperation::Register,
            json!({ "role": role, "ringLayer": ring_layer }),
        );
        Ok(authority)
    }

    /// Move `target_id` to `layer`. Commander only.
    pub fn assign_ring_layer(
        &mut self,
        commander_id: &str,
        target_id: &str,
        layer: RingLayer,
    ) -> Result<AgentAuthority, AuthorityError> {
        self.require_commander(commander_id, "assign ring layers")?;
        let target = self
            .agents
            .get_mut(target_id)
            .ok_or_else(|| AuthorityError::AgentNotFound(target_id.to_string()))?;

        let previous = target.ring_layer;
        target.ring_layer = layer;
        target.last_active = Utc::now();
        let updated = target.clone();

        debug!(
            commander_id,
            target_id,
            previous = %previous,
            layer = %layer,
            "Ring layer assigned"
        );
        self.log.append(
            commander_id,
            AuthorityOperation::AssignRingLayer,
            json!({
                "targetAgentId": target_id,
                "previousLayer": previous,
                "newLayer": layer,
            }),
        );
        Ok(updated)
    }

    /// Add `permission` to `target_id`. Commander only; idempotent.
    pub fn grant_permission(
        &mut self,
        commander_id: &str,
        target_id: &str,
        permission: &str,
    ) -> Result<AgentAuthority, AuthorityError> {
        self.require_commander(commander_id, "grant permissions")?;
        let target = self
            .agents
            .get_mut(target_id)
            .ok_or_else(|| AuthorityError::AgentNotFound(target_id.to_string()))?;

        target.permissions.insert(permission.to_string());
        target.last_active = Utc::now();
        let updated = target.clone();

        debug!(commander_id, target_id, permission, "Permission granted");
        self.log.append(
            commander_id,
            AuthorityOperation::GrantPermission,
            json!({ "targetAgentId": target_id, "permission": permission }),
        );
        Ok(updated)
    }

    /// True iff the agent exists, its layer permits `required`, and it holds
    /// `permission` when one is given. Unknown agents are simply unauthorized.
    pub fn check_authority(
        &self,
        agent_id: &str,
        required: RingLayer,
        permission: Option<&str>,
    ) -> bool {
        let Some(agent) = self.agents.get(agent_id) else {
            return false;
        };
        agent.can_access(required) && permission.is_none_or(|p| agent.has_permission(p))
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentAuthority> {
        self.agents.get(agent_id)
    }

    pub fn commander(&self) -> Option<&AgentAuthority> {
        self.commander_id
            .as_deref()
            .and_then(|id| self.agents.get(id))
    }

    /// All agents in registration order.
    pub fn agents(&self) -> Vec<&AgentAuthority> {
        self.order
            .iter()
            .filter_map(|id| self.agents.get(id))
            .collect()
    }

    pub fn agents_by_role(&self, role: AgentRole) -> Vec<&AgentAuthority> {
        self.agents().into_iter().filter(|a| a.role == role).collect()
    }

    pub fn agents_by_ring_layer(&self, layer: RingLayer) -> Vec<&AgentAuthority> {
        self.agents()
            .into_iter()
            .filter(|a| a.ring_layer == layer)
            .collect()
    }

    /// The most recent `limit` log entries, oldest first.
    pub fn operation_log(&self, limit: usize) -> Vec<OperationLogEntry> {
        self.log.recent(limit)
    }

    pub fn operation_log_len(&self) -> usize {
        self.log.len()
    }

    fn require_commander(
        &self,
        caller: &str,
        operation: &'static str,
    ) -> Result<(), AuthorityError> {
        let is_commander = self
            .agents
            .get(caller)
            .is_some_and(AgentAuthority::is_commander);
        if is_commander {
            Ok(())
        } else {
            Err(AuthorityError::NotCommander {
                caller: caller.to_string(),
                operation,
            })
        }
    }
}
