//! Raw TOML configuration data types
//!
//! These structs represent the exact structure of the TOML config file.
//! Each section converts into the runtime settings type of the layer that
//! consumes it.

mod agents;
mod channel;
mod dispatcher;
mod engine;
mod heartbeat;

pub use agents::FileAgentEntry;
pub use channel::{FileChannelConfig, FileLoggingConfig};
pub use dispatcher::FileDispatcherConfig;
pub use engine::FileEngineConfig;
pub use heartbeat::FileHeartbeatConfig;

use relay_application::MAX_CONCURRENT_OPS_LIMIT;
use relay_domain::{AgentRole, AuthorityError, RingLayer};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigValidationError {
    #[error("dispatcher.max_concurrent_ops must be between 1 and {max}, got {value}")]
    MaxConcurrentOpsOutOfRange { value: usize, max: usize },

    #[error("{field} cannot be 0")]
    ZeroDuration { field: &'static str },

    #[error("agents[{index}]: id cannot be empty")]
    EmptyAgentId { index: usize },

    #[error("agent '{id}' is configured more than once")]
    DuplicateAgentId { id: String },

    #[error("agent '{id}': {source}")]
    InvalidAgent {
        id: String,
        #[source]
        source: AuthorityError,
    },

    #[error("more than one commander configured: {ids:?}")]
    MultipleCommanders { ids: Vec<String> },
}

/// Complete file configuration (raw TOML structure)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub engine: FileEngineConfig,
    pub dispatcher: FileDispatcherConfig,
    pub heartbeat: FileHeartbeatConfig,
    pub channel: FileChannelConfig,
    pub logging: FileLoggingConfig,
    /// Agents registered at startup
    pub agents: Vec<FileAgentEntry>,
}

impl FileConfig {
    /// Validate the entire configuration, returning every problem found.
    pub fn validate(&self) -> Vec<ConfigValidationError> {
        let mut issues = Vec::new();

        let max = self.dispatcher.max_concurrent_ops;
        if max == 0 || max > MAX_CONCURRENT_OPS_LIMIT {
            issues.push(ConfigValidationError::MaxConcurrentOpsOutOfRange {
                value: max,
                max: MAX_CONCURRENT_OPS_LIMIT,
            });
        }
        for (field, value) in [
            ("dispatcher.tick_interval_ms", self.dispatcher.tick_interval_ms),
            ("dispatcher.request_timeout_ms", self.dispatcher.request_timeout_ms),
            ("heartbeat.interval_ms", self.heartbeat.interval_ms),
        ] {
            if value == 0 {
                issues.push(ConfigValidationError::ZeroDuration { field });
            }
        }

        let mut seen = HashSet::new();
        let mut commanders = Vec::new();
        for (index, agent) in self.agents.iter().enumerate() {
            if agent.id.trim().is_empty() {
                issues.push(ConfigValidationError::EmptyAgentId { index });
                continue;
            }
            if !seen.insert(agent.id.as_str()) {
                issues.push(ConfigValidationError::DuplicateAgentId {
                    id: agent.id.clone(),
                });
            }
            match agent.resolve() {
                Ok((id, AgentRole::Commander, _)) => commanders.push(id),
                Ok(_) => {}
                Err(source) => issues.push(ConfigValidationError::InvalidAgent {
                    id: agent.id.clone(),
                    source,
                }),
            }
        }
        if commanders.len() > 1 {
            issues.push(ConfigValidationError::MultipleCommanders { ids: commanders });
        }

        issues
    }

    /// Configured agents with the commander first, otherwise in file order.
    ///
    /// Entries that fail to parse are skipped; `validate` reports them.
    pub fn startup_agents(&self) -> Vec<(String, AgentRole, RingLayer)> {
        let mut agents: Vec<_> = self
            .agents
            .iter()
            .filter_map(|a| a.resolve().ok())
            .collect();
        agents.sort_by_key(|(_, role, _)| *role != AgentRole::Commander);
        agents
    }
}
