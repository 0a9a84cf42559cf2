//! Heartbeat configuration from TOML (`[heartbeat]` section)

use relay_application::HeartbeatSettings;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Raw heartbeat configuration from TOML
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileHeartbeatConfig {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for FileHeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1000,
        }
    }
}

impl FileHeartbeatConfig {
    pub fn to_settings(&self) -> HeartbeatSettings {
        HeartbeatSettings::default()
            .with_enabled(self.enabled)
            .with_interval(Duration::from_millis(self.interval_ms))
    }
}
