//! Engine launch configuration from TOML (`[engine]` section)

use crate::engine::EngineSettings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw engine configuration from TOML
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileEngineConfig {
    /// Engine executable. Required to run the relay.
    pub path: Option<PathBuf>,
    /// Project opened by the engine
    pub project_path: Option<PathBuf>,
    /// Run headless
    pub batch_mode: bool,
    /// Static method that starts the engine side of the bridge
    pub entry_method: String,
    /// Extra command-line arguments, appended last
    pub args: Vec<String>,
}

impl Default for FileEngineConfig {
    fn default() -> Self {
        let defaults = EngineSettings::default();
        Self {
            path: None,
            project_path: None,
            batch_mode: defaults.batch_mode,
            entry_method: defaults.entry_method,
            args: Vec::new(),
        }
    }
}

impl FileEngineConfig {
    pub fn to_settings(&self) -> EngineSettings {
        EngineSettings {
            executable: self.path.clone().unwrap_or_default(),
            project_path: self.project_path.clone(),
            batch_mode: self.batch_mode,
            entry_method: self.entry_method.clone(),
            extra_args: self.args.clone(),
        }
    }
}
