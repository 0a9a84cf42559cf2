//! Channel and logging configuration from TOML (`[channel]`, `[logging]`)

use crate::channel::ChannelOptions;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw channel configuration from TOML
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileChannelConfig {
    /// Reply `error` to unparseable lines and records of unknown type
    pub strict_types: bool,
    /// Longest accepted inbound line, in bytes
    pub max_line_bytes: usize,
}

impl Default for FileChannelConfig {
    fn default() -> Self {
        let defaults = ChannelOptions::default();
        Self {
            strict_types: defaults.strict_types,
            max_line_bytes: defaults.max_line_bytes,
        }
    }
}

impl FileChannelConfig {
    pub fn to_options(&self) -> ChannelOptions {
        ChannelOptions {
            strict_types: self.strict_types,
            max_line_bytes: self.max_line_bytes,
        }
    }
}

/// Raw logging configuration from TOML
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    /// JSONL audit trail of dispatcher activity
    pub audit_file: Option<PathBuf>,
    /// Directory for daily rolling diagnostic logs
    pub directory: Option<PathBuf>,
}
