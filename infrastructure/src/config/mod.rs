//! Configuration file loading for engine-relay
//!
//! This module handles file I/O and merging of configuration from multiple sources.
//! The priority order (highest to lowest):
//!
//! 1. `ENGINE_RELAY_*` environment variables
//! 2. `--config <path>` specified file
//! 3. Project root: `./relay.toml` or `./.relay.toml`
//! 4. Global: `$XDG_CONFIG_HOME/engine-relay/config.toml`
//! 5. Default values

mod file_config;
mod loader;

pub use file_config::{
    ConfigValidationError, FileAgentEntry, FileChannelConfig, FileConfig, FileDispatcherConfig,
    FileEngineConfig, FileHeartbeatConfig, FileLoggingConfig,
};
pub use loader::{ConfigLoader, ENV_PREFIX};
