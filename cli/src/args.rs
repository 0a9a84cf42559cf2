//! CLI argument definitions

use clap::Parser;
use relay_infrastructure::FileConfig;
use std::path::PathBuf;

/// CLI arguments for engine-relay
#[derive(Parser, Debug)]
#[command(name = "engine-relay")]
#[command(author, version, about = "Relay between agents and a rendering engine over stdio")]
#[command(long_about = r#"
engine-relay launches a rendering engine as a child process and talks to it
with newline-delimited JSON over the engine's stdin/stdout.

Configured agents are registered with the authority gate at startup
(commander first). Tool requests are dispatched to the engine under a
concurrency ceiling, and heartbeats flow in both directions.

Configuration files are loaded from (in priority order):
1. ENGINE_RELAY_* environment variables (e.g. ENGINE_RELAY_DISPATCHER__MAX_CONCURRENT_OPS=3)
2. --config <path>     Explicit config file
3. ./relay.toml        Project-level config
4. ~/.config/engine-relay/config.toml   Global config

Example:
  engine-relay --engine /opt/Unity/Editor/Unity --project ./scene
  engine-relay --config relay.toml -vv
"#)]
pub struct Cli {
    /// Engine executable (overrides engine.path)
    #[arg(short, long, value_name = "PATH")]
    pub engine: Option<PathBuf>,

    /// Project opened by the engine (overrides engine.project_path)
    #[arg(short, long, value_name = "PATH")]
    pub project: Option<PathBuf>,

    /// Run the engine with a window instead of in batch mode
    #[arg(long)]
    pub no_batch: bool,

    /// Verbosity level (-v = info, -vv = debug, -vvv = trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Disable loading of configuration files
    #[arg(long)]
    pub no_config: bool,

    /// Show configuration file locations and exit
    #[arg(long)]
    pub show_config: bool,
}

impl Cli {
    /// Flags win over every configuration source.
    pub fn apply_overrides(&self, config: &mut FileConfig) {
        if let Some(engine) = &self.engine {
            config.engine.path = Some(engine.clone());
        }
        if let Some(project) = &self.project {
            config.engine.project_path = Some(project.clone());
        }
        if self.no_batch {
            config.engine.batch_mode = false;
        }
    }

    /// Default filter directive for the verbosity level.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "engine-relay",
            "--engine",
            "/opt/engine",
            "-p",
            "scene",
            "--no-batch",
            "-vv",
        ]);
        let mut config = FileConfig::default();
        config.engine.path = Some("/from/file".into());
        cli.apply_overrides(&mut config);

        assert_eq!(config.engine.path, Some(PathBuf::from("/opt/engine")));
        assert_eq!(config.engine.project_path, Some(PathBuf::from("scene")));
        assert!(!config.engine.batch_mode);
        assert_eq!(cli.log_level(), "debug");
    }

    #[test]
    fn test_no_flags_keep_config() {
        let cli = Cli::parse_from(["engine-relay"]);
        let mut config = FileConfig::default();
        config.engine.path = Some("/from/file".into());
        cli.apply_overrides(&mut config);

        assert_eq!(config.engine.path, Some(PathBuf::from("/from/file")));
        assert!(config.engine.batch_mode);
        assert_eq!(cli.log_level(), "warn");
    }
}
