//! Configuration file loader with multi-source merging

use super::file_config::FileConfig;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use std::path::{Path, PathBuf};

/// Project-level config file names, checked in order.
const PROJECT_CONFIG_FILES: [&str; 2] = ["relay.toml", ".relay.toml"];

/// Prefix of environment overrides, e.g. `ENGINE_RELAY_DISPATCHER__MAX_CONCURRENT_OPS=3`.
pub const ENV_PREFIX: &str = "ENGINE_RELAY_";

/// Configuration loader that handles file discovery and merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from all sources with proper priority
    ///
    /// Priority (highest to lowest):
    /// 1. `ENGINE_RELAY_*` environment variables (`__` separates sections)
    /// 2. Explicit config path (if provided)
    /// 3. Project root: `./relay.toml` or `./.relay.toml`
    /// 4. Global: `$XDG_CONFIG_HOME/engine-relay/config.toml`
    /// 5. Default values
    pub fn load(config_path: Option<&PathBuf>) -> Result<FileConfig, Box<figment::Error>> {
        let project = Self::project_config_path();
        Self::figment(
            Self::global_config_path().as_deref(),
            project.as_deref(),
            config_path.map(PathBuf::as_path),
        )
        .extract()
        .map_err(Box::new)
    }

    /// Load only default configuration (for --no-config)
    pub fn load_defaults() -> FileConfig {
        FileConfig::default()
    }

    fn figment(global: Option<&Path>, project: Option<&Path>, explicit: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(FileConfig::default()));
        for path in [global, project].into_iter().flatten() {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            }
        }
        // An explicit path must exist: `Toml::file` would silently skip it.
        if let Some(path) = explicit {
            figment = figment.merge(Toml::file_exact(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Get the global config file path
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("engine-relay").join("config.toml"))
    }

    /// Get the project-level config file path (if it exists)
    pub fn project_config_path() -> Option<PathBuf> {
        PROJECT_CONFIG_FILES
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    /// Print the config file locations being used (for debugging)
    pub fn print_config_sources(config_path: Option<&PathBuf>) {
        println!("Configuration sources (in priority order):");
        println!("  [ENV  ] {}*", ENV_PREFIX);

        if let Some(path) = config_path {
            let mark = if path.exists() { "FOUND" } else { "MISSING" };
            println!("  [{:<5}] Explicit: {}", mark, path.display());
        }

        match Self::project_config_path() {
            Some(path) => println!("  [FOUND] Project: {}", path.display()),
            None => println!("  [     ] Project: ./relay.toml or ./.relay.toml"),
        }

        if let Some(path) = Self::global_config_path() {
            let mark = if path.exists() { "FOUND" } else { "     " };
            println!("  [{}] Global:  {}", mark, path.display());
        }

        println!("  [     ] Default: built-in defaults");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_load_defaults() {
        let config = ConfigLoader::load_defaults();
        assert_eq!(config, FileConfig::default());
    }

    #[test]
    fn test_global_config_path_returns_some() {
        let path = ConfigLoader::global_config_path();
        assert!(path.is_some());
        assert!(path.unwrap().to_string_lossy().contains("engine-relay"));
    }

    #[test]
    fn test_later_files_override_earlier() {
        let dir = tempfile::tempdir().unwrap();
        let global = write(
            dir.path(),
            "global.toml",
            "[dispatcher]\nmax_concurrent_ops = 2\ncache_responses = false\n",
        );
        let project = write(
            dir.path(),
            "relay.toml",
            "[dispatcher]\nmax_concurrent_ops = 4\n\n[heartbeat]\ninterval_ms = 500\n",
        );
        let explicit = write(dir.path(), "explicit.toml", "[heartbeat]\nenabled = false\n");

        figment::Jail::expect_with(|_| {
            let config: FileConfig = ConfigLoader::figment(
                Some(&global),
                Some(&project),
                Some(&explicit),
            )
            .extract()?;
            assert_eq!(config.dispatcher.max_concurrent_ops, 4);
            assert!(!config.dispatcher.cache_responses);
            assert_eq!(config.heartbeat.interval_ms, 500);
            assert!(!config.heartbeat.enabled);
            assert!(config.dispatcher.batch_requests);
            Ok(())
        });
    }

    #[test]
    fn test_missing_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        figment::Jail::expect_with(|_| {
            let config: FileConfig =
                ConfigLoader::figment(Some(&missing), Some(&missing), None).extract()?;
            assert_eq!(config, FileConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        figment::Jail::expect_with(|_| {
            let result = ConfigLoader::figment(None, None, Some(&missing)).extract::<FileConfig>();
            assert!(result.is_err());
            Ok(())
        });
    }

    #[test]
    fn test_environment_overrides_files() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "explicit.toml",
                "[dispatcher]\nmax_concurrent_ops = 2\n\n[engine]\npath = \"/from/file\"\n",
            )?;
            jail.set_env("ENGINE_RELAY_DISPATCHER__MAX_CONCURRENT_OPS", "7");
            jail.set_env("ENGINE_RELAY_CHANNEL__STRICT_TYPES", "false");

            let explicit = PathBuf::from("explicit.toml");
            let config: FileConfig =
                ConfigLoader::figment(None, None, Some(&explicit)).extract()?;
            assert_eq!(config.dispatcher.max_concurrent_ops, 7);
            assert!(!config.channel.strict_types);
            assert_eq!(config.engine.path, Some(PathBuf::from("/from/file")));
            Ok(())
        });
    }
}
