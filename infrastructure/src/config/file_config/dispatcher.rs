//! Dispatcher configuration from TOML (`[dispatcher]` section)

use relay_application::DispatcherSettings;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Raw dispatcher configuration from TOML
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileDispatcherConfig {
    /// Concurrency ceiling (1..=10)
    pub max_concurrent_ops: usize,
    /// Queue requests and send them on the tick instead of immediately
    pub batch_requests: bool,
    pub cache_responses: bool,
    pub tick_interval_ms: u64,
    pub request_timeout_ms: u64,
    /// Tool back-ends whose requests are refused outright
    pub disabled_backends: Vec<String>,
}

impl Default for FileDispatcherConfig {
    fn default() -> Self {
        let defaults = DispatcherSettings::default();
        Self {
            max_concurrent_ops: defaults.max_concurrent_ops,
            batch_requests: defaults.batch_requests,
            cache_responses: defaults.cache_responses,
            tick_interval_ms: defaults.tick_interval.as_millis() as u64,
            request_timeout_ms: defaults.request_timeout.as_millis() as u64,
            disabled_backends: defaults.disabled_backends,
        }
    }
}

impl FileDispatcherConfig {
    /// Convert to runtime settings. Out-of-range values are clamped; call
    /// [`FileConfig::validate`](super::FileConfig::validate) first to reject
    /// them instead.
    pub fn to_settings(&self) -> DispatcherSettings {
        DispatcherSettings::default()
            .with_max_concurrent_ops(self.max_concurrent_ops)
            .with_batch_requests(self.batch_requests)
            .with_cache_responses(self.cache_responses)
            .with_tick_interval(Duration::from_millis(self.tick_interval_ms))
            .with_request_timeout(Duration::from_millis(self.request_timeout_ms))
            .with_disabled_backends(self.disabled_backends.iter().cloned())
    }
}
