//! Dispatcher settings: admission, batching and caching control.
//!
//! [`DispatcherSettings`] groups the static parameters of the
//! [`RequestDispatcher`](crate::use_cases::dispatch::RequestDispatcher).

use std::time::Duration;

/// Upper bound accepted for `max_concurrent_ops`.
pub const MAX_CONCURRENT_OPS_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherSettings {
    /// Ceiling on simultaneously in-flight requests (1..=10).
    pub max_concurrent_ops: usize,
    /// Queue misses and drain them on the scheduler tick only.
    pub batch_requests: bool,
    /// Serve identical successful requests from memory.
    pub cache_responses: bool,
    /// Scheduler tick period.
    pub tick_interval: Duration,
    /// Deadline for a transmitted request to be answered.
    pub request_timeout: Duration,
    /// Tool back-ends switched off. Requests to them are refused at submit.
    pub disabled_backends: Vec<String>,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            max_concurrent_ops: 5,
            batch_requests: true,
            cache_responses: true,
            tick_interval: Duration::from_millis(100),
            request_timeout: Duration::from_secs(30),
            disabled_backends: Vec::new(),
        }
    }
}

impl DispatcherSettings {
    // ==================== Builder Methods ====================

    /// Values outside `1..=10` are clamped.
    pub fn with_max_concurrent_ops(mut self, max: usize) -> Self {
        self.max_concurrent_ops = max.clamp(1, MAX_CONCURRENT_OPS_LIMIT);
        self
    }

    pub fn with_batch_requests(mut self, enabled: bool) -> Self {
        self.batch_requests = enabled;
        self
    }

    pub fn with_cache_responses(mut self, enabled: bool) -> Self {
        self.cache_responses = enabled;
        self
    }

    /// A zero interval is raised to 1ms.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Duplicates are dropped; order is kept.
    pub fn with_disabled_backends<I, S>(mut self, backends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disabled_backends.clear();
        for backend in backends {
            let backend = backend.into();
            if !self.disabled_backends.contains(&backend) {
                self.disabled_backends.push(backend);
            }
        }
        self
    }
}
