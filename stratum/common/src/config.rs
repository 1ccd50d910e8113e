use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default interval between two deadlock detection passes.
pub const DEFAULT_DEADLOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Default interval between two background garbage collection sweeps.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_millis(100);

/// Number of pending commit records that triggers an inline sweep.
pub const DEFAULT_GC_TRIGGER_THRESHOLD: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on a blocking lock wait (`None` waits until granted or aborted)
    pub lock_timeout: Option<Duration>,

    /// Interval of the background deadlock detector
    pub deadlock_timeout: Duration,

    /// Interval of the background garbage collector (`None` disables the thread)
    pub gc_interval: Option<Duration>,

    /// Pending commit records that trigger a sweep on commit (0 disables it)
    pub gc_trigger_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: None,
            deadlock_timeout: DEFAULT_DEADLOCK_TIMEOUT,
            gc_interval: Some(DEFAULT_GC_INTERVAL),
            gc_trigger_threshold: DEFAULT_GC_TRIGGER_THRESHOLD,
        }
    }
}

impl EngineConfig {
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn with_deadlock_timeout(mut self, interval: Duration) -> Self {
        self.deadlock_timeout = interval;
        self
    }

    pub fn without_background_gc(mut self) -> Self {
        self.gc_interval = None;
        self.gc_trigger_threshold = 0;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"gc_trigger_threshold": 7}"#).unwrap();
        assert_eq!(config.gc_trigger_threshold, 7);
        assert_eq!(config.deadlock_timeout, DEFAULT_DEADLOCK_TIMEOUT);
        assert_eq!(config.lock_timeout, None);
    }

    #[test]
    fn test_builder_helpers() {
        let config = EngineConfig::default()
            .with_lock_timeout(Duration::from_millis(20))
            .without_background_gc();
        assert_eq!(config.lock_timeout, Some(Duration::from_millis(20)));
        assert_eq!(config.gc_interval, None);
        assert_eq!(config.gc_trigger_threshold, 0);
    }
}
