// Wait-timeout defaults and env overrides.
use std::time::Duration;

use waggle_common::env;

pub const DEFAULT_WAIT_SECS: u64 = 30;
pub const MAX_WAIT_SECS: u64 = 60;
pub const DEFAULT_MAX_WAITERS: usize = 1024;

/// Bounds for how long a poll call may block.
///
/// ```
/// use std::time::Duration;
/// use waggle_poll::WaitConfig;
///
/// let config = WaitConfig::default();
/// assert_eq!(config.clamp(Some(Duration::from_secs(600))), config.max_wait);
/// assert_eq!(config.clamp(None), config.default_wait);
/// ```
#[derive(Debug, Clone)]
pub struct WaitConfig {
    pub default_wait: Duration,
    pub max_wait: Duration,
    // Upper bound on concurrently suspended poll calls.
    pub max_waiters: usize,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            default_wait: Duration::from_secs(DEFAULT_WAIT_SECS),
            max_wait: Duration::from_secs(MAX_WAIT_SECS),
            max_waiters: DEFAULT_MAX_WAITERS,
        }
    }
}

impl WaitConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env::read_u64("WAGGLE_DEFAULT_WAIT_SECS") {
            config.default_wait = Duration::from_secs(value);
        }
        if let Some(value) = env::read_u64("WAGGLE_MAX_WAIT_SECS") {
            config.max_wait = Duration::from_secs(value);
        }
        if let Some(value) = env::read_usize("WAGGLE_MAX_WAITERS") {
            config.max_waiters = value;
        }
        config
    }

    // Callers may ask for any wait, including zero ("check once, never
    // block"); the system-wide maximum always wins.
    pub fn clamp(&self, requested: Option<Duration>) -> Duration {
        requested.unwrap_or(self.default_wait).min(self.max_wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_caps_at_max_wait() {
        let config = WaitConfig::default();
        assert_eq!(
            config.clamp(Some(Duration::from_secs(MAX_WAIT_SECS * 10))),
            config.max_wait
        );
    }

    #[test]
    fn clamp_defaults_when_unspecified() {
        let config = WaitConfig::default();
        assert_eq!(config.clamp(None), config.default_wait);
    }

    #[test]
    fn clamp_passes_zero_through() {
        let config = WaitConfig::default();
        assert_eq!(config.clamp(Some(Duration::ZERO)), Duration::ZERO);
    }
}
