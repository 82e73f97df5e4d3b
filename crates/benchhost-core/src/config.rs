use std::env;
use std::time::Duration;

/// Timing configuration for one worker session.
///
/// Reads overrides from `BENCHHOST_*` environment variables (milliseconds),
/// falling back to the defaults below when a variable is unset or invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// How long to wait for the worker to exit on its own after the session
    /// ends before it is treated as hung and killed.
    pub process_exit_timeout: Duration,
    /// Upper bound on waiting for each captured stream to drain.
    pub stream_settle_timeout: Duration,
    /// How long the channel transport waits for the worker to connect back.
    pub connect_timeout: Duration,
    /// Readiness poll interval of the pipe transport. Cancellation is
    /// re-checked at least this often while no data is available.
    pub poll_interval: Duration,
}

impl HostConfig {
    pub const DEFAULT_PROCESS_EXIT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const DEFAULT_STREAM_SETTLE_TIMEOUT: Duration = Duration::from_secs(1);
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

    pub const PROCESS_EXIT_TIMEOUT_ENV: &str = "BENCHHOST_PROCESS_EXIT_TIMEOUT_MS";
    pub const STREAM_SETTLE_TIMEOUT_ENV: &str = "BENCHHOST_STREAM_SETTLE_TIMEOUT_MS";
    pub const CONNECT_TIMEOUT_ENV: &str = "BENCHHOST_CONNECT_TIMEOUT_MS";
    pub const POLL_INTERVAL_ENV: &str = "BENCHHOST_POLL_INTERVAL_MS";

    /// Build a config from the environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (testable without env vars).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let millis = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        Self {
            process_exit_timeout: millis(
                Self::PROCESS_EXIT_TIMEOUT_ENV,
                Self::DEFAULT_PROCESS_EXIT_TIMEOUT,
            ),
            stream_settle_timeout: millis(
                Self::STREAM_SETTLE_TIMEOUT_ENV,
                Self::DEFAULT_STREAM_SETTLE_TIMEOUT,
            ),
            connect_timeout: millis(Self::CONNECT_TIMEOUT_ENV, Self::DEFAULT_CONNECT_TIMEOUT),
            poll_interval: millis(Self::POLL_INTERVAL_ENV, Self::DEFAULT_POLL_INTERVAL),
        }
    }

    pub fn with_process_exit_timeout(mut self, timeout: Duration) -> Self {
        self.process_exit_timeout = timeout;
        self
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            process_exit_timeout: Self::DEFAULT_PROCESS_EXIT_TIMEOUT,
            stream_settle_timeout: Self::DEFAULT_STREAM_SETTLE_TIMEOUT,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_when_nothing_set() {
        let cfg = HostConfig::from_lookup(|_| None);
        assert_eq!(cfg, HostConfig::default());
        assert_eq!(cfg.stream_settle_timeout, Duration::from_secs(1));
    }

    #[test]
    fn overrides_are_milliseconds() {
        let vars = HashMap::from([
            (HostConfig::PROCESS_EXIT_TIMEOUT_ENV, "5000"),
            (HostConfig::POLL_INTERVAL_ENV, " 10 "),
        ]);
        let cfg = HostConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.process_exit_timeout, Duration::from_secs(5));
        assert_eq!(cfg.poll_interval, Duration::from_millis(10));
        assert_eq!(cfg.connect_timeout, HostConfig::DEFAULT_CONNECT_TIMEOUT);
    }

    #[test]
    fn invalid_values_fall_back() {
        let cfg = HostConfig::from_lookup(|k| {
            (k == HostConfig::CONNECT_TIMEOUT_ENV).then(|| "soon".to_string())
        });
        assert_eq!(cfg.connect_timeout, HostConfig::DEFAULT_CONNECT_TIMEOUT);
    }

    #[test]
    fn builder_overrides() {
        let cfg = HostConfig::default().with_process_exit_timeout(Duration::from_millis(250));
        assert_eq!(cfg.process_exit_timeout, Duration::from_millis(250));
    }
}
