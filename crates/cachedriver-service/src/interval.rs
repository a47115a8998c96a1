//! The cadence of background agent runs.

use std::time::Duration;

use crate::agent::Agent;
use crate::config::AgentIntervalConfig;

/// The cadence of an agent, in milliseconds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Interval {
    poll_interval_millis: u64,
    error_interval_millis: u64,
    timeout_millis: u64,
}

impl Interval {
    pub const fn new(
        poll_interval_millis: u64,
        error_interval_millis: u64,
        timeout_millis: u64,
    ) -> Self {
        Self {
            poll_interval_millis,
            error_interval_millis,
            timeout_millis,
        }
    }

    pub fn poll_interval_millis(&self) -> u64 {
        self.poll_interval_millis
    }

    pub fn error_interval_millis(&self) -> u64 {
        self.error_interval_millis
    }

    pub fn timeout_millis(&self) -> u64 {
        self.timeout_millis
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }

    pub fn error_interval(&self) -> Duration {
        Duration::from_millis(self.error_interval_millis)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_millis)
    }
}

impl From<&AgentIntervalConfig> for Interval {
    fn from(config: &AgentIntervalConfig) -> Self {
        Self::new(
            duration_millis(config.poll_interval),
            duration_millis(config.error_interval),
            duration_millis(config.timeout),
        )
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Decides how often an agent runs.
pub trait AgentIntervalProvider: Send + Sync {
    fn interval(&self, agent: &dyn Agent) -> Interval;
}

/// Uses a fixed default interval, which agents with a custom schedule may override per value.
#[derive(Clone, Copy, Debug)]
pub struct DefaultAgentIntervalProvider {
    default: Interval,
}

impl DefaultAgentIntervalProvider {
    pub fn new(default: Interval) -> Self {
        Self { default }
    }

    pub fn from_config(config: &AgentIntervalConfig) -> Self {
        Self::new(config.into())
    }

    pub fn default_interval(&self) -> Interval {
        self.default
    }
}

impl AgentIntervalProvider for DefaultAgentIntervalProvider {
    fn interval(&self, agent: &dyn Agent) -> Interval {
        let Some(custom) = agent.as_custom_scheduled() else {
            return self.default;
        };

        Interval::new(
            or_default(custom.poll_interval_millis(), self.default.poll_interval_millis),
            or_default(custom.error_interval_millis(), self.default.error_interval_millis),
            or_default(custom.timeout_millis(), self.default.timeout_millis),
        )
    }
}

/// Negative overrides, most notably `USE_DEFAULT_INTERVAL`, keep the default.
fn or_default(value: i64, default: u64) -> u64 {
    u64::try_from(value).unwrap_or(default)
}
