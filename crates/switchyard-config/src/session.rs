use std::time::Duration;

use serde::Deserialize;

/// Stateful-backend session handling
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Idle lifetime of a session record, refreshed on every turn
    #[serde(default = "default_ttl", deserialize_with = "crate::duration::deserialize")]
    pub ttl: Duration,
    /// Period of the background expiry sweep
    #[serde(default = "default_sweep_interval", deserialize_with = "crate::duration::deserialize")]
    pub sweep_interval: Duration,
    /// What happens to a turn while another turn holds the same conversation
    #[serde(default)]
    pub busy: BusyPolicy,
    /// Upper bound on waiting when `busy = "wait"`
    #[serde(default = "default_wait_timeout", deserialize_with = "crate::duration::deserialize")]
    pub wait_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            sweep_interval: default_sweep_interval(),
            busy: BusyPolicy::default(),
            wait_timeout: default_wait_timeout(),
        }
    }
}

/// Policy for concurrent turns on one conversation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Fail the second turn with `ConversationBusy`
    #[default]
    Reject,
    /// Queue behind the running turn, up to `wait_timeout`
    Wait,
}

const fn default_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}

const fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

const fn default_wait_timeout() -> Duration {
    Duration::from_secs(30)
}
