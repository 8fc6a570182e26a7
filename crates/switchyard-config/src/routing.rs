use serde::Deserialize;

/// Candidate selection configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingConfig {
    /// Backend used alone when the requested model matches nothing
    #[serde(default)]
    pub default_backend: Option<String>,
    /// Skip backends that keep failing
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

/// Circuit breaker thresholds, applied per backend
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Failures within the window that open the circuit
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    /// How long an open circuit waits before letting a trial attempt through
    #[serde(default = "default_recovery_seconds")]
    pub recovery_seconds: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            error_threshold: default_error_threshold(),
            window_seconds: default_window_seconds(),
            recovery_seconds: default_recovery_seconds(),
        }
    }
}

#[allow(clippy::missing_const_for_fn)]
fn default_enabled() -> bool {
    true
}

#[allow(clippy::missing_const_for_fn)]
fn default_error_threshold() -> u32 {
    5
}

#[allow(clippy::missing_const_for_fn)]
fn default_window_seconds() -> u64 {
    60
}

#[allow(clippy::missing_const_for_fn)]
fn default_recovery_seconds() -> u64 {
    30
}
