//! Backend health tracking with a circuit breaker
//!
//! Kept per backend id outside the registry snapshot, so health survives
//! reloads. A backend whose circuit is open is skipped by the router until
//! the recovery period lets one trial attempt through again. Other requests
//! keep skipping it until that trial is recorded, or until another recovery
//! period passes without an outcome.

use std::sync::Arc;

use dashmap::DashMap;
use jiff::{SignedDuration, Timestamp};
use serde::Serialize;
use switchyard_config::CircuitBreakerConfig;

use crate::session::{Clock, SystemClock};

/// Circuit breaker state for a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Backend is failing, attempts are skipped
    Open,
    /// Recovery period elapsed, the next attempt decides
    HalfOpen,
}

#[derive(Debug, Default)]
struct HealthState {
    window_errors: u32,
    window_start: Option<Timestamp>,
    opened_at: Option<Timestamp>,
    /// When the half-open trial was handed out
    trial_started: Option<Timestamp>,
    consecutive_failures: u32,
    last_success: Option<Timestamp>,
    last_failure: Option<Timestamp>,
    last_error: Option<String>,
}

/// Point-in-time health of one backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendHealth {
    pub circuit: CircuitState,
    pub consecutive_failures: u32,
    pub last_success: Option<Timestamp>,
    pub last_failure: Option<Timestamp>,
    pub last_error: Option<String>,
}

/// Track backend outcomes and derive circuit state
pub struct HealthTracker {
    backends: DashMap<String, HealthState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl HealthTracker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            backends: DashMap::new(),
            config,
            clock,
        }
    }

    pub fn state(&self, backend: &str) -> CircuitState {
        let Some(health) = self.backends.get(backend) else {
            return CircuitState::Closed;
        };
        self.circuit(&health)
    }

    fn circuit(&self, health: &HealthState) -> CircuitState {
        let Some(opened_at) = health.opened_at else {
            return CircuitState::Closed;
        };

        if self.clock.now().duration_since(opened_at) >= self.recovery() {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    fn recovery(&self) -> SignedDuration {
        SignedDuration::from_secs(i64::try_from(self.config.recovery_seconds).unwrap_or(i64::MAX))
    }

    /// Whether the router may attempt this backend
    ///
    /// Always true when the breaker is disabled. A half-open circuit answers
    /// true once, claiming the trial attempt for the caller.
    pub fn is_available(&self, backend: &str) -> bool {
        if !self.config.enabled {
            return true;
        }
        let Some(mut health) = self.backends.get_mut(backend) else {
            return true;
        };

        match self.circuit(&health) {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                let now = self.clock.now();
                let claimable = health
                    .trial_started
                    .is_none_or(|started| now.duration_since(started) >= self.recovery());
                if claimable {
                    health.trial_started = Some(now);
                }
                claimable
            }
        }
    }

    pub fn record_success(&self, backend: &str) {
        let now = self.clock.now();
        let mut health = self.backends.entry(backend.to_owned()).or_default();

        if health.opened_at.is_some() {
            tracing::info!(backend, "circuit breaker closed");
        }
        health.opened_at = None;
        health.trial_started = None;
        health.window_errors = 0;
        health.window_start = Some(now);
        health.consecutive_failures = 0;
        health.last_success = Some(now);
    }

    pub fn record_failure(&self, backend: &str, error: &str) {
        let now = self.clock.now();
        let window = SignedDuration::from_secs(i64::try_from(self.config.window_seconds).unwrap_or(i64::MAX));
        let mut health = self.backends.entry(backend.to_owned()).or_default();

        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        health.last_failure = Some(now);
        health.last_error = Some(error.to_owned());

        let window_expired = health.window_start.is_none_or(|start| now.duration_since(start) >= window);
        if window_expired {
            health.window_errors = 1;
            health.window_start = Some(now);
        } else {
            health.window_errors = health.window_errors.saturating_add(1);
        }

        // A failed half-open attempt reopens for another recovery period
        let reopen = health.opened_at.is_some() && self.circuit(&health) == CircuitState::HalfOpen;
        health.trial_started = None;
        if reopen || (health.opened_at.is_none() && health.window_errors >= self.config.error_threshold) {
            health.opened_at = Some(now);
            let error_count = health.window_errors;
            drop(health);
            if self.config.enabled {
                tracing::warn!(backend, error_count, "circuit breaker opened");
            }
        }
    }

    pub fn snapshot(&self, backend: &str) -> BackendHealth {
        self.backends.get(backend).map_or(
            BackendHealth {
                circuit: CircuitState::Closed,
                consecutive_failures: 0,
                last_success: None,
                last_failure: None,
                last_error: None,
            },
            |health| BackendHealth {
                circuit: self.circuit(&health),
                consecutive_failures: health.consecutive_failures,
                last_success: health.last_success,
                last_failure: health.last_failure,
                last_error: health.last_error.clone(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ManualClock;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            error_threshold: 3,
            window_seconds: 60,
            recovery_seconds: 5,
        }
    }

    fn tracker() -> (HealthTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Timestamp::from_second(1_700_000_000).unwrap()));
        (HealthTracker::with_clock(test_config(), clock.clone()), clock)
    }

    #[test]
    fn unknown_backend_is_closed() {
        let (tracker, _) = tracker();
        assert_eq!(tracker.state("a"), CircuitState::Closed);
        assert!(tracker.is_available("a"));
    }

    #[test]
    fn failures_below_threshold_stay_closed() {
        let (tracker, _) = tracker();
        tracker.record_failure("a", "503");
        tracker.record_failure("a", "503");
        assert_eq!(tracker.state("a"), CircuitState::Closed);
        assert_eq!(tracker.snapshot("a").consecutive_failures, 2);
    }

    #[test]
    fn threshold_opens_then_recovery_half_opens() {
        let (tracker, clock) = tracker();
        for _ in 0..3 {
            tracker.record_failure("a", "503");
        }
        assert_eq!(tracker.state("a"), CircuitState::Open);
        assert!(!tracker.is_available("a"));

        clock.advance(SignedDuration::from_secs(5));
        assert_eq!(tracker.state("a"), CircuitState::HalfOpen);
        assert!(tracker.is_available("a"));

        tracker.record_failure("a", "503 again");
        assert_eq!(tracker.state("a"), CircuitState::Open);
    }

    #[test]
    fn half_open_lets_a_single_trial_through() {
        let (tracker, clock) = tracker();
        for _ in 0..3 {
            tracker.record_failure("a", "503");
        }
        clock.advance(SignedDuration::from_secs(5));

        assert!(tracker.is_available("a"));
        assert!(!tracker.is_available("a"));
        assert_eq!(tracker.state("a"), CircuitState::HalfOpen);

        tracker.record_success("a");
        assert_eq!(tracker.state("a"), CircuitState::Closed);
        assert!(tracker.is_available("a"));
        assert!(tracker.is_available("a"));
    }

    #[test]
    fn unanswered_trial_is_handed_out_again_after_recovery() {
        let (tracker, clock) = tracker();
        for _ in 0..3 {
            tracker.record_failure("a", "503");
        }
        clock.advance(SignedDuration::from_secs(5));
        assert!(tracker.is_available("a"));

        clock.advance(SignedDuration::from_secs(4));
        assert!(!tracker.is_available("a"));
        clock.advance(SignedDuration::from_secs(1));
        assert!(tracker.is_available("a"));
    }

    #[test]
    fn failures_outside_window_do_not_accumulate() {
        let (tracker, clock) = tracker();
        tracker.record_failure("a", "x");
        tracker.record_failure("a", "x");
        clock.advance(SignedDuration::from_secs(61));
        tracker.record_failure("a", "x");
        assert_eq!(tracker.state("a"), CircuitState::Closed);
    }

    #[test]
    fn success_closes_and_resets() {
        let (tracker, _) = tracker();
        for _ in 0..3 {
            tracker.record_failure("a", "503");
        }
        tracker.record_success("a");

        let health = tracker.snapshot("a");
        assert_eq!(health.circuit, CircuitState::Closed);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.last_success.is_some());
        assert_eq!(health.last_error.as_deref(), Some("503"));
    }

    #[test]
    fn disabled_breaker_never_blocks() {
        let tracker = HealthTracker::new(CircuitBreakerConfig {
            enabled: false,
            ..test_config()
        });
        for _ in 0..10 {
            tracker.record_failure("a", "503");
        }
        assert!(tracker.is_available("a"));
    }

    #[test]
    fn backends_are_tracked_independently() {
        let (tracker, _) = tracker();
        for _ in 0..3 {
            tracker.record_failure("bad", "503");
        }
        assert!(!tracker.is_available("bad"));
        assert!(tracker.is_available("good"));
    }
}
