//! Circuit breaker for exchange calls
//!
//! After `failure_threshold` consecutive failed requests the breaker opens and
//! every call fails fast as "exchange unavailable" until `cooldown` has passed.
//! The first call after the cooldown is a trial request: success closes the breaker,
//! failure re-opens it for another cooldown.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    /// Cooldown elapsed, one trial request allowed
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.opened_at {
            None => CircuitState::Closed,
            Some(at) if at.elapsed() >= self.config.cooldown => CircuitState::HalfOpen,
            Some(_) => CircuitState::Open,
        }
    }

    /// Whether a request may be sent now
    pub fn can_attempt(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Time left until the next trial request is allowed
    pub fn retry_after(&self) -> Option<Duration> {
        self.opened_at
            .map(|at| self.config.cooldown.saturating_sub(at.elapsed()))
            .filter(|d| !d.is_zero())
    }

    pub fn record_success(&mut self) {
        if self.opened_at.is_some() {
            tracing::info!("Circuit breaker closed, exchange reachable again");
        }
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;

        match self.state() {
            CircuitState::HalfOpen => {
                tracing::warn!("Circuit breaker trial request failed, re-opening");
                self.opened_at = Some(Instant::now());
            }
            CircuitState::Closed if self.consecutive_failures >= self.config.failure_threshold => {
                tracing::warn!(
                    "Circuit breaker opened after {} consecutive failures",
                    self.consecutive_failures
                );
                self.opened_at = Some(Instant::now());
            }
            _ => {}
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let mut cb = CircuitBreaker::new(CircuitBreakerConfig::default().with_failure_threshold(3));

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_attempt());
        assert!(cb.retry_after().is_some());
    }

    #[test]
    fn test_success_resets_count() {
        let mut cb = CircuitBreaker::new(CircuitBreakerConfig::default().with_failure_threshold(3));

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.consecutive_failures(), 0);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_trial_request_after_cooldown() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_cooldown(Duration::from_millis(1));
        let mut cb = CircuitBreaker::new(config);

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.can_attempt());

        // failed trial request re-opens
        cb.record_failure();
        assert!(cb.opened_at.is_some());

        std::thread::sleep(Duration::from_millis(5));
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
