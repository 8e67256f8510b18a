//! Shared guard against provider bans.
//!
//! One breaker is shared by every worker fetching from the same provider.
//! A 403 opens it at once; `threshold` consecutive 429s or server errors
//! open it too. While open, fetches fail fast with
//! [`DataError::CircuitBreakerTripped`](super::DataError::CircuitBreakerTripped)
//! until the cooldown has passed.

use crate::config::FetchConfig;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed { failures: u32 },
    Open { until: Instant },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<State>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(State::Closed { failures: 0 }),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    pub fn from_config(config: &FetchConfig) -> Self {
        Self::new(
            config.breaker_threshold,
            Duration::from_secs(config.breaker_cooldown_secs),
        )
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a request may go out now. Closes an expired open breaker.
    pub fn allows(&self) -> bool {
        let mut state = self.state();
        match *state {
            State::Closed { .. } => true,
            State::Open { until } if Instant::now() >= until => {
                log::info!("provider circuit breaker closed after cooldown");
                *state = State::Closed { failures: 0 };
                true
            }
            State::Open { .. } => false,
        }
    }

    pub fn on_success(&self) {
        let mut state = self.state();
        if let State::Closed { failures } = &mut *state {
            *failures = 0;
        }
    }

    /// Count a retryable failure; opens the breaker at the threshold.
    pub fn on_failure(&self) {
        let mut state = self.state();
        if let State::Closed { failures } = *state {
            let failures = failures + 1;
            *state = if failures >= self.threshold {
                log::warn!("provider circuit breaker opened after {failures} failures in a row");
                State::Open {
                    until: Instant::now() + self.cooldown,
                }
            } else {
                State::Closed { failures }
            };
        }
    }

    /// Open immediately, e.g. on 403 Forbidden.
    pub fn open(&self) {
        log::warn!("provider circuit breaker opened: requests blocked");
        *self.state() = State::Open {
            until: Instant::now() + self.cooldown,
        };
    }

    /// Time left before an open breaker lets requests through again.
    pub fn cooldown_left(&self) -> Duration {
        match *self.state() {
            State::Closed { .. } => Duration::ZERO,
            State::Open { until } => until.saturating_duration_since(Instant::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_until_threshold() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(cb.allows());
        cb.on_failure();
        cb.on_failure();
        assert!(cb.allows());
        cb.on_failure();
        assert!(!cb.allows());
        assert!(cb.cooldown_left() > Duration::ZERO);
    }

    #[test]
    fn success_clears_failure_streak() {
        let cb = CircuitBreaker::new(2, Duration::from_secs(60));
        cb.on_failure();
        cb.on_success();
        cb.on_failure();
        assert!(cb.allows());
        assert_eq!(cb.cooldown_left(), Duration::ZERO);
    }

    #[test]
    fn reopens_for_requests_after_cooldown() {
        let cb = CircuitBreaker::new(3, Duration::from_millis(10));
        cb.open();
        assert!(!cb.allows());
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.allows());
    }

    #[test]
    fn built_from_fetch_settings() {
        let config = FetchConfig {
            breaker_threshold: 1,
            ..FetchConfig::default()
        };
        let cb = CircuitBreaker::from_config(&config);
        cb.on_failure();
        assert!(!cb.allows());
        assert!(cb.cooldown_left() <= Duration::from_secs(30 * 60));
    }
}
