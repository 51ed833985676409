use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    request_count: u32,
    last_failure_time: Option<Instant>,
}

/// Per-backend three-state failure detector gating admission.
///
/// All operations take the same lock, so `can_request` / `record_success` /
/// `record_failure` appear atomic to concurrent callers.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                request_count: 0,
                last_failure_time: None,
            }),
        }
    }

    /// Whether a request may be admitted right now.
    ///
    /// Not a pure read: an open breaker whose timeout has elapsed moves to
    /// half-open here, and half-open admissions consume a probe slot.
    pub fn can_request(&self) -> bool {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure_time
                    .map(|t| t.elapsed() >= self.config.open_timeout)
                    .unwrap_or(true);
                if elapsed {
                    Self::transition(&mut inner, CircuitState::HalfOpen);
                    inner.request_count += 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.request_count < self.config.max_half_open_requests {
                    inner.request_count += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    Self::transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();

        inner.failure_count += 1;
        inner.last_failure_time = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    Self::transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => Self::transition(&mut inner, CircuitState::Open),
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn stats(&self) -> serde_json::Value {
        let inner = self.lock();
        serde_json::json!({
            "state": inner.state.to_string(),
            "failure_count": inner.failure_count,
            "success_count": inner.success_count,
            "request_count": inner.request_count,
        })
    }

    fn transition(inner: &mut BreakerInner, new_state: CircuitState) {
        if inner.state == new_state {
            return;
        }

        inner.state = new_state;
        inner.success_count = 0;
        inner.request_count = 0;
        if new_state == CircuitState::Closed {
            inner.failure_count = 0;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
