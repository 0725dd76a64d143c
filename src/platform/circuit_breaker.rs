//! Circuit breaker state machine (spec §4.6f). Transitions are observable
//! (exposed for `/metrics`); reads are lock-free, writes go through a
//! mutex — matching §5's "shared; mutated under a mutex; reads are
//! lock-free snapshots" policy.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

struct Inner {
    /// Timestamps of failures inside the current sliding window (closed state).
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_probes: u32,
    half_open_successes: u32,
}

pub struct CircuitBreakerConfig {
    pub window: Duration,
    pub failure_threshold: u32,
    pub open_timeout: Duration,
    pub half_open_max_probes: u32,
    pub half_open_success_ratio: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            failure_threshold: 5,
            open_timeout: Duration::from_secs(5 * 60),
            half_open_max_probes: 3,
            half_open_success_ratio: 0.5,
        }
    }
}

pub struct CircuitBreaker {
    state: AtomicU8,
    inner: Mutex<Inner>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed.to_u8()),
            inner: Mutex::new(Inner {
                failures: VecDeque::new(),
                opened_at: None,
                half_open_probes: 0,
                half_open_successes: 0,
            }),
            config,
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Called before issuing a request. Returns `false` when the breaker
    /// should reject the call outright (open, timeout not yet elapsed).
    /// Transitions `open` → `half-open` when the timeout has elapsed, and
    /// admits at most `half_open_max_probes` concurrent probes.
    pub fn try_acquire(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
                let elapsed = inner.opened_at.map(|t| t.elapsed() >= self.config.open_timeout).unwrap_or(true);
                if elapsed {
                    inner.half_open_probes = 0;
                    inner.half_open_successes = 0;
                    self.state.store(CircuitState::HalfOpen.to_u8(), Ordering::SeqCst);
                    inner.half_open_probes += 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
                if inner.half_open_probes < self.config.half_open_max_probes {
                    inner.half_open_probes += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&self) {
        match self.state() {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
                inner.half_open_successes += 1;
                let ratio = inner.half_open_successes as f64 / inner.half_open_probes.max(1) as f64;
                if inner.half_open_probes >= self.config.half_open_max_probes
                    && ratio >= self.config.half_open_success_ratio
                {
                    inner.failures.clear();
                    inner.opened_at = None;
                    self.state.store(CircuitState::Closed.to_u8(), Ordering::SeqCst);
                    tracing::info!("circuit breaker closed after successful probes");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn on_failure(&self) {
        match self.state() {
            CircuitState::Closed => {
                let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
                let now = Instant::now();
                inner.failures.push_back(now);
                while let Some(&front) = inner.failures.front() {
                    if now.duration_since(front) > self.config.window {
                        inner.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    inner.opened_at = Some(now);
                    self.state.store(CircuitState::Open.to_u8(), Ordering::SeqCst);
                    tracing::warn!(failures = inner.failures.len(), "circuit breaker opened");
                }
            }
            CircuitState::HalfOpen => {
                let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
                inner.opened_at = Some(Instant::now());
                inner.failures.clear();
                self.state.store(CircuitState::Open.to_u8(), Ordering::SeqCst);
                tracing::warn!("circuit breaker re-opened after half-open failure");
            }
            CircuitState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            window: Duration::from_secs(60),
            failure_threshold: 3,
            open_timeout: Duration::from_millis(50),
            half_open_max_probes: 2,
            half_open_success_ratio: 0.5,
        }
    }

    #[test]
    fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(test_config());
        assert_eq!(cb.state(), CircuitState::Closed);
        for _ in 0..3 {
            assert!(cb.try_acquire());
            cb.on_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.try_acquire());
    }

    #[test]
    fn half_open_closes_on_successful_probes() {
        let cb = CircuitBreaker::new(test_config());
        for _ in 0..3 {
            cb.try_acquire();
            cb.on_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(cb.try_acquire());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.on_success();
        assert!(cb.try_acquire());
        cb.on_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_reopens_on_failure() {
        let cb = CircuitBreaker::new(test_config());
        for _ in 0..3 {
            cb.try_acquire();
            cb.on_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(cb.try_acquire());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
