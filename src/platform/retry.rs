//! Retry policy (spec §4.6e): exponential backoff with jitter over a
//! closed set of retryable conditions.

use rand::Rng;

pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_secs: f64,
    pub cap_secs: f64,
    pub multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 3, base_secs: 1.0, cap_secs: 30.0, multiplier: 2.0, jitter_factor: 0.1 }
    }
}

impl RetryConfig {
    /// `attempt` is 1-based (the attempt that just failed).
    pub fn delay_secs(&self, attempt: u32) -> f64 {
        let raw = self.base_secs * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = raw.min(self.cap_secs);
        let jitter_span = capped * self.jitter_factor;
        let mut rng = rand::thread_rng();
        (capped + rng.gen_range(-jitter_span..=jitter_span)).max(0.0)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Network-error classification for the retry layer (spec §4.6e). The
/// caller maps `reqwest::Error` into this before consulting the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkFailure {
    ConnectionReset,
    DnsNotFound,
    ConnectionRefused,
    TimedOut,
    Other,
}

impl NetworkFailure {
    pub fn is_retryable(self) -> bool {
        !matches!(self, NetworkFailure::Other)
    }

    pub fn classify(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return NetworkFailure::TimedOut;
        }
        if err.is_connect() {
            let msg = err.to_string();
            if msg.contains("refused") {
                return NetworkFailure::ConnectionRefused;
            }
            if msg.contains("reset") {
                return NetworkFailure::ConnectionReset;
            }
            if msg.contains("dns") || msg.contains("resolve") {
                return NetworkFailure::DnsNotFound;
            }
            return NetworkFailure::ConnectionReset;
        }
        NetworkFailure::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let cfg = RetryConfig::default();
        let d1 = cfg.delay_secs(1);
        assert!(d1 >= 0.9 && d1 <= 1.1);
        let d5 = cfg.delay_secs(5);
        assert!(d5 <= cfg.cap_secs * (1.0 + cfg.jitter_factor) + 0.001);
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let cfg = RetryConfig::default();
        assert!(cfg.should_retry(1));
        assert!(cfg.should_retry(2));
        assert!(!cfg.should_retry(3));
    }
}
