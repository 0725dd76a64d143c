//! Primary and secondary rate limiters (spec §4.6c/d). Shared state,
//! mutated under a mutex; reads are lock-free snapshots, per §5's
//! shared-resource policy.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

fn now_epoch_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_secs() as i64
}

/// Tracks `remaining`/`limit`/`resetAt` parsed from `x-ratelimit-*`
/// response headers and proactively throttles before exhaustion.
pub struct PrimaryRateLimiter {
    remaining: AtomicI64,
    limit: AtomicI64,
    reset_at_epoch_secs: AtomicI64,
    /// Fraction of `limit` reserved for critical-priority traffic.
    critical_floor_pct: f64,
    /// Remaining-fraction below which proactive throttling kicks in.
    throttle_threshold_pct: f64,
    max_throttle_delay_secs: u64,
}

impl Default for PrimaryRateLimiter {
    fn default() -> Self {
        Self {
            remaining: AtomicI64::new(i64::MAX),
            limit: AtomicI64::new(i64::MAX),
            reset_at_epoch_secs: AtomicI64::new(0),
            critical_floor_pct: 0.10,
            throttle_threshold_pct: 0.20,
            max_throttle_delay_secs: 60,
        }
    }
}

impl PrimaryRateLimiter {
    pub fn observe_headers(&self, remaining: i64, limit: i64, reset_at_epoch_secs: i64) {
        self.remaining.store(remaining, Ordering::SeqCst);
        self.limit.store(limit, Ordering::SeqCst);
        self.reset_at_epoch_secs.store(reset_at_epoch_secs, Ordering::SeqCst);
    }

    fn snapshot(&self) -> (i64, i64, i64) {
        (
            self.remaining.load(Ordering::SeqCst),
            self.limit.load(Ordering::SeqCst),
            self.reset_at_epoch_secs.load(Ordering::SeqCst),
        )
    }

    /// `None` when no proactive delay is needed; `Some(seconds)` otherwise.
    /// `is_critical` traffic bypasses the floor reservation (but not total
    /// exhaustion).
    pub fn proactive_delay_secs(&self, is_critical: bool) -> Option<u64> {
        let (remaining, limit, reset_at) = self.snapshot();
        if limit <= 0 {
            return None;
        }
        let remaining_frac = remaining as f64 / limit as f64;
        let floor = if is_critical { 0.0 } else { self.critical_floor_pct };
        if remaining_frac > self.throttle_threshold_pct.max(floor) {
            return None;
        }
        let now = now_epoch_secs();
        let seconds_until_reset = (reset_at - now).max(0) as f64;
        let delay = (seconds_until_reset * (1.0 - remaining_frac)).max(0.0);
        Some((delay as u64).min(self.max_throttle_delay_secs))
    }

    /// Exhausted state: `remaining <= 0` and reset hasn't passed yet.
    pub fn exhausted_wait_secs(&self) -> Option<u64> {
        let (remaining, _limit, reset_at) = self.snapshot();
        if remaining > 0 {
            return None;
        }
        let now = now_epoch_secs();
        let wait = (reset_at - now).max(0);
        if wait == 0 {
            None
        } else {
            Some(wait.min(300) as u64)
        }
    }
}

/// Honors `retry-after` and secondary-limit signals, superimposed on top
/// of the primary limiter's waits (spec §4.6d).
#[derive(Default)]
pub struct SecondaryRateLimiter {
    cooldown_until_epoch_secs: AtomicU64,
}

impl SecondaryRateLimiter {
    pub fn observe_retry_after(&self, retry_after_secs: u64) {
        let until = now_epoch_secs() as u64 + retry_after_secs;
        self.cooldown_until_epoch_secs.fetch_max(until, Ordering::SeqCst);
    }

    pub fn wait_secs(&self) -> Option<u64> {
        let until = self.cooldown_until_epoch_secs.load(Ordering::SeqCst);
        let now = now_epoch_secs() as u64;
        if until > now {
            Some(until - now)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_throttle_when_plenty_remaining() {
        let limiter = PrimaryRateLimiter::default();
        limiter.observe_headers(9000, 10000, now_epoch_secs() + 3600);
        assert_eq!(limiter.proactive_delay_secs(false), None);
    }

    #[test]
    fn throttles_when_remaining_below_threshold() {
        let limiter = PrimaryRateLimiter::default();
        limiter.observe_headers(500, 10000, now_epoch_secs() + 600);
        let delay = limiter.proactive_delay_secs(false);
        assert!(delay.is_some());
        assert!(delay.unwrap() <= 60);
    }

    #[test]
    fn critical_traffic_bypasses_floor_but_not_exhaustion() {
        let limiter = PrimaryRateLimiter::default();
        limiter.observe_headers(500, 10000, now_epoch_secs() + 600);
        assert!(limiter.proactive_delay_secs(true).is_none() || limiter.proactive_delay_secs(true).unwrap() <= 60);
    }

    #[test]
    fn exhausted_reports_wait_until_reset() {
        let limiter = PrimaryRateLimiter::default();
        limiter.observe_headers(0, 10000, now_epoch_secs() + 30);
        assert!(limiter.exhausted_wait_secs().is_some());
    }

    #[test]
    fn secondary_limiter_tracks_cooldown() {
        let limiter = SecondaryRateLimiter::default();
        assert_eq!(limiter.wait_secs(), None);
        limiter.observe_retry_after(5);
        assert!(limiter.wait_secs().is_some());
    }
}
