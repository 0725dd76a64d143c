//! Per-(owner, repo) policy cache with a 5-minute TTL plus ETag-based
//! invalidation (spec §4.8). Shared, write-through under a per-key lock,
//! readers get the most recent snapshot — matching §5's cache policy and
//! the `dashmap`-guarded shared-state convention used for
//! `backend/src/policy.rs`'s per-(owner,repo) keyed state.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use super::config::PolicyConfig;

const CACHE_TTL: i64 = 5 * 60;

#[derive(Debug, Clone)]
pub struct CachedPolicy {
    pub config: PolicyConfig,
    pub etag: Option<String>,
    /// `"repository"` when parsed from `.flakeguard.yml`, `"default"`
    /// when the document was missing, malformed, or failed validation.
    pub source: &'static str,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct PolicyCache {
    entries: DashMap<(String, String), CachedPolicy>,
}

impl PolicyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_fresh(&self, owner: &str, repo: &str, now: DateTime<Utc>) -> Option<CachedPolicy> {
        let entry = self.entries.get(&(owner.to_string(), repo.to_string()))?;
        if now - entry.fetched_at < Duration::seconds(CACHE_TTL) {
            Some(entry.clone())
        } else {
            None
        }
    }

    pub fn etag(&self, owner: &str, repo: &str) -> Option<String> {
        self.entries.get(&(owner.to_string(), repo.to_string())).and_then(|e| e.etag.clone())
    }

    pub fn put(&self, owner: &str, repo: &str, entry: CachedPolicy) {
        self.entries.insert((owner.to_string(), repo.to_string()), entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_entry_is_returned_within_ttl() {
        let cache = PolicyCache::new();
        let now = Utc::now();
        cache.put(
            "acme",
            "widget",
            CachedPolicy { config: PolicyConfig::default(), etag: Some("abc".into()), source: "repository", fetched_at: now },
        );
        assert!(cache.get_fresh("acme", "widget", now).is_some());
    }

    #[test]
    fn stale_entry_is_not_returned() {
        let cache = PolicyCache::new();
        let old = Utc::now() - Duration::minutes(10);
        cache.put(
            "acme",
            "widget",
            CachedPolicy { config: PolicyConfig::default(), etag: None, source: "default", fetched_at: old },
        );
        assert!(cache.get_fresh("acme", "widget", Utc::now()).is_none());
    }
}
