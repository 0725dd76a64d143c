//! Policy engine (spec §4.8): load a repository's `.flakeguard.yml`
//! (cached, ETag-conditional, defaulting safely), compile it, and evaluate
//! decisions for a batch of scored test cases.

pub mod cache;
pub mod config;
pub mod engine;

use chrono::Utc;

use crate::models::{FlakeScore, PolicyDecision, TestCase};
use crate::platform::{PlatformClient, RepoFile};

use cache::{CachedPolicy, PolicyCache};
use config::{parse_and_validate, PolicyConfig};
pub use engine::{CompiledPolicy, PolicyContext};

const POLICY_DOC_PATH: &str = ".flakeguard.yml";

/// Load the effective policy for `(owner, repo)`: a fresh cache hit short-
/// circuits everything else; otherwise this does a conditional fetch and
/// falls back to the last-known config (or the hard-coded default) on any
/// failure. Never returns an error — a broken or missing policy document
/// must not block ingestion (spec §4.8).
pub async fn load_policy(
    cache: &PolicyCache,
    client: &PlatformClient,
    owner: &str,
    repo: &str,
    installation_id: i64,
) -> CachedPolicy {
    let now = Utc::now();
    if let Some(fresh) = cache.get_fresh(owner, repo, now) {
        return fresh;
    }

    let prior_etag = cache.etag(owner, repo);
    let fetched = client
        .get_repository_file(owner, repo, POLICY_DOC_PATH, installation_id, prior_etag.as_deref())
        .await;

    let entry = match fetched {
        Ok(RepoFile::NotModified) => {
            // A 304 means our cached config is still correct; just refresh
            // the TTL clock. Fall back to an empty default if somehow
            // nothing was cached yet (conditional 304 with no prior entry
            // should not happen, but never crash the job over it).
            match cache.get_fresh(owner, repo, now - chrono::Duration::days(3650)) {
                Some(mut prior) => {
                    prior.fetched_at = now;
                    prior
                }
                None => CachedPolicy { config: PolicyConfig::default(), etag: prior_etag, source: "default", fetched_at: now },
            }
        }
        Ok(RepoFile::NotFound) => {
            CachedPolicy { config: PolicyConfig::default(), etag: None, source: "default", fetched_at: now }
        }
        Ok(RepoFile::Found { content, etag }) => match parse_and_validate(&content) {
            Ok(config) => CachedPolicy { config, etag, source: "repository", fetched_at: now },
            Err(errors) => {
                tracing::warn!(%owner, %repo, ?errors, "policy document failed validation, using defaults");
                CachedPolicy { config: PolicyConfig::default(), etag, source: "default", fetched_at: now }
            }
        },
        Err(e) => {
            tracing::warn!(%owner, %repo, error = %e, "policy document fetch failed, using defaults");
            CachedPolicy { config: PolicyConfig::default(), etag: prior_etag, source: "default", fetched_at: now }
        }
    };

    cache.put(owner, repo, entry.clone());
    entry
}

/// Evaluate every `(TestCase, FlakeScore)` pair for one repository against
/// its compiled policy.
pub fn evaluate_batch(
    policy: &CompiledPolicy,
    context: &PolicyContext,
    scored: &[(TestCase, FlakeScore, u32, u32)],
) -> Vec<PolicyDecision> {
    scored
        .iter()
        .map(|(test_case, score, total_runs, recent_failures)| {
            policy.evaluate(
                test_case.id,
                &test_case.full_name(),
                test_case.file.as_deref(),
                score,
                *total_runs,
                *recent_failures,
                context,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FlakeFeatures;

    fn test_case(id: i64, file: Option<&str>) -> TestCase {
        TestCase {
            id,
            repo_id: 1,
            suite_name: "Suite".into(),
            class_name: "com.acme.Widget".into(),
            name: "testSomething".into(),
            file: file.map(|s| s.to_string()),
        }
    }

    fn flake_score(id: i64, score: f64, confidence: f64) -> FlakeScore {
        FlakeScore { test_case_id: id, score, confidence, features: FlakeFeatures::default(), last_updated: Utc::now() }
    }

    #[test]
    fn evaluate_batch_produces_one_decision_per_input() {
        let policy = CompiledPolicy::compile(PolicyConfig::default()).unwrap();
        let context = PolicyContext { owner: "acme".into(), repo: "widget".into(), team_context: None, labels_present: vec![] };
        let scored = vec![
            (test_case(1, None), flake_score(1, 0.9, 0.9), 50u32, 40u32),
            (test_case(2, Some("vendor/Widget.java")), flake_score(2, 0.9, 0.9), 50u32, 40u32),
        ];
        let decisions = evaluate_batch(&policy, &context, &scored);
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[1].reason, "excluded");
    }
}
