//! Policy evaluation (spec §4.8): ordered rules turning a test case's
//! score and features into a `PolicyDecision`.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::json;

use crate::models::{Action, FlakeScore, Priority};

use super::config::{apply_team_override, PolicyConfig};

pub struct PolicyContext {
    pub owner: String,
    pub repo: String,
    pub team_context: Option<String>,
    pub labels_present: Vec<String>,
}

/// A `PolicyConfig` with its glob lists pre-compiled; build once per
/// (owner, repo) cache entry and reuse across every test case in a job.
pub struct CompiledPolicy {
    pub config: PolicyConfig,
    exempted_tests: GlobSet,
    exclude_paths: GlobSet,
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, Vec<String>> {
    let mut builder = GlobSetBuilder::new();
    let mut errors = Vec::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => errors.push(format!("invalid glob `{pattern}`: {e}")),
        }
    }
    if !errors.is_empty() {
        return Err(errors);
    }
    builder.build().map_err(|e| vec![e.to_string()])
}

impl CompiledPolicy {
    pub fn compile(config: PolicyConfig) -> Result<Self, Vec<String>> {
        let exempted_tests = build_globset(&config.exempted_tests)?;
        let exclude_paths = build_globset(&config.exclude_paths)?;
        Ok(Self { config, exempted_tests, exclude_paths })
    }

    /// Evaluate one `(TestCase, FlakeScore)` against this policy, applying
    /// the ordered rules in spec §4.8.
    pub fn evaluate(
        &self,
        test_case_id: i64,
        full_name: &str,
        source_path: Option<&str>,
        flake: &FlakeScore,
        total_runs: u32,
        recent_failures: u32,
        context: &PolicyContext,
    ) -> crate::models::PolicyDecision {
        let decision = |action: Action, priority: Priority, reason: &str, metadata: serde_json::Value| {
            crate::models::PolicyDecision {
                test_case_id,
                full_name: full_name.to_string(),
                action,
                priority,
                reason: reason.to_string(),
                metadata,
            }
        };

        // Rule 1: exemption.
        if self.exempted_tests.is_match(full_name) {
            return decision(Action::None, Priority::Low, "exempted", json!({}));
        }

        // Rule 2: path exclusion.
        if let Some(path) = source_path {
            if self.exclude_paths.is_match(path) {
                return decision(Action::None, Priority::Low, "excluded", json!({ "path": path }));
            }
        }

        // Rule 3: insufficient data.
        if total_runs < self.config.min_occurrences {
            return decision(Action::None, Priority::Low, "insufficient data", json!({ "totalRuns": total_runs }));
        }

        // Rule 4: too few recent failures.
        if recent_failures < self.config.min_recent_failures {
            return decision(
                Action::None,
                Priority::Low,
                "too few recent failures",
                json!({ "recentFailures": recent_failures }),
            );
        }

        // Rule 5: low confidence.
        if flake.confidence < self.config.confidence_threshold {
            return decision(Action::None, Priority::Low, "low confidence", json!({ "confidence": flake.confidence }));
        }

        // Rule 6: team override, shallow-merged over the base config.
        let effective = match context.team_context.as_deref().and_then(|team| self.config.team_overrides.get(team)) {
            Some(team_override) => apply_team_override(&self.config, team_override),
            None => self.config.clone(),
        };

        let priority = priority_for(flake.score, flake.confidence, &effective);

        // Rules 7-8: threshold-based action.
        if flake.score >= effective.flaky_threshold {
            let labels_satisfied =
                effective.labels_required.iter().all(|l| context.labels_present.iter().any(|p| p == l));
            if effective.auto_quarantine_enabled && labels_satisfied {
                return decision(
                    Action::Quarantine,
                    priority,
                    "score at or above flaky_threshold with required labels present",
                    json!({ "score": flake.score, "autoQuarantine": true }),
                );
            }
            // Score crosses the flaky threshold but auto-quarantine is
            // off, or required labels are missing: still recommend
            // quarantine so the check-run action lets a human confirm.
            return decision(
                Action::Quarantine,
                priority,
                "score at or above flaky_threshold, awaiting confirmation",
                json!({ "score": flake.score, "autoQuarantine": false }),
            );
        }

        if flake.score >= effective.warn_threshold {
            return decision(Action::Warn, priority, "score at or above warn_threshold", json!({ "score": flake.score }));
        }

        decision(Action::None, priority, "score below warn_threshold", json!({ "score": flake.score }))
    }
}

/// Priority derivation (spec §4.8): highest-severity bracket wins.
fn priority_for(score: f64, confidence: f64, config: &PolicyConfig) -> Priority {
    if score >= 0.85 && confidence >= 0.85 {
        Priority::Critical
    } else if score >= config.flaky_threshold {
        Priority::High
    } else if score >= config.warn_threshold {
        Priority::Medium
    } else {
        Priority::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FlakeFeatures;
    use chrono::Utc;

    fn flake_score(score: f64, confidence: f64) -> FlakeScore {
        FlakeScore { test_case_id: 1, score, confidence, features: FlakeFeatures::default(), last_updated: Utc::now() }
    }

    fn context() -> PolicyContext {
        PolicyContext { owner: "acme".into(), repo: "widget".into(), team_context: None, labels_present: vec![] }
    }

    fn scenario_f_config() -> CompiledPolicy {
        let config = PolicyConfig {
            flaky_threshold: 0.7,
            warn_threshold: 0.4,
            min_occurrences: 5,
            min_recent_failures: 2,
            confidence_threshold: 0.7,
            exempted_tests: vec!["legacy.*".to_string()],
            ..Default::default()
        };
        CompiledPolicy::compile(config).unwrap()
    }

    #[test]
    fn stable_test_yields_none_low() {
        let policy = scenario_f_config();
        let score = flake_score(0.1, 0.95);
        let decision = policy.evaluate(1, "stable", None, &score, 100, 1, &context());
        assert_eq!(decision.action, Action::None);
        assert_eq!(decision.priority, Priority::Low);
    }

    #[test]
    fn flaky_test_yields_quarantine_high() {
        let policy = scenario_f_config();
        let score = flake_score(0.8, 0.9);
        let decision = policy.evaluate(2, "flaky", None, &score, 50, 40, &context());
        assert_eq!(decision.action, Action::Quarantine);
        assert_eq!(decision.priority, Priority::High);
    }

    #[test]
    fn moderate_test_yields_warn_medium() {
        let policy = scenario_f_config();
        let score = flake_score(0.5, 0.8);
        let decision = policy.evaluate(3, "moderate", None, &score, 20, 10, &context());
        assert_eq!(decision.action, Action::Warn);
        assert_eq!(decision.priority, Priority::Medium);
    }

    #[test]
    fn exempted_test_yields_none_low_regardless_of_score() {
        let policy = scenario_f_config();
        let score = flake_score(0.9, 0.9);
        let decision = policy.evaluate(4, "legacy.old", None, &score, 20, 18, &context());
        assert_eq!(decision.action, Action::None);
        assert_eq!(decision.priority, Priority::Low);
        assert_eq!(decision.reason, "exempted");
    }

    #[test]
    fn excluded_path_short_circuits_before_thresholds() {
        let policy = scenario_f_config();
        let score = flake_score(0.95, 0.95);
        let decision = policy.evaluate(5, "whatever.Test", Some("vendor/lib/Test.java"), &score, 100, 50, &context());
        assert_eq!(decision.action, Action::None);
        assert_eq!(decision.reason, "excluded");
    }

    #[test]
    fn auto_quarantine_requires_all_labels_present() {
        let mut config = PolicyConfig { auto_quarantine_enabled: true, labels_required: vec!["flaky-ok".into()], ..Default::default() };
        config.flaky_threshold = 0.6;
        let policy = CompiledPolicy::compile(config).unwrap();
        let score = flake_score(0.9, 0.9);

        let without_label = policy.evaluate(6, "t", None, &score, 50, 10, &context());
        assert_eq!(without_label.action, Action::Quarantine);
        assert_eq!(without_label.reason, "score at or above flaky_threshold, awaiting confirmation");

        let mut ctx = context();
        ctx.labels_present.push("flaky-ok".into());
        let with_label = policy.evaluate(7, "t", None, &score, 50, 10, &ctx);
        assert_eq!(with_label.reason, "score at or above flaky_threshold with required labels present");
    }
}
