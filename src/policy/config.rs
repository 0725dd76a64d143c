//! Policy configuration document (spec §4.8): `.flakeguard.yml`, parsed
//! with defaults for every field and explicit validation. Shaped after
//! `Rul1an-assay/assay-policy/src/tiers.rs`'s `#[serde(default)]`
//! policy-document convention.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_flaky_threshold() -> f64 {
    0.6
}
fn default_warn_threshold() -> f64 {
    0.3
}
fn default_min_occurrences() -> u32 {
    5
}
fn default_min_recent_failures() -> u32 {
    2
}
fn default_lookback_days() -> i64 {
    14
}
fn default_rolling_window_size() -> u32 {
    100
}
fn default_confidence_threshold() -> f64 {
    0.7
}
fn default_exclude_paths() -> Vec<String> {
    vec![
        "**/fixtures/**".to_string(),
        "**/vendor/**".to_string(),
        "**/node_modules/**".to_string(),
        "**/docs/**".to_string(),
    ]
}
fn default_quarantine_duration_days() -> u32 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringWeightsConfig {
    #[serde(default = "default_weight_fail_success_ratio")]
    pub fail_success_ratio: f64,
    #[serde(default = "default_weight_rerun_pass_rate")]
    pub rerun_pass_rate: f64,
    #[serde(default = "default_weight_intermittency")]
    pub intermittency: f64,
    #[serde(default = "default_weight_consecutive_failures")]
    pub consecutive_failures: f64,
    #[serde(default = "default_weight_message_variance")]
    pub message_variance: f64,
    #[serde(default = "default_weight_clustering")]
    pub clustering: f64,
}

fn default_weight_fail_success_ratio() -> f64 {
    0.30
}
fn default_weight_rerun_pass_rate() -> f64 {
    0.25
}
fn default_weight_intermittency() -> f64 {
    0.20
}
fn default_weight_consecutive_failures() -> f64 {
    0.10
}
fn default_weight_message_variance() -> f64 {
    0.10
}
fn default_weight_clustering() -> f64 {
    0.05
}

impl Default for ScoringWeightsConfig {
    fn default() -> Self {
        Self {
            fail_success_ratio: default_weight_fail_success_ratio(),
            rerun_pass_rate: default_weight_rerun_pass_rate(),
            intermittency: default_weight_intermittency(),
            consecutive_failures: default_weight_consecutive_failures(),
            message_variance: default_weight_message_variance(),
            clustering: default_weight_clustering(),
        }
    }
}

/// Field-level overrides recognized for a team; a subset of the top-level
/// options (spec §4.8).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeamOverride {
    pub flaky_threshold: Option<f64>,
    pub warn_threshold: Option<f64>,
    pub min_occurrences: Option<u32>,
    pub min_recent_failures: Option<u32>,
    pub confidence_threshold: Option<f64>,
    pub auto_quarantine_enabled: Option<bool>,
    pub labels_required: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_flaky_threshold")]
    pub flaky_threshold: f64,
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: f64,
    #[serde(default = "default_min_occurrences")]
    pub min_occurrences: u32,
    #[serde(default = "default_min_recent_failures")]
    pub min_recent_failures: u32,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
    #[serde(default = "default_rolling_window_size")]
    pub rolling_window_size: u32,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_exclude_paths")]
    pub exclude_paths: Vec<String>,
    #[serde(default)]
    pub exempted_tests: Vec<String>,
    #[serde(default)]
    pub labels_required: Vec<String>,
    #[serde(default)]
    pub auto_quarantine_enabled: bool,
    #[serde(default)]
    pub scoring_weights: ScoringWeightsConfig,
    #[serde(default)]
    pub team_overrides: HashMap<String, TeamOverride>,
    #[serde(default = "default_quarantine_duration_days")]
    pub quarantine_duration_days: u32,
    #[serde(default)]
    pub team_notifications: serde_json::Value,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            flaky_threshold: default_flaky_threshold(),
            warn_threshold: default_warn_threshold(),
            min_occurrences: default_min_occurrences(),
            min_recent_failures: default_min_recent_failures(),
            lookback_days: default_lookback_days(),
            rolling_window_size: default_rolling_window_size(),
            confidence_threshold: default_confidence_threshold(),
            exclude_paths: default_exclude_paths(),
            exempted_tests: Vec::new(),
            labels_required: Vec::new(),
            auto_quarantine_enabled: false,
            scoring_weights: ScoringWeightsConfig::default(),
            team_overrides: HashMap::new(),
            quarantine_duration_days: default_quarantine_duration_days(),
            team_notifications: serde_json::Value::Null,
        }
    }
}

/// Parse and validate a `.flakeguard.yml` document. Per §8's testable
/// property: either returns a fully-defaulted valid config, or a
/// non-empty list of errors — never both.
pub fn parse_and_validate(yaml: &str) -> Result<PolicyConfig, Vec<String>> {
    let config: PolicyConfig = serde_yaml::from_str(yaml).map_err(|e| vec![format!("invalid yaml: {e}")])?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &PolicyConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if !(0.0..=1.0).contains(&config.flaky_threshold) {
        errors.push("flaky_threshold must be in [0,1]".to_string());
    }
    if !(0.0..=1.0).contains(&config.warn_threshold) {
        errors.push("warn_threshold must be in [0,1]".to_string());
    }
    if config.warn_threshold >= config.flaky_threshold {
        errors.push("warn_threshold must be less than flaky_threshold".to_string());
    }
    if config.min_occurrences < 1 {
        errors.push("min_occurrences must be >= 1".to_string());
    }
    if !(1..=365).contains(&config.lookback_days) {
        errors.push("lookback_days must be in 1..=365".to_string());
    }
    if config.rolling_window_size < 10 {
        errors.push("rolling_window_size must be >= 10".to_string());
    }
    if !(0.0..=1.0).contains(&config.confidence_threshold) {
        errors.push("confidence_threshold must be in [0,1]".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Shallow field-level merge of a team override on top of the base
/// config (spec §4.8 rule 6).
pub fn apply_team_override(base: &PolicyConfig, team_override: &TeamOverride) -> PolicyConfig {
    let mut merged = base.clone();
    if let Some(v) = team_override.flaky_threshold {
        merged.flaky_threshold = v;
    }
    if let Some(v) = team_override.warn_threshold {
        merged.warn_threshold = v;
    }
    if let Some(v) = team_override.min_occurrences {
        merged.min_occurrences = v;
    }
    if let Some(v) = team_override.min_recent_failures {
        merged.min_recent_failures = v;
    }
    if let Some(v) = team_override.confidence_threshold {
        merged.confidence_threshold = v;
    }
    if let Some(v) = team_override.auto_quarantine_enabled {
        merged.auto_quarantine_enabled = v;
    }
    if let Some(ref v) = team_override.labels_required {
        merged.labels_required = v.clone();
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_fully_defaulted() {
        let config = parse_and_validate("{}").expect("empty doc should validate with defaults");
        assert_eq!(config.flaky_threshold, 0.6);
        assert_eq!(config.min_occurrences, 5);
    }

    #[test]
    fn invalid_threshold_ordering_is_rejected() {
        let yaml = "flaky_threshold: 0.3\nwarn_threshold: 0.5\n";
        let errors = parse_and_validate(yaml).expect_err("warn >= flaky should fail validation");
        assert!(!errors.is_empty());
    }

    #[test]
    fn malformed_yaml_is_rejected_not_panicked() {
        let errors = parse_and_validate(":::not yaml:::").expect_err("malformed yaml should fail");
        assert!(!errors.is_empty());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let yaml = "flaky_threshold: 0.7\nsome_unknown_key: true\n";
        let config = parse_and_validate(yaml).expect("unknown keys should be ignored, not rejected");
        assert_eq!(config.flaky_threshold, 0.7);
    }

    #[test]
    fn team_override_merges_shallowly() {
        let base = PolicyConfig::default();
        let over = TeamOverride { flaky_threshold: Some(0.9), ..Default::default() };
        let merged = apply_team_override(&base, &over);
        assert_eq!(merged.flaky_threshold, 0.9);
        assert_eq!(merged.warn_threshold, base.warn_threshold);
    }
}
