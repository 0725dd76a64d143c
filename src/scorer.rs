//! Flakiness scorer (spec §4.7): a pure function from a bounded occurrence
//! history to a score, confidence, and feature vector. Modeled on
//! `intelligence.rs`'s weighted-feature scoring shape
//! (`build_base_score`/`compute_capability_score`), generalized from a
//! fixed weight set to policy-configurable weights.

use chrono::{DateTime, Utc};

use crate::models::{FlakeFeatures, FlakeScore, Occurrence, OccurrenceStatus};

pub const DEFAULT_WINDOW_RUNS: usize = 100;
pub const DEFAULT_LOOKBACK_DAYS: i64 = 14;
pub const DEFAULT_MIN_OCCURRENCES: usize = 5;

#[derive(Debug, Clone, Copy)]
pub struct ScoringWeights {
    pub fail_success_ratio: f64,
    pub rerun_pass_rate: f64,
    pub intermittency: f64,
    pub consecutive_failures: f64,
    pub message_variance: f64,
    pub clustering: f64,
}

impl Default for ScoringWeights {
    /// Defaults sum to 1.0 (spec §4.7).
    fn default() -> Self {
        Self {
            fail_success_ratio: 0.30,
            rerun_pass_rate: 0.25,
            intermittency: 0.20,
            consecutive_failures: 0.10,
            message_variance: 0.10,
            clustering: 0.05,
        }
    }
}

/// `score(history) -> {score, confidence, features}` (§4.7's
/// `recommendation` is produced one layer up, by the policy engine, which
/// has the thresholds this pure function deliberately does not know
/// about).
pub fn score(
    test_case_id: i64,
    history: &[Occurrence],
    window: usize,
    lookback_days: i64,
    min_occurrences: usize,
    weights: ScoringWeights,
    now: DateTime<Utc>,
) -> FlakeScore {
    let cutoff = now - chrono::Duration::days(lookback_days);
    // `history` arrives most-recent-first (see `occurrence_history`); take
    // the newest `window` within the lookback, then restore chronological
    // order for the transition-counting features below.
    let mut windowed: Vec<&Occurrence> =
        history.iter().filter(|o| o.created_at >= cutoff).take(window).collect();
    windowed.reverse();

    if windowed.len() < min_occurrences {
        return FlakeScore {
            test_case_id,
            score: 0.0,
            confidence: 0.0,
            features: FlakeFeatures::default(),
            last_updated: now,
        };
    }

    let features = compute_features(&windowed, window);
    let raw = weights.fail_success_ratio * features.fail_success_ratio
        + weights.rerun_pass_rate * features.rerun_pass_rate.unwrap_or(0.0)
        + weights.intermittency * features.intermittency
        + weights.consecutive_failures * features.consecutive_failures
        + weights.message_variance * features.message_variance
        + weights.clustering * (1.0 - features.clustering);
    let clamped_score = raw.clamp(0.0, 1.0);

    let confidence = compute_confidence(&windowed, window, weights);

    FlakeScore { test_case_id, score: clamped_score, confidence, features, last_updated: now }
}

fn compute_features(windowed: &[&Occurrence], window: usize) -> FlakeFeatures {
    let n = windowed.len();
    let failures = windowed.iter().filter(|o| o.status.is_failure_like()).count();
    let successes = windowed.iter().filter(|o| o.status == OccurrenceStatus::Passed).count();

    let fail_success_ratio = if failures + successes == 0 {
        0.0
    } else {
        failures as f64 / (failures + successes) as f64
    };

    // Reruns-after-failure-on-same-commit: approximate "same sha" as
    // "same run_id, later attempt number" since `Occurrence.run_id` is the
    // workflow run identity and attempts within a run share a commit.
    let mut failures_with_rerun = 0u32;
    let mut passes_after_failure = 0u32;
    for pair in windowed.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        if prev.run_id == next.run_id && next.attempt > prev.attempt && prev.status.is_failure_like() {
            failures_with_rerun += 1;
            if next.status == OccurrenceStatus::Passed {
                passes_after_failure += 1;
            }
        }
    }
    let rerun_pass_rate = if failures_with_rerun == 0 {
        None
    } else {
        Some(passes_after_failure as f64 / failures_with_rerun as f64)
    };

    let transitions = windowed.windows(2).filter(|pair| pair[0].status != pair[1].status).count();
    let intermittency = if n > 1 { transitions as f64 / (n - 1) as f64 } else { 0.0 };

    let mut trailing_failures = 0usize;
    for occ in windowed.iter().rev() {
        if occ.status.is_failure_like() {
            trailing_failures += 1;
        } else {
            break;
        }
    }
    let consecutive_failures = trailing_failures as f64 / window.max(1) as f64;

    let message_variance = if failures == 0 {
        0.0
    } else {
        let distinct: std::collections::HashSet<&str> = windowed
            .iter()
            .filter(|o| o.status.is_failure_like())
            .filter_map(|o| o.failure_msg_signature.as_deref())
            .collect();
        distinct.len() as f64 / failures as f64
    };

    let clustering = {
        let mut max_run = 0usize;
        let mut current_run = 0usize;
        let mut last_status: Option<OccurrenceStatus> = None;
        for occ in windowed.iter() {
            if last_status == Some(occ.status) {
                current_run += 1;
            } else {
                current_run = 1;
                last_status = Some(occ.status);
            }
            max_run = max_run.max(current_run);
        }
        max_run as f64 / n as f64
    };

    FlakeFeatures {
        fail_success_ratio,
        rerun_pass_rate,
        intermittency,
        consecutive_failures,
        message_variance,
        clustering,
    }
}

/// Monotonic in `n` (saturating at `n >= 30`) and in `1/variance` of
/// recent scores (spec §4.7). The windowed history is split into a
/// handful of consecutive sub-windows, each scored with the same
/// weighted-feature formula as the full window; the population variance
/// across those sub-scores stands in for "recent scores" volatility
/// without needing state carried across calls.
fn compute_confidence(windowed: &[&Occurrence], window: usize, weights: ScoringWeights) -> f64 {
    let n = windowed.len();
    let n_component = (n as f64 / 30.0).clamp(0.0, 1.0);

    const SUB_WINDOWS: usize = 4;
    let chunk_len = (n / SUB_WINDOWS).max(1);
    let sub_scores: Vec<f64> = windowed
        .chunks(chunk_len)
        .map(|chunk| {
            let features = compute_features(chunk, window);
            let raw = weights.fail_success_ratio * features.fail_success_ratio
                + weights.rerun_pass_rate * features.rerun_pass_rate.unwrap_or(0.0)
                + weights.intermittency * features.intermittency
                + weights.consecutive_failures * features.consecutive_failures
                + weights.message_variance * features.message_variance
                + weights.clustering * (1.0 - features.clustering);
            raw.clamp(0.0, 1.0)
        })
        .collect();

    let variance_component = if sub_scores.len() < 2 {
        1.0
    } else {
        let mean = sub_scores.iter().sum::<f64>() / sub_scores.len() as f64;
        let variance =
            sub_scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / sub_scores.len() as f64;
        1.0 / (1.0 + variance)
    };

    (n_component * variance_component).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn occ(run_id: i64, attempt: i32, status: OccurrenceStatus, created_at: DateTime<Utc>) -> Occurrence {
        Occurrence {
            id: 0,
            test_case_id: 1,
            run_id,
            status,
            duration_ms: Some(100),
            failure_msg_signature: if status.is_failure_like() { Some("AssertionError".into()) } else { None },
            stack_trace: None,
            attempt,
            created_at,
        }
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn below_min_occurrences_returns_zero_confidence() {
        let now = base_time();
        let history = vec![occ(1, 1, OccurrenceStatus::Failed, now)];
        let result = score(1, &history, DEFAULT_WINDOW_RUNS, DEFAULT_LOOKBACK_DAYS, 5, ScoringWeights::default(), now);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn score_and_confidence_stay_in_unit_interval() {
        let now = base_time();
        let mut history = Vec::new();
        for i in 0..40 {
            let status = if i % 3 == 0 { OccurrenceStatus::Failed } else { OccurrenceStatus::Passed };
            history.push(occ(i, 1, status, now - chrono::Duration::hours(i)));
        }
        let result = score(1, &history, DEFAULT_WINDOW_RUNS, DEFAULT_LOOKBACK_DAYS, 5, ScoringWeights::default(), now);
        assert!((0.0..=1.0).contains(&result.score));
        assert!((0.0..=1.0).contains(&result.confidence));
    }

    #[test]
    fn identical_history_is_bit_identical() {
        let now = base_time();
        let mut history = Vec::new();
        for i in 0..20 {
            let status = if i % 2 == 0 { OccurrenceStatus::Failed } else { OccurrenceStatus::Passed };
            history.push(occ(i, 1, status, now - chrono::Duration::hours(i)));
        }
        let a = score(1, &history, DEFAULT_WINDOW_RUNS, DEFAULT_LOOKBACK_DAYS, 5, ScoringWeights::default(), now);
        let b = score(1, &history, DEFAULT_WINDOW_RUNS, DEFAULT_LOOKBACK_DAYS, 5, ScoringWeights::default(), now);
        assert_eq!(a.score.to_bits(), b.score.to_bits());
        assert_eq!(a.confidence.to_bits(), b.confidence.to_bits());
    }

    #[test]
    fn confidence_saturates_at_30_occurrences() {
        let now = base_time();
        let mut history = Vec::new();
        for i in 0..60 {
            history.push(occ(i, 1, OccurrenceStatus::Passed, now - chrono::Duration::hours(i)));
        }
        let result = score(1, &history, DEFAULT_WINDOW_RUNS, DEFAULT_LOOKBACK_DAYS, 5, ScoringWeights::default(), now);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn no_reruns_observed_yields_none_not_zero() {
        let now = base_time();
        let mut history = Vec::new();
        for i in 0..10 {
            history.push(occ(i, 1, OccurrenceStatus::Passed, now - chrono::Duration::hours(i)));
        }
        let result = score(1, &history, DEFAULT_WINDOW_RUNS, DEFAULT_LOOKBACK_DAYS, 5, ScoringWeights::default(), now);
        assert_eq!(result.features.rerun_pass_rate, None);
    }
}
