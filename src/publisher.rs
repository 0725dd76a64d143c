//! Decision publisher (spec §4.9): one *analysis* check run per head
//! commit, keyed on `(repoId, headSha)` so republishing updates rather than
//! duplicates, plus handling for the check run's action callbacks.
//!
//! Grounded on `backend/src/servers.rs`'s status-mutation-then-enqueue
//! handler shape and `backend/src/evaluations/scheduler.rs`'s
//! append-with-`CASE` idiom for append-only note history, reused here for
//! the check run's `notes` column.

use chrono::Utc;
use serde_json::{json, Value};
use sqlx::PgPool;

use crate::error::{AppError, AppResult};
use crate::models::{Action, CheckConclusion, CheckRunAction, PolicyDecision};
use crate::platform::PlatformClient;

const MAX_CANDIDATES_SHOWN: usize = 10;
const MAX_ACTIONS: usize = 3;
/// High-confidence threshold for offering the `quarantine` action, distinct
/// from the policy's own `flaky_threshold`/`confidence_threshold` since the
/// publisher only decides what to *offer*, not what already happened.
const HIGH_CONFIDENCE_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone)]
pub struct Candidate {
    pub full_name: String,
    pub fail_count: i64,
    pub rerun_pass_rate: Option<f64>,
    pub last_failed_run: Option<i64>,
    pub confidence: f64,
    pub score: f64,
}

fn escape_markdown(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '*' | '_' | '`' | '|' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn fmt_opt_rate(rate: Option<f64>) -> String {
    match rate {
        Some(r) => format!("{:.0}%", r * 100.0),
        None => "unknown".to_string(),
    }
}

fn fmt_opt_run(run_id: Option<i64>) -> String {
    run_id.map(|r| r.to_string()).unwrap_or_else(|| "n/a".to_string())
}

/// Markdown table of up to `MAX_CANDIDATES_SHOWN` highest-confidence
/// candidates, truncated with a "Showing top 10 of N" line.
pub fn render_summary(candidates: &[Candidate]) -> String {
    let mut sorted: Vec<&Candidate> = candidates.iter().collect();
    sorted.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));

    let mut out = String::new();
    out.push_str("| Test | Failures | Rerun pass rate | Last failed run | Confidence |\n");
    out.push_str("|---|---|---|---|---|\n");
    for candidate in sorted.iter().take(MAX_CANDIDATES_SHOWN) {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {:.0}% |\n",
            escape_markdown(&candidate.full_name),
            candidate.fail_count,
            fmt_opt_rate(candidate.rerun_pass_rate),
            fmt_opt_run(candidate.last_failed_run),
            candidate.confidence * 100.0,
        ));
    }
    if sorted.len() > MAX_CANDIDATES_SHOWN {
        out.push_str(&format!("\nShowing top {} of {}\n", MAX_CANDIDATES_SHOWN, sorted.len()));
    }
    out
}

/// Conclusion: `action_required` if any quarantine decision scored at or
/// above `flaky_threshold`, `neutral` if any warn, else `success`.
pub fn conclusion_for(decisions: &[PolicyDecision], flaky_threshold: f64, scores_by_case: &[(i64, f64)]) -> CheckConclusion {
    let score_of = |test_case_id: i64| scores_by_case.iter().find(|(id, _)| *id == test_case_id).map(|(_, s)| *s).unwrap_or(0.0);

    let has_quarantine_at_threshold =
        decisions.iter().any(|d| d.action == Action::Quarantine && score_of(d.test_case_id) >= flaky_threshold);
    if has_quarantine_at_threshold {
        return CheckConclusion::ActionRequired;
    }
    if decisions.iter().any(|d| d.action == Action::Warn) {
        return CheckConclusion::Neutral;
    }
    CheckConclusion::Success
}

/// Bounded action list (spec §4.9): `rerun_failed` → `quarantine` →
/// `open_issue`, at most 3, each only if applicable.
pub fn build_actions(failing_count: usize, high_confidence_count: usize, candidate_count: usize) -> Vec<CheckRunAction> {
    let mut actions = Vec::new();

    if failing_count > 0 {
        actions.push(CheckRunAction {
            identifier: "rerun_failed".to_string(),
            label: if failing_count == 1 { "Rerun 1 failed job".to_string() } else { format!("Rerun {failing_count} failed jobs") },
            description: "Re-run the jobs that failed in this run.".to_string(),
        });
    }
    if high_confidence_count > 0 && actions.len() < MAX_ACTIONS {
        actions.push(CheckRunAction {
            identifier: "quarantine".to_string(),
            label: if high_confidence_count == 1 {
                "Quarantine 1 flaky test".to_string()
            } else {
                format!("Quarantine {high_confidence_count} flaky tests")
            },
            description: "Suppress these tests from blocking status pending review.".to_string(),
        });
    }
    if candidate_count > 0 && actions.len() < MAX_ACTIONS {
        actions.push(CheckRunAction {
            identifier: "open_issue".to_string(),
            label: if candidate_count == 1 { "Open tracking issue".to_string() } else { "Open tracking issues".to_string() },
            description: "File a tracking issue for the flaky test candidates.".to_string(),
        });
    }

    actions.truncate(MAX_ACTIONS);
    actions
}

fn conclusion_str(conclusion: CheckConclusion) -> &'static str {
    match conclusion {
        CheckConclusion::Success => "success",
        CheckConclusion::Failure => "failure",
        CheckConclusion::Neutral => "neutral",
        CheckConclusion::Cancelled => "cancelled",
        CheckConclusion::Skipped => "skipped",
        CheckConclusion::TimedOut => "timed_out",
        CheckConclusion::ActionRequired => "action_required",
        CheckConclusion::Stale => "stale",
    }
}

/// Create or update the single check run for `(repo_id, head_sha)`.
pub async fn publish_decision(
    pool: &PgPool,
    client: &PlatformClient,
    owner: &str,
    repo: &str,
    repo_id: i64,
    head_sha: &str,
    installation_id: i64,
    candidates: &[Candidate],
    decisions: &[PolicyDecision],
    flaky_threshold: f64,
    scores_by_case: &[(i64, f64)],
    failing_job_count: usize,
) -> AppResult<()> {
    let existing: Option<(i64, Option<i64>)> =
        sqlx::query_as("SELECT id, platform_check_run_id FROM check_runs WHERE repo_id = $1 AND head_sha = $2")
            .bind(repo_id)
            .bind(head_sha)
            .fetch_optional(pool)
            .await?;

    let conclusion = conclusion_for(decisions, flaky_threshold, scores_by_case);
    let high_confidence_count = candidates.iter().filter(|c| c.confidence >= HIGH_CONFIDENCE_THRESHOLD).count();
    let actions = build_actions(failing_job_count, high_confidence_count, candidates.len());
    let summary = render_summary(candidates);
    let title = match conclusion {
        CheckConclusion::ActionRequired => "FlakeGuard: quarantine recommended".to_string(),
        CheckConclusion::Neutral => "FlakeGuard: flaky tests detected".to_string(),
        _ => "FlakeGuard: no flaky tests detected".to_string(),
    };

    let body = json!({
        "name": "flakeguard-analysis",
        "head_sha": head_sha,
        "status": "completed",
        "conclusion": conclusion_str(conclusion),
        "output": { "title": title, "summary": summary },
        "actions": actions.iter().map(|a| json!({
            "label": a.label,
            "identifier": a.identifier,
            "description": a.description,
        })).collect::<Vec<_>>(),
    });

    let existing_check_run_id = existing.as_ref().and_then(|(_, platform_id)| *platform_id);
    let response = client.create_or_update_check_run(owner, repo, existing_check_run_id, installation_id, &body).await?;
    let platform_check_run_id = response.get("id").and_then(Value::as_i64);

    let actions_json = serde_json::to_value(&actions).map_err(|e| AppError::Internal(e.to_string()))?;

    sqlx::query(
        "INSERT INTO check_runs (platform_check_run_id, repo_id, head_sha, status, conclusion, output_title, output_summary, actions, updated_at)
         VALUES ($1, $2, $3, 'completed', $4, $5, $6, $7, now())
         ON CONFLICT (repo_id, head_sha) DO UPDATE SET
            platform_check_run_id = COALESCE(EXCLUDED.platform_check_run_id, check_runs.platform_check_run_id),
            status = EXCLUDED.status,
            conclusion = EXCLUDED.conclusion,
            output_title = EXCLUDED.output_title,
            output_summary = EXCLUDED.output_summary,
            actions = EXCLUDED.actions,
            updated_at = now()",
    )
    .bind(platform_check_run_id)
    .bind(repo_id)
    .bind(head_sha)
    .bind(conclusion_str(conclusion))
    .bind(&title)
    .bind(&summary)
    .bind(actions_json)
    .execute(pool)
    .await?;

    Ok(())
}

/// Dispatch a check-run action callback (spec §4.9): perform the
/// corresponding Platform operation, then append a status note to the same
/// check run rather than creating a new one.
pub async fn handle_action_callback(
    pool: &PgPool,
    client: &PlatformClient,
    owner: &str,
    repo: &str,
    repo_id: i64,
    head_sha: &str,
    installation_id: i64,
    run_id: i64,
    action_identifier: &str,
) -> AppResult<()> {
    let note = match action_identifier {
        "rerun_failed" => {
            client.rerun_failed_jobs(owner, repo, run_id, installation_id).await?;
            format!("{} rerun_failed invoked for run {run_id}", Utc::now().to_rfc3339())
        }
        "quarantine" => {
            // Quarantine mutation itself is a policy/config-repo write,
            // modeled as a tracking issue until a config-PR flow exists.
            client
                .create_issue(
                    owner,
                    repo,
                    installation_id,
                    "FlakeGuard: quarantine recommended tests",
                    "FlakeGuard recommends quarantining the flagged flaky tests. See the analysis check run for details.",
                )
                .await?;
            format!("{} quarantine action invoked for run {run_id}", Utc::now().to_rfc3339())
        }
        "open_issue" => {
            client
                .create_issue(
                    owner,
                    repo,
                    installation_id,
                    "FlakeGuard: flaky test tracking",
                    "FlakeGuard detected flaky test candidates. See the analysis check run for details.",
                )
                .await?;
            format!("{} open_issue invoked for run {run_id}", Utc::now().to_rfc3339())
        }
        other => return Err(AppError::ValidationError(format!("unrecognized action identifier: {other}"))),
    };

    sqlx::query(
        "UPDATE check_runs SET
            notes = CASE WHEN notes IS NULL OR notes = '' THEN $3 ELSE notes || E'\n' || $3 END,
            updated_at = now()
         WHERE repo_id = $1 AND head_sha = $2",
    )
    .bind(repo_id)
    .bind(head_sha)
    .bind(&note)
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Priority;

    fn candidate(name: &str, confidence: f64) -> Candidate {
        Candidate { full_name: name.to_string(), fail_count: 3, rerun_pass_rate: Some(0.5), last_failed_run: Some(42), confidence, score: 0.8 }
    }

    #[test]
    fn summary_truncates_after_ten() {
        let candidates: Vec<Candidate> = (0..15).map(|i| candidate(&format!("test_{i}"), i as f64 / 15.0)).collect();
        let summary = render_summary(&candidates);
        assert!(summary.contains("Showing top 10 of 15"));
    }

    #[test]
    fn markdown_metacharacters_are_escaped() {
        let candidates = vec![candidate("Suite.`evil`_test[x]", 0.9)];
        let summary = render_summary(&candidates);
        assert!(summary.contains("\\`evil\\`"));
        assert!(summary.contains("\\[x\\]"));
    }

    #[test]
    fn actions_are_bounded_to_three_in_order() {
        let actions = build_actions(2, 3, 5);
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[0].identifier, "rerun_failed");
        assert_eq!(actions[1].identifier, "quarantine");
        assert_eq!(actions[2].identifier, "open_issue");
    }

    #[test]
    fn actions_are_plural_aware() {
        let actions = build_actions(1, 1, 1);
        assert_eq!(actions[0].label, "Rerun 1 failed job");
        assert_eq!(actions[1].label, "Quarantine 1 flaky test");
        assert_eq!(actions[2].label, "Open tracking issue");
    }

    #[test]
    fn no_candidates_and_no_failures_produces_no_actions() {
        let actions = build_actions(0, 0, 0);
        assert!(actions.is_empty());
    }

    #[test]
    fn conclusion_is_action_required_when_quarantine_meets_flaky_threshold() {
        let decisions = vec![PolicyDecision {
            test_case_id: 1,
            full_name: "t".into(),
            action: Action::Quarantine,
            priority: Priority::High,
            reason: "score at or above flaky_threshold".into(),
            metadata: json!({}),
        }];
        let conclusion = conclusion_for(&decisions, 0.6, &[(1, 0.8)]);
        assert_eq!(conclusion, CheckConclusion::ActionRequired);
    }

    #[test]
    fn conclusion_is_success_when_all_decisions_are_none() {
        let decisions = vec![PolicyDecision {
            test_case_id: 1,
            full_name: "t".into(),
            action: Action::None,
            priority: Priority::Low,
            reason: "score below warn_threshold".into(),
            metadata: json!({}),
        }];
        let conclusion = conclusion_for(&decisions, 0.6, &[(1, 0.1)]);
        assert_eq!(conclusion, CheckConclusion::Success);
    }
}
