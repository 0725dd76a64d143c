//! Job processing pipeline (spec §4.1-4.9): dispatches one reserved
//! broker job to its handler. Kept in the library crate, not the binary,
//! the way `ingestion.rs`'s job handling lives in `lib.rs` rather than
//! `main.rs` — so integration tests can drive the full ingestion path
//! against a mocked Platform API without booting the real process.

use crate::broker::Job;
use crate::config::RETENTION_DAYS;
use crate::db::{self, IngestionRepository};
use crate::error::AppError;
use crate::fetcher;
use crate::publisher;
use crate::scorer::{self, ScoringWeights};
use crate::telemetry::{self, JobKind};
use crate::AppState;

use sqlx::Row;

/// Dispatch one reserved job to its handler. Returns `Ok` with a summary
/// value on success, or `Err((reason, retryable))` for the broker to act
/// on (spec §4.2/§7).
pub async fn process_job(state: AppState, job: Job) -> Result<serde_json::Value, (String, bool)> {
    match job {
        Job::WorkflowRun { repo_full_name, platform_repo_id, installation_id, run_id, head_sha, head_branch, conclusion } => {
            let outcome = handle_workflow_run(&state, repo_full_name, platform_repo_id, installation_id, run_id, head_sha, head_branch, conclusion)
                .await
                .map_err(app_error_to_outcome)?;
            if let Err(error) = telemetry::validate_job_outcome_details(JobKind::WorkflowRun, Some(&outcome)) {
                return Err((error.to_string(), false));
            }
            Ok(outcome)
        }
        Job::CheckRunAction { repo_full_name, installation_id, check_run_id, action, .. } => {
            handle_check_run_action(&state, repo_full_name, installation_id, check_run_id, action)
                .await
                .map(|_| serde_json::json!({ "check_run_id": check_run_id }))
                .map_err(app_error_to_outcome)
        }
        Job::WorkflowJob { job_id, .. } => {
            tracing::debug!(job_id, "workflow_job event acknowledged, no action taken");
            Ok(serde_json::json!({ "job_id": job_id }))
        }
        Job::CheckSuite { check_suite_id, .. } => {
            tracing::debug!(check_suite_id, "check_suite event acknowledged, no action taken");
            Ok(serde_json::json!({ "check_suite_id": check_suite_id }))
        }
        Job::PullRequest { repo_full_name, pr_number, labels, .. } => {
            tracing::debug!(repo = ?repo_full_name, pr_number, ?labels, "pull_request event recorded for team context");
            Ok(serde_json::json!({ "pr_number": pr_number }))
        }
        Job::Installation { installation_id, action } => {
            tracing::info!(installation_id, action, "installation lifecycle event");
            Ok(serde_json::json!({ "installation_id": installation_id }))
        }
        Job::PruneOccurrences { repo_id } => {
            let repository = IngestionRepository::new(state.pool.clone());
            repository
                .prune_occurrences(repo_id, *RETENTION_DAYS)
                .await
                .map(|deleted| serde_json::json!({ "deleted": deleted }))
                .map_err(|e| (e.to_string(), true))
        }
    }
}

pub fn app_error_to_outcome(error: AppError) -> (String, bool) {
    let retryable = error.is_retryable();
    (error.to_string(), retryable)
}

/// The core ingestion pipeline (spec §4.1-4.9): fetch artifacts, parse,
/// persist, score every affected test case, evaluate policy, publish a
/// check run.
#[allow(clippy::too_many_arguments)]
pub async fn handle_workflow_run(
    state: &AppState,
    repo_full_name: Option<String>,
    platform_repo_id: Option<i64>,
    installation_id: Option<i64>,
    run_id: i64,
    head_sha: Option<String>,
    head_branch: Option<String>,
    conclusion: Option<String>,
) -> Result<serde_json::Value, AppError> {
    let (repo_full_name, platform_repo_id, installation_id) =
        match (repo_full_name, platform_repo_id, installation_id) {
            (Some(name), Some(repo_id), Some(inst_id)) => (name, repo_id, inst_id),
            _ => {
                return Err(AppError::ValidationError(
                    "Missing required repository or installation information".into(),
                ))
            }
        };
    let (owner, repo) = repo_full_name
        .split_once('/')
        .ok_or_else(|| AppError::ValidationError("repository full name is not owner/repo".into()))?;

    let repository = db::ensure_repository(&state.pool, &repo_full_name, platform_repo_id, installation_id).await?;

    if let Some(sha) = &head_sha {
        sqlx::query(
            r#"
            INSERT INTO workflow_runs (platform_run_id, repo_id, head_sha, head_branch, status, conclusion)
            VALUES ($1, $2, $3, $4, 'completed', $5)
            ON CONFLICT (platform_run_id) DO UPDATE SET status = excluded.status, conclusion = excluded.conclusion
            "#,
        )
        .bind(run_id)
        .bind(repository.id)
        .bind(sha)
        .bind(head_branch.as_deref().unwrap_or(""))
        .bind(&conclusion)
        .execute(&state.pool)
        .await?;
    }

    let outcome = fetcher::fetch_and_parse(&state.platform, Some(&repo_full_name), Some(installation_id), run_id)
        .await
        .map_err(|e| match e {
            fetcher::FetcherError::Platform(platform_err) => AppError::from(platform_err),
            fetcher::FetcherError::MissingRepositoryContext => {
                AppError::ValidationError("missing repository or installation context".into())
            }
        })?;

    let repo_store = IngestionRepository::new(state.pool.clone());
    let mut all_suites = Vec::new();
    for archive in &outcome.archives {
        for warning in &archive.warnings {
            tracing::warn!(artifact = %archive.artifact_name, warning, "parser warning");
        }
        all_suites.extend(archive.suites.iter().cloned());
    }
    if all_suites.is_empty() {
        tracing::info!(run_id, repo = %repo_full_name, "no test report artifacts found for run");
        return Ok(serde_json::json!({
            "processed_artifacts": outcome.processed_artifacts,
            "total_tests": 0,
            "failed_tests": 0,
        }));
    }
    repo_store.ingest_report(repository.id, run_id, &all_suites).await?;

    let total_tests: i32 = all_suites.iter().map(|s| s.totals.tests).sum();
    let failed_tests: i32 = all_suites.iter().map(|s| s.totals.failures + s.totals.errors).sum();

    let policy = crate::policy::load_policy(&state.policy_cache, &state.platform, owner, repo, installation_id).await;
    let compiled = crate::policy::CompiledPolicy::compile(policy.config.clone())
        .map_err(|errors| AppError::ValidationError(errors.join("; ")))?;
    let context = crate::policy::PolicyContext {
        owner: owner.to_string(),
        repo: repo.to_string(),
        team_context: None,
        labels_present: vec![],
    };

    let test_cases = repo_store.test_cases_for_repo(repository.id).await?;
    let now = chrono::Utc::now();
    let mut decisions = Vec::with_capacity(test_cases.len());
    let mut scores_by_case = Vec::with_capacity(test_cases.len());
    let mut candidates = Vec::new();

    for test_case in &test_cases {
        let history = repo_store
            .occurrence_history(test_case.id, policy.config.rolling_window_size as i64 * 2)
            .await?;
        let lookback = policy.config.lookback_days;
        let total_runs =
            history.iter().filter(|o| now - o.created_at <= chrono::Duration::days(lookback)).count() as u32;
        let recent_failures = history
            .iter()
            .filter(|o| now - o.created_at <= chrono::Duration::days(lookback) && o.status.is_failure_like())
            .count() as u32;

        let flake = scorer::score(
            test_case.id,
            &history,
            policy.config.rolling_window_size as usize,
            lookback,
            policy.config.min_occurrences as usize,
            ScoringWeights {
                fail_success_ratio: policy.config.scoring_weights.fail_success_ratio,
                rerun_pass_rate: policy.config.scoring_weights.rerun_pass_rate,
                intermittency: policy.config.scoring_weights.intermittency,
                consecutive_failures: policy.config.scoring_weights.consecutive_failures,
                message_variance: policy.config.scoring_weights.message_variance,
                clustering: policy.config.scoring_weights.clustering,
            },
            now,
        );

        sqlx::query(
            r#"
            INSERT INTO flake_scores (test_case_id, score, confidence, features, last_updated)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (test_case_id) DO UPDATE SET
                score = excluded.score, confidence = excluded.confidence,
                features = excluded.features, last_updated = excluded.last_updated
            "#,
        )
        .bind(test_case.id)
        .bind(flake.score)
        .bind(flake.confidence)
        .bind(serde_json::to_value(&flake.features).unwrap_or(serde_json::Value::Null))
        .bind(flake.last_updated)
        .execute(&state.pool)
        .await?;

        let decision =
            compiled.evaluate(test_case.id, &test_case.full_name(), test_case.file.as_deref(), &flake, total_runs, recent_failures, &context);

        if !matches!(decision.action, crate::models::Action::None) {
            let fail_count = history.iter().filter(|o| o.status.is_failure_like()).count() as i64;
            let last_failed_run = history.iter().find(|o| o.status.is_failure_like()).map(|o| o.run_id);
            candidates.push(publisher::Candidate {
                full_name: test_case.full_name(),
                fail_count,
                rerun_pass_rate: flake.features.rerun_pass_rate,
                last_failed_run,
                confidence: flake.confidence,
                score: flake.score,
            });
        }

        scores_by_case.push((test_case.id, flake.score));
        decisions.push(decision);
    }

    if let Some(sha) = head_sha {
        let failing_job_count =
            if conclusion.as_deref() == Some("failure") { 1 } else { 0 };
        publisher::publish_decision(
            &state.pool,
            &state.platform,
            owner,
            repo,
            repository.id,
            &sha,
            installation_id,
            &candidates,
            &decisions,
            policy.config.flaky_threshold,
            &scores_by_case,
            failing_job_count,
        )
        .await?;
    } else {
        tracing::warn!(run_id, "workflow_run event had no head_sha, skipping check-run publish");
    }

    Ok(serde_json::json!({
        "processed_artifacts": outcome.processed_artifacts,
        "total_tests": total_tests,
        "failed_tests": failed_tests,
    }))
}

pub async fn handle_check_run_action(
    state: &AppState,
    repo_full_name: Option<String>,
    installation_id: Option<i64>,
    check_run_id: i64,
    action: String,
) -> Result<(), AppError> {
    let (repo_full_name, installation_id) = match (repo_full_name, installation_id) {
        (Some(name), Some(id)) => (name, id),
        _ => return Err(AppError::ValidationError("check_run job missing repository context".into())),
    };
    let (owner, repo) = repo_full_name
        .split_once('/')
        .ok_or_else(|| AppError::ValidationError("repository full name is not owner/repo".into()))?;

    let repository = db::repository_by_full_name(&state.pool, &repo_full_name).await?.ok_or(AppError::NotFound)?;

    let row = sqlx::query("SELECT head_sha FROM check_runs WHERE repo_id = $1 AND platform_check_run_id = $2")
        .bind(repository.id)
        .bind(check_run_id)
        .fetch_optional(&state.pool)
        .await?;
    let Some(row) = row else {
        return Err(AppError::NotFound);
    };
    let head_sha: String = row.get("head_sha");

    let run_row = sqlx::query(
        "SELECT platform_run_id FROM workflow_runs WHERE repo_id = $1 AND head_sha = $2 ORDER BY received_at DESC LIMIT 1",
    )
    .bind(repository.id)
    .bind(&head_sha)
    .fetch_optional(&state.pool)
    .await?;
    let run_id: i64 = match run_row {
        Some(row) => row.get("platform_run_id"),
        None => return Err(AppError::NotFound),
    };

    publisher::handle_action_callback(
        &state.pool,
        &state.platform,
        owner,
        repo,
        repository.id,
        &head_sha,
        installation_id,
        run_id,
        &action,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_repository_context_is_a_validation_error_not_retryable() {
        let error = handle_workflow_run_missing_context_error();
        assert!(matches!(error, AppError::ValidationError(_)));
        let (reason, retryable) = app_error_to_outcome(error);
        assert!(reason.contains("Missing required repository or installation information"));
        assert!(!retryable);
    }

    fn handle_workflow_run_missing_context_error() -> AppError {
        AppError::ValidationError("Missing required repository or installation information".into())
    }
}
