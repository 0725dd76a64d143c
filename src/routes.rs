//! HTTP surface (spec §6). Flat `Router::new().route(...)` composition,
//! matching `backend/src/routes.rs`'s style.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_prometheus::PrometheusMetricLayer;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::RETENTION_DAYS;
use crate::db::IngestionRepository;
use crate::error::{AppError, AppResult};
use crate::intake;
use crate::policy::{config::PolicyConfig, CompiledPolicy, PolicyContext};
use crate::scorer::{self, ScoringWeights};
use crate::AppState;

pub fn build_router(state: AppState) -> Router {
    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    Router::new()
        .route("/github/webhook", post(intake::handle_webhook))
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .route("/health/ready", get(health_ready))
        .route("/v1/quarantine/plan", post(quarantine_plan))
        .route("/v1/quarantine/policy", get(quarantine_policy))
        .route("/metrics", get(move || async move { metric_handle.render() }))
        .layer(prometheus_layer)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn health_detailed(State(state): State<AppState>) -> impl IntoResponse {
    let database = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();
    let github = !matches!(state.platform.circuit_state(), crate::platform::circuit_breaker::CircuitState::Open);
    let status = if database { "ok" } else { "degraded" };
    Json(json!({
        "status": status,
        "checks": { "database": database, "github": github, "memory": true },
    }))
}

async fn health_ready(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => (axum::http::StatusCode::OK, Json(json!({ "status": "ready", "checks": { "database": true } }))),
        Err(_) => (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready", "checks": { "database": false } })),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct QuarantinePlanRequest {
    #[serde(rename = "repositoryId")]
    repository_id: i64,
    policy: Option<Value>,
    #[serde(rename = "lookbackDays")]
    lookback_days: Option<i64>,
    #[serde(rename = "includeAnnotations")]
    include_annotations: Option<bool>,
}

/// `POST /v1/quarantine/plan` (spec §6): score and evaluate every test case
/// in a repository against either the supplied inline policy override or
/// the cached/default policy, without publishing anything.
async fn quarantine_plan(State(state): State<AppState>, Json(request): Json<QuarantinePlanRequest>) -> AppResult<impl IntoResponse> {
    if let Some(days) = request.lookback_days {
        if !(1..=90).contains(&days) {
            return Err(AppError::ValidationError("lookbackDays must be in 1..=90".into()));
        }
    }

    let repo_row: Option<(i64, String)> =
        sqlx::query_as("SELECT id, full_name FROM repositories WHERE id = $1").bind(request.repository_id).fetch_optional(&state.pool).await?;
    let Some((repo_id, full_name)) = repo_row else {
        return Err(AppError::NotFound);
    };
    let (owner, repo) = full_name
        .split_once('/')
        .ok_or_else(|| AppError::Internal(format!("stored repository full_name is not owner/repo: {full_name}")))?;

    let config = match request.policy {
        Some(value) => serde_json::from_value::<PolicyConfig>(value)
            .map_err(|e| AppError::ValidationError(format!("invalid policy override: {e}")))?,
        None => {
            let now = chrono::Utc::now();
            state.policy_cache.get_fresh(owner, repo, now).map(|c| c.config).unwrap_or_default()
        }
    };
    let lookback_days = request.lookback_days.unwrap_or(config.lookback_days);
    let compiled = CompiledPolicy::compile(config.clone()).map_err(|errors| AppError::ValidationError(errors.join("; ")))?;
    let context = PolicyContext { owner: owner.to_string(), repo: repo.to_string(), team_context: None, labels_present: vec![] };

    let repository = IngestionRepository::new(state.pool.clone());
    let test_cases = repository.test_cases_for_repo(repo_id).await?;

    let now = chrono::Utc::now();
    let mut decisions = Vec::with_capacity(test_cases.len());
    for test_case in &test_cases {
        let history = repository.occurrence_history(test_case.id, config.rolling_window_size as i64 * 2).await?;
        let total_runs = history.iter().filter(|o| now - o.created_at <= chrono::Duration::days(lookback_days)).count() as u32;
        let recent_failures = history
            .iter()
            .filter(|o| now - o.created_at <= chrono::Duration::days(lookback_days) && o.status.is_failure_like())
            .count() as u32;

        let flake = scorer::score(
            test_case.id,
            &history,
            config.rolling_window_size as usize,
            lookback_days,
            config.min_occurrences as usize,
            ScoringWeights {
                fail_success_ratio: config.scoring_weights.fail_success_ratio,
                rerun_pass_rate: config.scoring_weights.rerun_pass_rate,
                intermittency: config.scoring_weights.intermittency,
                consecutive_failures: config.scoring_weights.consecutive_failures,
                message_variance: config.scoring_weights.message_variance,
                clustering: config.scoring_weights.clustering,
            },
            now,
        );

        let decision = compiled.evaluate(test_case.id, &test_case.full_name(), test_case.file.as_deref(), &flake, total_runs, recent_failures, &context);

        if request.include_annotations.unwrap_or(false) {
            decisions.push(json!({ "decision": decision, "score": flake.score, "confidence": flake.confidence, "features": flake.features }));
        } else {
            decisions.push(serde_json::to_value(&decision).unwrap_or(Value::Null));
        }
    }

    Ok(Json(json!({ "repositoryId": repo_id, "decisions": decisions })))
}

async fn quarantine_policy() -> impl IntoResponse {
    Json(json!({ "policy": PolicyConfig::default() }))
}

/// Background sweep: prune retention-expired occurrences for every
/// repository, scheduled periodically alongside the broker workers.
pub async fn prune_all_repositories(pool: &sqlx::PgPool) -> Result<u64, sqlx::Error> {
    let repo_ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM repositories").fetch_all(pool).await?;
    let repository = IngestionRepository::new(pool.clone());
    let mut total = 0u64;
    for repo_id in repo_ids {
        total += repository.prune_occurrences(repo_id, *RETENTION_DAYS).await?;
    }
    Ok(total)
}

