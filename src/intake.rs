//! Webhook intake (spec §4.1): verify, dedupe, normalize, enqueue. The
//! signature-verification shape follows `servers.rs::github_webhook`'s
//! HMAC check; delivery dedupe and event normalization are new.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::{body::Bytes, Json};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use sqlx::PgPool;

use crate::broker::{self, EnqueueOptions, Job, Priority};
use crate::config::WEBHOOK_SECRET;
use crate::error::{AppError, AppResult};
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Verify `x-hub-signature-256` against the raw request body using a
/// constant-time MAC comparison (`Mac::verify_slice`, not string `==`).
fn verify_signature(secret: &str, signature_header: &str, body: &[u8]) -> bool {
    let Some(hex_sig) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&sig_bytes).is_ok()
}

/// Entry point wired to `POST /github/webhook`. Returns 202 for every
/// accepted, duplicate, or intentionally-ignored delivery so the platform
/// never retries a delivery FlakeGuard already understood (spec §4.1,
/// Scenario D).
pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<impl IntoResponse> {
    let pool = &state.pool;

    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::SignatureInvalid)?;
    if !verify_signature(&WEBHOOK_SECRET, signature, &body) {
        return Err(AppError::SignatureInvalid);
    }

    let delivery_id = headers
        .get("x-github-delivery")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::ValidationError("missing x-github-delivery".into()))?
        .to_string();

    if is_duplicate_delivery(pool, &delivery_id).await? {
        tracing::info!(delivery_id, "duplicate delivery, skipping");
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "success": true, "message": "duplicate delivery", "deliveryId": delivery_id })),
        ));
    }

    let event_name = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::ValidationError(format!("invalid JSON payload: {e}")))?;

    let message = match normalize(&event_name, &payload) {
        Some((job, priority)) => {
            broker::enqueue(
                pool,
                &job,
                EnqueueOptions { priority, idempotency_key: Some(delivery_id.clone()), ..Default::default() },
            )
            .await?;
            "accepted"
        }
        None => {
            tracing::debug!(event_name, "ignored event kind");
            "not processed"
        }
    };

    Ok((StatusCode::ACCEPTED, Json(json!({ "success": true, "message": message, "deliveryId": delivery_id }))))
}

async fn is_duplicate_delivery(pool: &PgPool, delivery_id: &str) -> Result<bool, sqlx::Error> {
    let row = sqlx::query("INSERT INTO webhook_deliveries (delivery_id) VALUES ($1) ON CONFLICT DO NOTHING RETURNING delivery_id")
        .bind(delivery_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_none())
}

fn str_field<'a>(payload: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut cur = payload;
    for key in path {
        cur = cur.get(key)?;
    }
    cur.as_str()
}

fn i64_field(payload: &Value, path: &[&str]) -> Option<i64> {
    let mut cur = payload;
    for key in path {
        cur = cur.get(key)?;
    }
    cur.as_i64()
}

/// Map a `(event, payload)` pair to the broker job it should enqueue, or
/// `None` when the event kind isn't one FlakeGuard acts on (spec §4.1:
/// unrecognized event kinds are acknowledged and dropped, never rejected).
fn normalize(event: &str, payload: &Value) -> Option<(Job, Priority)> {
    let repo_full_name = str_field(payload, &["repository", "full_name"]).map(|s| s.to_string());
    let platform_repo_id = i64_field(payload, &["repository", "id"]);
    let installation_id = i64_field(payload, &["installation", "id"]);

    match event {
        "workflow_run" => {
            let run_id = i64_field(payload, &["workflow_run", "id"])?;
            let action = str_field(payload, &["action"]).unwrap_or("");
            if action != "completed" {
                return None;
            }
            let head_sha = str_field(payload, &["workflow_run", "head_sha"]).map(|s| s.to_string());
            let head_branch = str_field(payload, &["workflow_run", "head_branch"]).map(|s| s.to_string());
            let conclusion = str_field(payload, &["workflow_run", "conclusion"]).map(|s| s.to_string());
            Some((
                Job::WorkflowRun { repo_full_name, platform_repo_id, installation_id, run_id, head_sha, head_branch, conclusion },
                Priority::Normal,
            ))
        }
        "check_run" => {
            let action = str_field(payload, &["action"]).unwrap_or("").to_string();
            if !matches!(action.as_str(), "requested_action" | "rerequested") {
                return None;
            }
            let check_run_id = i64_field(payload, &["check_run", "id"])?;
            Some((
                Job::CheckRunAction { repo_full_name, platform_repo_id, installation_id, check_run_id, action },
                Priority::High,
            ))
        }
        "workflow_job" => {
            let job_id = i64_field(payload, &["workflow_job", "id"])?;
            Some((Job::WorkflowJob { repo_full_name, platform_repo_id, installation_id, job_id }, Priority::Low))
        }
        "check_suite" => {
            let check_suite_id = i64_field(payload, &["check_suite", "id"])?;
            Some((Job::CheckSuite { repo_full_name, platform_repo_id, installation_id, check_suite_id }, Priority::Low))
        }
        "pull_request" => {
            let action = str_field(payload, &["action"]).unwrap_or("");
            if !matches!(action, "opened" | "synchronize" | "reopened" | "labeled") {
                return None;
            }
            let pr_number = i64_field(payload, &["pull_request", "number"])?;
            let labels = payload
                .get("pull_request")
                .and_then(|pr| pr.get("labels"))
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|l| l.get("name").and_then(|n| n.as_str()))
                        .map(|s| s.to_string())
                        .collect()
                })
                .unwrap_or_default();
            Some((
                Job::PullRequest { repo_full_name, platform_repo_id, installation_id, pr_number, labels },
                Priority::Normal,
            ))
        }
        "installation" | "installation_repositories" => {
            let action = str_field(payload, &["action"]).unwrap_or("unknown").to_string();
            let installation_id = installation_id?;
            Some((Job::Installation { installation_id, action }, Priority::Low))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signature_round_trips() {
        let secret = "s3cr3t";
        let body = br#"{"hello":"world"}"#;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let sig = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
        assert!(verify_signature(secret, &sig, body));
    }

    #[test]
    fn signature_rejects_tampering() {
        let secret = "s3cr3t";
        let body = br#"{"hello":"world"}"#;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let sig = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
        assert!(!verify_signature(secret, &sig, b"tampered body"));
    }

    #[test]
    fn signature_rejects_missing_prefix() {
        assert!(!verify_signature("s3cr3t", "not-a-valid-signature", b"body"));
    }

    #[test]
    fn normalize_ignores_incomplete_workflow_run() {
        let payload = json!({ "action": "requested", "repository": { "full_name": "o/r" } });
        assert!(normalize("workflow_run", &payload).is_none());
    }

    #[test]
    fn normalize_accepts_completed_workflow_run() {
        let payload = json!({
            "action": "completed",
            "workflow_run": { "id": 42, "head_sha": "deadbeef", "head_branch": "main", "conclusion": "failure" },
            "repository": { "id": 99, "full_name": "o/r" },
            "installation": { "id": 7 }
        });
        let (job, priority) = normalize("workflow_run", &payload).expect("should normalize");
        assert_eq!(priority, Priority::Normal);
        match job {
            Job::WorkflowRun { run_id, repo_full_name, platform_repo_id, installation_id, head_sha, head_branch, conclusion } => {
                assert_eq!(run_id, 42);
                assert_eq!(repo_full_name.as_deref(), Some("o/r"));
                assert_eq!(platform_repo_id, Some(99));
                assert_eq!(installation_id, Some(7));
                assert_eq!(head_sha.as_deref(), Some("deadbeef"));
                assert_eq!(head_branch.as_deref(), Some("main"));
                assert_eq!(conclusion.as_deref(), Some("failure"));
            }
            _ => panic!("expected WorkflowRun job"),
        }
    }

    #[test]
    fn normalize_check_run_requires_requested_action() {
        let payload = json!({ "action": "created", "check_run": { "id": 1 } });
        assert!(normalize("check_run", &payload).is_none());
    }

    #[test]
    fn normalize_accepts_rerequested_check_run() {
        let payload = json!({ "action": "rerequested", "check_run": { "id": 7 }, "repository": { "id": 1, "full_name": "o/r" } });
        let (job, priority) = normalize("check_run", &payload).expect("should normalize");
        assert_eq!(priority, Priority::High);
        match job {
            Job::CheckRunAction { check_run_id, action, .. } => {
                assert_eq!(check_run_id, 7);
                assert_eq!(action, "rerequested");
            }
            _ => panic!("expected CheckRunAction job"),
        }
    }

    #[test]
    fn normalize_unrecognized_event_is_none() {
        let payload = json!({});
        assert!(normalize("star", &payload).is_none());
    }
}
