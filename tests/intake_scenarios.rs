//! HTTP-level coverage of the webhook intake surface (spec §8, Scenarios
//! B and C), exercised through the real router rather than the bare
//! `normalize`/`verify_signature` functions already unit-tested in
//! `src/intake.rs`. Requires a live Postgres (`#[sqlx::test]`), so these
//! are `#[ignore]`d the way `src/db/repository.rs`'s idempotency test is.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use sqlx::PgPool;
use tower::ServiceExt;

use flakeguard::platform::{PlatformClient, PlatformClientConfig};
use flakeguard::policy::cache::PolicyCache;
use flakeguard::routes::build_router;
use flakeguard::AppState;

type HmacSha256 = Hmac<Sha256>;

const SECRET: &str = "scenario-secret";

fn sign(body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn test_state(pool: PgPool) -> AppState {
    std::env::set_var("WEBHOOK_SECRET", SECRET);
    let platform = Arc::new(PlatformClient::new(PlatformClientConfig {
        base_url: "https://example.invalid".to_string(),
        app_id: "1".to_string(),
        app_private_key_pem: String::new(),
        client_id: "id".to_string(),
        client_secret: "secret".to_string(),
        queue_capacity: 8,
        worker_concurrency: 1,
    }));
    AppState { pool, platform, policy_cache: Arc::new(PolicyCache::new()) }
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn scenario_b_invalid_signature_is_rejected(pool: PgPool) {
    let app = build_router(test_state(pool));
    let body = r#"{"action":"completed","workflow_run":{"id":1},"repository":{"full_name":"owner/test-repo","id":1},"installation":{"id":54321}}"#;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/github/webhook")
                .header("x-github-event", "workflow_run")
                .header("x-github-delivery", "D-invalid")
                .header("x-hub-signature-256", "sha256=invalid-signature")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let json: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["success"], false);
    assert_eq!(json["error"], "invalid webhook signature");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn scenario_c_unsupported_event_is_acknowledged_not_processed(pool: PgPool) {
    let app = build_router(test_state(pool));
    let body = br#"{"action":"opened"}"#;
    let signature = sign(body);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/github/webhook")
                .header("x-github-event", "issues")
                .header("x-github-delivery", "D-unsupported")
                .header("x-hub-signature-256", signature)
                .header("content-type", "application/json")
                .body(Body::from(body.to_vec()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let json: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["success"], true);
    assert!(json["message"].as_str().unwrap().contains("not processed"));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn duplicate_delivery_is_accepted_without_reenqueue(pool: PgPool) {
    let app = build_router(test_state(pool.clone()));
    let body = br#"{"action":"opened"}"#;
    let signature = sign(body);

    let request = || {
        Request::builder()
            .method("POST")
            .uri("/github/webhook")
            .header("x-github-event", "issues")
            .header("x-github-delivery", "D-dup")
            .header("x-hub-signature-256", signature.clone())
            .header("content-type", "application/json")
            .body(Body::from(body.to_vec()))
            .unwrap()
    };

    let first = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(first.status(), StatusCode::ACCEPTED);

    let second = app.oneshot(request()).await.unwrap();
    assert_eq!(second.status(), StatusCode::ACCEPTED);
    let bytes = hyper::body::to_bytes(second.into_body()).await.unwrap();
    let json: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["message"], "duplicate delivery");
}
