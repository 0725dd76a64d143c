//! Resilient Platform client (spec §4.6) — the single chokepoint for every
//! outbound call. Layers compose in this order per request: priority queue
//! admission → token resolution → primary/secondary rate-limit wait →
//! circuit breaker gate → HTTP call → retry-on-failure → breaker/limiter
//! feedback.

pub mod circuit_breaker;
pub mod errors;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod token_cache;

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use sha2::Sha256;

use crate::broker::Priority;
use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use errors::PlatformError;
use queue::RequestQueue;
use rate_limit::{PrimaryRateLimiter, SecondaryRateLimiter};
use retry::{NetworkFailure, RetryConfig};
use token_cache::TokenCache;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_CHUNK_BYTES: usize = 64 * 1024;

pub struct PlatformClient {
    http: reqwest::Client,
    base_url: String,
    tokens: TokenCache,
    primary_limiter: PrimaryRateLimiter,
    secondary_limiter: SecondaryRateLimiter,
    breaker: CircuitBreaker,
    retry: RetryConfig,
    queue: Arc<RequestQueue>,
    client_id: String,
    client_secret: String,
}

pub struct PlatformClientConfig {
    pub base_url: String,
    pub app_id: String,
    pub app_private_key_pem: String,
    pub client_id: String,
    pub client_secret: String,
    pub queue_capacity: usize,
    pub worker_concurrency: usize,
}

impl PlatformClient {
    pub fn new(config: PlatformClientConfig) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(DEFAULT_REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client builds with static config"),
            base_url: config.base_url,
            tokens: TokenCache::new(config.app_id, config.app_private_key_pem),
            primary_limiter: PrimaryRateLimiter::default(),
            secondary_limiter: SecondaryRateLimiter::default(),
            breaker: CircuitBreaker::new(CircuitBreakerConfig::default()),
            retry: RetryConfig::default(),
            queue: RequestQueue::new(config.queue_capacity, config.worker_concurrency),
            client_id: config.client_id,
            client_secret: config.client_secret,
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    async fn installation_token(&self, installation_id: i64) -> Result<String, PlatformError> {
        let base_url = self.base_url.clone();
        let http = self.http.clone();
        self.tokens
            .get_or_refresh(installation_id, move |app_jwt| async move {
                let url = format!("{base_url}/app/installations/{installation_id}/access_tokens");
                let resp = http
                    .post(&url)
                    .bearer_auth(app_jwt)
                    .header("accept", "application/vnd.github+json")
                    .send()
                    .await
                    .map_err(|_| PlatformError::ServiceUnavailable)?;
                if !resp.status().is_success() {
                    return Err(PlatformError::from_status(resp.status().as_u16(), None, false)
                        .unwrap_or(PlatformError::Unknown("token exchange failed".into())));
                }
                let body: token_cache::InstallationTokenResponse =
                    resp.json().await.map_err(|e| PlatformError::Unknown(e.to_string()))?;
                let expires_at = chrono::DateTime::parse_from_rfc3339(&body.expires_at)
                    .map_err(|e| PlatformError::Unknown(e.to_string()))?
                    .timestamp();
                Ok((body.token, expires_at))
            })
            .await
    }

    /// Core resilient request. Runs the full admission/retry pipeline and
    /// returns a parsed JSON body on success.
    async fn request_json(
        &self,
        method: Method,
        path: &str,
        installation_id: i64,
        priority: Priority,
        body: Option<&Value>,
    ) -> Result<Value, PlatformError> {
        let _permit = self.queue.acquire(priority).await?;

        let is_critical = priority == Priority::Critical;
        if let Some(wait) = self.secondary_limiter.wait_secs() {
            tokio::time::sleep(Duration::from_secs(wait)).await;
        }
        if let Some(wait) = self.primary_limiter.exhausted_wait_secs() {
            tokio::time::sleep(Duration::from_secs(wait)).await;
        } else if let Some(wait) = self.primary_limiter.proactive_delay_secs(is_critical) {
            if wait > 0 {
                tokio::time::sleep(Duration::from_secs(wait)).await;
            }
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if !self.breaker.try_acquire() {
                return Err(PlatformError::CircuitBreakerOpen);
            }

            let token = self.installation_token(installation_id).await?;
            let url = format!("{}{}", self.base_url, path);
            let mut req = self.http.request(method.clone(), &url).bearer_auth(&token);
            if let Some(body) = body {
                req = req.json(body);
            }

            let outcome = req.send().await;
            match outcome {
                Ok(resp) => {
                    self.observe_rate_limit_headers(resp.headers());
                    let status = resp.status();
                    if status.is_success() {
                        self.breaker.on_success();
                        return resp.json().await.map_err(|e| PlatformError::Unknown(e.to_string()));
                    }

                    let is_secondary_abuse = resp
                        .headers()
                        .get("retry-after")
                        .is_some();
                    if let Some(retry_after) = resp.headers().get("retry-after").and_then(|v| v.to_str().ok()).and_then(|v| v.parse::<u64>().ok()) {
                        self.secondary_limiter.observe_retry_after(retry_after);
                    }
                    let error = PlatformError::from_status(status.as_u16(), None, is_secondary_abuse)
                        .unwrap_or(PlatformError::Unknown(format!("status {status}")));

                    self.breaker.on_failure();
                    if error.retryable() && self.retry.should_retry(attempt) {
                        let delay = self.retry.delay_secs(attempt);
                        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                        continue;
                    }
                    return Err(error);
                }
                Err(e) => {
                    self.breaker.on_failure();
                    let failure = if e.is_timeout() {
                        NetworkFailure::TimedOut
                    } else {
                        NetworkFailure::classify(&e)
                    };
                    if failure.is_retryable() && self.retry.should_retry(attempt) {
                        let delay = self.retry.delay_secs(attempt);
                        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                        continue;
                    }
                    return Err(if e.is_timeout() {
                        PlatformError::Timeout
                    } else {
                        PlatformError::ServiceUnavailable
                    });
                }
            }
        }
    }

    fn observe_rate_limit_headers(&self, headers: &reqwest::header::HeaderMap) {
        let remaining = header_i64(headers, "x-ratelimit-remaining");
        let limit = header_i64(headers, "x-ratelimit-limit");
        let reset = header_i64(headers, "x-ratelimit-reset");
        if let (Some(remaining), Some(limit), Some(reset)) = (remaining, limit, reset) {
            self.primary_limiter.observe_headers(remaining, limit, reset);
        }
    }

    pub async fn list_artifacts(
        &self,
        owner: &str,
        repo: &str,
        run_id: i64,
        installation_id: i64,
    ) -> Result<Vec<ArtifactSummary>, PlatformError> {
        let path = format!("/repos/{owner}/{repo}/actions/runs/{run_id}/artifacts");
        let body = self.request_json(Method::GET, &path, installation_id, Priority::Normal, None).await?;
        let artifacts = body
            .get("artifacts")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(artifacts
            .into_iter()
            .filter_map(|a| serde_json::from_value(a).ok())
            .collect())
    }

    /// Stream an artifact archive to `sink` in fixed-size chunks, enforcing
    /// `max_bytes` and surfacing `ArtifactExpired` on an expired URL
    /// (spec §4.6g).
    pub async fn download_artifact<F>(
        &self,
        archive_download_url: &str,
        installation_id: i64,
        max_bytes: u64,
        mut sink: F,
    ) -> Result<u64, PlatformError>
    where
        F: FnMut(Bytes) -> Result<(), PlatformError>,
    {
        let token = self.installation_token(installation_id).await?;
        let resp = self
            .http
            .get(archive_download_url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|_| PlatformError::ServiceUnavailable)?;

        match resp.status() {
            StatusCode::FORBIDDEN | StatusCode::GONE => return Err(PlatformError::ArtifactExpired),
            status if !status.is_success() => {
                return Err(PlatformError::from_status(status.as_u16(), None, false)
                    .unwrap_or(PlatformError::Unknown(format!("status {status}"))));
            }
            _ => {}
        }

        let mut total: u64 = 0;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|_| PlatformError::Timeout)?;
            for piece in chunk.chunks(DOWNLOAD_CHUNK_BYTES) {
                total += piece.len() as u64;
                if total > max_bytes {
                    return Err(PlatformError::Unprocessable("artifact exceeds max size".into()));
                }
                sink(Bytes::copy_from_slice(piece))?;
            }
        }
        Ok(total)
    }

    pub async fn create_or_update_check_run(
        &self,
        owner: &str,
        repo: &str,
        existing_check_run_id: Option<i64>,
        installation_id: i64,
        body: &Value,
    ) -> Result<Value, PlatformError> {
        let (method, path) = match existing_check_run_id {
            Some(id) => (Method::PATCH, format!("/repos/{owner}/{repo}/check-runs/{id}")),
            None => (Method::POST, format!("/repos/{owner}/{repo}/check-runs")),
        };
        self.request_json(method, &path, installation_id, Priority::High, Some(body)).await
    }

    pub async fn rerun_failed_jobs(
        &self,
        owner: &str,
        repo: &str,
        run_id: i64,
        installation_id: i64,
    ) -> Result<(), PlatformError> {
        let path = format!("/repos/{owner}/{repo}/actions/runs/{run_id}/rerun-failed-jobs");
        self.request_json(Method::POST, &path, installation_id, Priority::High, None).await?;
        Ok(())
    }

    pub async fn cancel_workflow(
        &self,
        owner: &str,
        repo: &str,
        run_id: i64,
        installation_id: i64,
    ) -> Result<(), PlatformError> {
        let path = format!("/repos/{owner}/{repo}/actions/runs/{run_id}/cancel");
        self.request_json(Method::POST, &path, installation_id, Priority::Normal, None).await?;
        Ok(())
    }

    pub async fn create_issue(
        &self,
        owner: &str,
        repo: &str,
        installation_id: i64,
        title: &str,
        body: &str,
    ) -> Result<Value, PlatformError> {
        let path = format!("/repos/{owner}/{repo}/issues");
        let payload = serde_json::json!({ "title": title, "body": body });
        self.request_json(Method::POST, &path, installation_id, Priority::Normal, Some(&payload)).await
    }

    pub fn oauth_credentials(&self) -> (&str, &str) {
        (&self.client_id, &self.client_secret)
    }

    /// Fetch a repository file's content via the contents API, honoring a
    /// cached ETag (spec §4.8's conditional policy-document fetch). Bypasses
    /// the JSON-body `request_json` path since a 304 has no body and the
    /// conditional header isn't part of that pipeline's contract.
    pub async fn get_repository_file(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        installation_id: i64,
        etag: Option<&str>,
    ) -> Result<RepoFile, PlatformError> {
        let _permit = self.queue.acquire(Priority::Low).await?;
        if !self.breaker.try_acquire() {
            return Err(PlatformError::CircuitBreakerOpen);
        }

        let token = self.installation_token(installation_id).await?;
        let url = format!("{}/repos/{owner}/{repo}/contents/{path}", self.base_url);
        let mut req = self.http.get(&url).bearer_auth(&token);
        if let Some(etag) = etag {
            req = req.header("if-none-match", etag);
        }

        let resp = req.send().await.map_err(|_| PlatformError::ServiceUnavailable)?;
        self.observe_rate_limit_headers(resp.headers());

        if resp.status() == StatusCode::NOT_MODIFIED {
            self.breaker.on_success();
            return Ok(RepoFile::NotModified);
        }
        if resp.status() == StatusCode::NOT_FOUND {
            self.breaker.on_success();
            return Ok(RepoFile::NotFound);
        }
        if !resp.status().is_success() {
            self.breaker.on_failure();
            return Err(PlatformError::from_status(resp.status().as_u16(), None, false)
                .unwrap_or(PlatformError::Unknown(format!("status {}", resp.status()))));
        }

        let new_etag = resp.headers().get("etag").and_then(|v| v.to_str().ok()).map(|s| s.to_string());
        let body: Value = resp.json().await.map_err(|e| PlatformError::Unknown(e.to_string()))?;
        self.breaker.on_success();

        let encoded = body.get("content").and_then(|v| v.as_str()).unwrap_or_default();
        let stripped: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(stripped)
            .map_err(|e| PlatformError::Unknown(format!("invalid base64 content: {e}")))?;
        let content = String::from_utf8(decoded).map_err(|e| PlatformError::Unknown(e.to_string()))?;

        Ok(RepoFile::Found { content, etag: new_etag })
    }
}

#[derive(Debug, Clone)]
pub enum RepoFile {
    Found { content: String, etag: Option<String> },
    NotModified,
    NotFound,
}

fn header_i64(headers: &reqwest::header::HeaderMap, name: &str) -> Option<i64> {
    headers.get(name).and_then(|v| v.to_str().ok()).and_then(|v| v.parse().ok())
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ArtifactSummary {
    pub id: i64,
    pub name: String,
    pub size_in_bytes: u64,
    pub expired: bool,
    pub archive_download_url: String,
}

type HmacSha256 = Hmac<Sha256>;

/// Constant-time webhook signature verification (spec §4.6h). Shared with
/// `intake::handle_webhook`'s use so the client and the intake layer agree
/// on the verification contract.
pub fn verify_webhook_signature(secret: &str, signature_header: &str, body: &[u8]) -> bool {
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

/// Redact bearer tokens and shared secrets before a value reaches a log
/// line (spec §4.6i).
pub fn redact_credentials(input: &str) -> String {
    let mut out = input.to_string();
    if let Some(idx) = out.find("Bearer ") {
        let end = out[idx + 7..].find(|c: char| c.is_whitespace()).map(|e| idx + 7 + e).unwrap_or(out.len());
        out.replace_range(idx + 7..end, "***REDACTED***");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_bearer_tokens() {
        let line = "calling GET /x with Bearer ghs_abcdef123456 succeeded";
        let redacted = redact_credentials(line);
        assert!(!redacted.contains("ghs_abcdef123456"));
        assert!(redacted.contains("***REDACTED***"));
    }

    #[test]
    fn webhook_signature_helper_matches_intake() {
        let secret = "topsecret";
        let body = b"{}";
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let sig = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
        assert!(verify_webhook_signature(secret, &sig, body));
    }
}
