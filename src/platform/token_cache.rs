//! Per-installation access-token cache with single-flight refresh (spec
//! §4.6b). Shared, process-wide state — modeled on the `dashmap`-guarded
//! shared caches kept behind `once_cell::sync::Lazy` statics in
//! `backend/src/policy.rs`'s `POLICY_EVENT_CHANNEL`.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::errors::PlatformError;

/// Refresh happens when remaining TTL drops below this threshold.
const REFRESH_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at_epoch_secs: i64,
}

#[derive(Debug, Serialize)]
struct AppJwtClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

/// One lock per installation so refreshes for different installations
/// never contend, but two concurrent refreshes for the *same*
/// installation collapse into one (single-flight).
pub struct TokenCache {
    tokens: DashMap<i64, CachedToken>,
    refresh_locks: DashMap<i64, Arc<Mutex<()>>>,
    app_id: String,
    private_key_pem: String,
}

impl TokenCache {
    pub fn new(app_id: String, private_key_pem: String) -> Self {
        Self { tokens: DashMap::new(), refresh_locks: DashMap::new(), app_id, private_key_pem }
    }

    fn mint_app_jwt(&self) -> Result<String, PlatformError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| PlatformError::Unknown(e.to_string()))?
            .as_secs() as i64;
        let claims = AppJwtClaims { iat: now - 60, exp: now + 9 * 60, iss: self.app_id.clone() };
        let key = EncodingKey::from_rsa_pem(self.private_key_pem.as_bytes())
            .map_err(|e| PlatformError::Unknown(format!("invalid private key: {e}")))?;
        encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| PlatformError::Unknown(format!("jwt encode failed: {e}")))
    }

    /// Return a valid installation token, refreshing through `exchange` (the
    /// actual HTTP call to mint an installation token) if the cached one is
    /// missing or within `REFRESH_SKEW_SECS` of expiry.
    pub async fn get_or_refresh<F, Fut>(
        &self,
        installation_id: i64,
        exchange: F,
    ) -> Result<String, PlatformError>
    where
        F: FnOnce(String) -> Fut,
        Fut: std::future::Future<Output = Result<(String, i64), PlatformError>>,
    {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| PlatformError::Unknown(e.to_string()))?
            .as_secs() as i64;

        if let Some(cached) = self.tokens.get(&installation_id) {
            if cached.expires_at_epoch_secs - now > REFRESH_SKEW_SECS {
                return Ok(cached.token.clone());
            }
        }

        let lock = self
            .refresh_locks
            .entry(installation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Re-check: another task may have refreshed while we waited for the lock.
        if let Some(cached) = self.tokens.get(&installation_id) {
            if cached.expires_at_epoch_secs - now > REFRESH_SKEW_SECS {
                return Ok(cached.token.clone());
            }
        }

        let app_jwt = self.mint_app_jwt()?;
        let (token, expires_at_epoch_secs) = exchange(app_jwt).await?;
        self.tokens.insert(installation_id, CachedToken { token: token.clone(), expires_at_epoch_secs });
        Ok(token)
    }

    pub fn invalidate(&self, installation_id: i64) {
        self.tokens.remove(&installation_id);
    }
}

#[derive(Debug, Deserialize)]
pub struct InstallationTokenResponse {
    pub token: String,
    pub expires_at: String,
}
