use once_cell::sync::Lazy;

/// Address the HTTP server binds to. Defaults to all interfaces.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server binds to.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080)
});

/// Shared secret used to verify `x-hub-signature-256` on inbound webhooks.
pub static WEBHOOK_SECRET: Lazy<String> =
    Lazy::new(|| std::env::var("WEBHOOK_SECRET").expect("WEBHOOK_SECRET must be set"));

/// GitHub App identifier, used to mint app-level JWTs for installation
/// token exchange.
pub static APP_ID: Lazy<String> =
    Lazy::new(|| std::env::var("APP_ID").expect("APP_ID must be set"));

/// PEM-encoded RSA private key for the GitHub App (raw contents, not a
/// path). Falls back to reading `APP_PRIVATE_KEY_PATH` if set.
pub static APP_PRIVATE_KEY_PEM: Lazy<String> = Lazy::new(|| {
    if let Ok(inline) = std::env::var("APP_PRIVATE_KEY") {
        return inline;
    }
    let path = std::env::var("APP_PRIVATE_KEY_PATH")
        .expect("APP_PRIVATE_KEY or APP_PRIVATE_KEY_PATH must be set");
    std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("failed to read APP_PRIVATE_KEY_PATH {path}: {e}"))
});

/// Number of workers consuming jobs concurrently, per job kind (spec §5).
pub static WORKER_CONCURRENCY: Lazy<usize> = Lazy::new(|| {
    std::env::var("WORKER_CONCURRENCY")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(4)
});

/// Maximum artifact size accepted by the fetcher, in bytes (default 100 MiB).
pub static MAX_ARTIFACT_BYTES: Lazy<u64> = Lazy::new(|| {
    std::env::var("MAX_ARTIFACT_BYTES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(100 * 1024 * 1024)
});

/// Occurrence retention window in days (spec §4.5).
pub static RETENTION_DAYS: Lazy<i64> = Lazy::new(|| {
    std::env::var("RETENTION_DAYS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(90)
});

/// Per-job deadline in seconds (spec §5).
pub static JOB_DEADLINE_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("JOB_DEADLINE_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(300)
});

pub struct AppConfig {
    pub database_url: String,
    pub broker_url: String,
    pub client_id: String,
    pub client_secret: String,
}

impl AppConfig {
    /// Load required startup configuration. Panics (caught by `main` as a
    /// fatal config error, exit code 1) if any required value is absent.
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .expect("DATABASE_URL must be set"),
            broker_url: std::env::var("BROKER_URL")
                .unwrap_or_else(|_| "inline://postgres".to_string()),
            client_id: std::env::var("CLIENT_ID").expect("CLIENT_ID must be set"),
            client_secret: std::env::var("CLIENT_SECRET").expect("CLIENT_SECRET must be set"),
        }
    }
}
