//! Process entry point. Boots tracing, the database pool, the Platform
//! client, and the broker workers, then serves the HTTP surface. Boot
//! sequence: tracing init, fail-fast env checks, pool, migrations,
//! background workers, router, bind-and-serve.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use flakeguard::broker::{self, Job};
use flakeguard::config::{AppConfig, BIND_ADDRESS, BIND_PORT, JOB_DEADLINE_SECS, WORKER_CONCURRENCY};
use flakeguard::pipeline;
use flakeguard::platform::{PlatformClient, PlatformClientConfig};
use flakeguard::policy::cache::PolicyCache;
use flakeguard::routes;
use flakeguard::telemetry;
use flakeguard::AppState;

use sqlx::postgres::PgPoolOptions;

/// Fatal config error, exit code 1 (spec §6).
const EXIT_CONFIG_ERROR: u8 = 1;
/// Dependency unavailable at startup, exit code 2 (spec §6).
const EXIT_DEPENDENCY_UNAVAILABLE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    telemetry::init_tracing();
    dotenvy::dotenv().ok();

    // Fail fast on missing required configuration before touching the network.
    let config = std::panic::catch_unwind(AppConfig::from_env);
    let config = match config {
        Ok(config) => config,
        Err(_) => {
            tracing::error!("missing required configuration, refusing to start");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    let _ = flakeguard::config::WEBHOOK_SECRET.as_str();
    let _ = flakeguard::config::APP_ID.as_str();
    let _ = flakeguard::config::APP_PRIVATE_KEY_PEM.as_str();

    let pool = match PgPoolOptions::new().max_connections(10).connect(&config.database_url).await {
        Ok(pool) => pool,
        Err(error) => {
            tracing::error!(%error, "failed to connect to database");
            return ExitCode::from(EXIT_DEPENDENCY_UNAVAILABLE);
        }
    };

    // A migration failure here is always fatal: ingestion and policy
    // evaluation both depend on the schema being current.
    if let Err(error) = sqlx::migrate!().run(&pool).await {
        tracing::error!(%error, "database migration failed");
        return ExitCode::from(EXIT_DEPENDENCY_UNAVAILABLE);
    }

    let platform = Arc::new(PlatformClient::new(PlatformClientConfig {
        base_url: "https://api.github.com".to_string(),
        app_id: flakeguard::config::APP_ID.clone(),
        app_private_key_pem: flakeguard::config::APP_PRIVATE_KEY_PEM.clone(),
        client_id: config.client_id.clone(),
        client_secret: config.client_secret.clone(),
        queue_capacity: 256,
        worker_concurrency: *WORKER_CONCURRENCY,
    }));
    let policy_cache = Arc::new(PolicyCache::new());

    let state = AppState { pool: pool.clone(), platform: platform.clone(), policy_cache: policy_cache.clone() };

    let handler_state = state.clone();
    broker::start_workers(pool.clone(), *WORKER_CONCURRENCY, *JOB_DEADLINE_SECS, Arc::new(move |job: Job| {
        let state = handler_state.clone();
        async move { pipeline::process_job(state, job).await }
    }));

    spawn_retention_sweep(pool.clone());

    let app = routes::build_router(state);
    let addr: SocketAddr = match format!("{}:{}", BIND_ADDRESS.as_str(), *BIND_PORT).parse() {
        Ok(addr) => addr,
        Err(error) => {
            tracing::error!(%error, "invalid bind address");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    tracing::info!(%addr, "flakeguard listening");
    if let Err(error) = axum::Server::bind(&addr).serve(app.into_make_service()).await {
        tracing::error!(%error, "server exited with error");
        return ExitCode::from(EXIT_DEPENDENCY_UNAVAILABLE);
    }

    ExitCode::SUCCESS
}

/// Periodic retention sweep (spec §4.5): one long-lived task, fixed
/// interval, log-and-continue on failure.
fn spawn_retention_sweep(pool: sqlx::PgPool) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        loop {
            ticker.tick().await;
            match routes::prune_all_repositories(&pool).await {
                Ok(deleted) => tracing::info!(deleted, "retention sweep completed"),
                Err(error) => tracing::error!(%error, "retention sweep failed"),
            }
            if let Err(error) = broker::reap_expired_reservations(&pool).await {
                tracing::error!(%error, "failed to reap expired job reservations");
            }
        }
    });
}
