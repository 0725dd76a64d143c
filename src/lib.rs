pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod fetcher;
pub mod intake;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod platform;
pub mod policy;
pub mod publisher;
pub mod routes;
pub mod scorer;
pub mod telemetry;

use std::sync::Arc;

use sqlx::PgPool;

use platform::PlatformClient;
use policy::cache::PolicyCache;

/// Shared process-wide state (spec §5): one pool, one Platform client, one
/// policy cache, handed to every handler and worker.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub platform: Arc<PlatformClient>,
    pub policy_cache: Arc<PolicyCache>,
}
