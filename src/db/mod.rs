pub mod repository;

pub use repository::IngestionRepository;

use sqlx::{PgPool, Row};

use crate::models::Repository;

/// Upsert an installation row, creating it on first sight (spec §3:
/// "Created on first webhook; mutated by platform-sync").
pub async fn upsert_installation(pool: &PgPool, platform_installation_id: i64, account_login: &str) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(
        "INSERT INTO installations (platform_installation_id, account_login)
         VALUES ($1, $2)
         ON CONFLICT (platform_installation_id) DO UPDATE SET account_login = excluded.account_login
         RETURNING id",
    )
    .bind(platform_installation_id)
    .bind(account_login)
    .fetch_one(pool)
    .await?;
    Ok(row.get("id"))
}

/// Look up a repository by its Platform-facing `owner/repo` full name,
/// creating it (and a placeholder installation) if this is the first time
/// FlakeGuard has seen it.
pub async fn ensure_repository(pool: &PgPool, full_name: &str, platform_repo_id: i64, installation_id: i64) -> Result<Repository, sqlx::Error> {
    let row = sqlx::query(
        "INSERT INTO repositories (platform_repo_id, full_name, installation_id)
         VALUES ($1, $2, $3)
         ON CONFLICT (platform_repo_id) DO UPDATE SET full_name = excluded.full_name
         RETURNING id, platform_repo_id, full_name, installation_id",
    )
    .bind(platform_repo_id)
    .bind(full_name)
    .bind(installation_id)
    .fetch_one(pool)
    .await?;
    Ok(Repository {
        id: row.get("id"),
        platform_repo_id: row.get("platform_repo_id"),
        full_name: row.get("full_name"),
        installation_id: row.get("installation_id"),
    })
}

pub async fn repository_by_full_name(pool: &PgPool, full_name: &str) -> Result<Option<Repository>, sqlx::Error> {
    let row = sqlx::query("SELECT id, platform_repo_id, full_name, installation_id FROM repositories WHERE full_name = $1")
        .bind(full_name)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|row| Repository {
        id: row.get("id"),
        platform_repo_id: row.get("platform_repo_id"),
        full_name: row.get("full_name"),
        installation_id: row.get("installation_id"),
    }))
}
