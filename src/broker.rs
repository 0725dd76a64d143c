//! Broker adapter (spec §4.2): a thin interface over a durable
//! priority/delayed queue. Modeled on `job_queue.rs`'s `enqueue_job` /
//! `start_worker` shape, generalized with priority, visibility-timeout
//! reservation, exponential backoff, and dead-letter.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum Job {
    WorkflowRun {
        repo_full_name: Option<String>,
        platform_repo_id: Option<i64>,
        installation_id: Option<i64>,
        run_id: i64,
        head_sha: Option<String>,
        head_branch: Option<String>,
        conclusion: Option<String>,
    },
    CheckRunAction {
        repo_full_name: Option<String>,
        platform_repo_id: Option<i64>,
        installation_id: Option<i64>,
        check_run_id: i64,
        action: String,
    },
    WorkflowJob { repo_full_name: Option<String>, platform_repo_id: Option<i64>, installation_id: Option<i64>, job_id: i64 },
    CheckSuite { repo_full_name: Option<String>, platform_repo_id: Option<i64>, installation_id: Option<i64>, check_suite_id: i64 },
    PullRequest {
        repo_full_name: Option<String>,
        platform_repo_id: Option<i64>,
        installation_id: Option<i64>,
        pr_number: i64,
        labels: Vec<String>,
    },
    Installation { installation_id: i64, action: String },
    PruneOccurrences { repo_id: i64 },
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Job::WorkflowRun { .. } => "workflow_run",
            Job::CheckRunAction { .. } => "check_run",
            Job::WorkflowJob { .. } => "workflow_job",
            Job::CheckSuite { .. } => "check_suite",
            Job::PullRequest { .. } => "pull_request",
            Job::Installation { .. } => "installation",
            Job::PruneOccurrences { .. } => "prune_occurrences",
        }
    }
}

pub struct EnqueueOptions {
    pub priority: Priority,
    pub delay_ms: u64,
    pub idempotency_key: Option<String>,
    pub max_attempts: i32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self { priority: Priority::Normal, delay_ms: 0, idempotency_key: None, max_attempts: 8 }
    }
}

/// Base/cap/jitter for the exponential backoff applied between broker
/// retries (spec §4.2: base 2s, cap 5min, ±25% jitter).
const BACKOFF_BASE_SECS: f64 = 2.0;
const BACKOFF_CAP_SECS: f64 = 300.0;
const BACKOFF_JITTER: f64 = 0.25;

fn backoff_delay_secs(attempt: i32) -> f64 {
    let raw = BACKOFF_BASE_SECS * 2f64.powi((attempt - 1).max(0));
    let capped = raw.min(BACKOFF_CAP_SECS);
    let jitter_span = capped * BACKOFF_JITTER;
    let mut rng = rand::thread_rng();
    capped + rng.gen_range(-jitter_span..=jitter_span)
}

/// Enqueue a job with an idempotency key; a conflicting key is treated as
/// a duplicate enqueue and silently ignored (the delivery identifier is
/// the canonical idempotency key used by `intake`).
pub async fn enqueue(pool: &PgPool, job: &Job, opts: EnqueueOptions) -> Result<i64, sqlx::Error> {
    let payload = serde_json::to_value(job).expect("Job always serializes");
    let available_at = Utc::now() + chrono::Duration::milliseconds(opts.delay_ms as i64);
    let row = sqlx::query(
        r#"
        INSERT INTO job_queue (kind, payload, priority, max_attempts, idempotency_key, available_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (idempotency_key) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(job.kind())
    .bind(&payload)
    .bind(opts.priority.as_str())
    .bind(opts.max_attempts)
    .bind(&opts.idempotency_key)
    .bind(available_at)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Ok(row.get::<i64, _>("id")),
        None => {
            // Idempotency key already present; look up the existing row id.
            let existing = sqlx::query("SELECT id FROM job_queue WHERE idempotency_key = $1")
                .bind(&opts.idempotency_key)
                .fetch_optional(pool)
                .await?;
            Ok(existing.map(|r| r.get::<i64, _>("id")).unwrap_or(-1))
        }
    }
}

pub struct ReservedJob {
    pub id: i64,
    pub job: Job,
    pub attempts: i32,
    pub max_attempts: i32,
}

/// Reserve the next available job of any kind, applying a visibility
/// timeout so a crashed worker's job becomes reservable again.
pub async fn reserve(pool: &PgPool, visibility_timeout_secs: i64) -> Result<Option<ReservedJob>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let row = sqlx::query(
        r#"
        SELECT id, payload, attempts, max_attempts
        FROM job_queue
        WHERE status = 'queued' AND available_at <= now()
        ORDER BY
            CASE priority
                WHEN 'critical' THEN 0
                WHEN 'high' THEN 1
                WHEN 'normal' THEN 2
                ELSE 3
            END,
            available_at ASC
        FOR UPDATE SKIP LOCKED
        LIMIT 1
        "#,
    )
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        tx.commit().await?;
        return Ok(None);
    };

    let id: i64 = row.get("id");
    let payload: Value = row.get("payload");
    let attempts: i32 = row.get("attempts");
    let max_attempts: i32 = row.get("max_attempts");
    let job: Job = serde_json::from_value(payload).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    sqlx::query(
        "UPDATE job_queue SET status = 'reserved', locked_until = now() + make_interval(secs => $2) WHERE id = $1",
    )
    .bind(id)
    .bind(visibility_timeout_secs as f64)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(Some(ReservedJob { id, job, attempts, max_attempts }))
}

pub async fn ack(pool: &PgPool, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM job_queue WHERE id = $1").bind(id).execute(pool).await?;
    Ok(())
}

/// Fail a reserved job: schedule the next attempt with exponential
/// backoff, or move it to the dead-letter table once `max_attempts` is
/// reached (spec §4.2).
pub async fn fail(pool: &PgPool, reserved: &ReservedJob, reason: &str) -> Result<(), sqlx::Error> {
    let next_attempts = reserved.attempts + 1;
    if next_attempts >= reserved.max_attempts {
        dead_letter(pool, reserved, reason).await?;
        return Ok(());
    }
    let delay = backoff_delay_secs(next_attempts);
    sqlx::query(
        r#"
        UPDATE job_queue
        SET status = 'queued', attempts = $2, available_at = now() + make_interval(secs => $3), last_error = $4
        WHERE id = $1
        "#,
    )
    .bind(reserved.id)
    .bind(next_attempts)
    .bind(delay)
    .bind(reason)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn dead_letter(pool: &PgPool, reserved: &ReservedJob, reason: &str) -> Result<(), sqlx::Error> {
    let payload = serde_json::to_value(&reserved.job).expect("Job always serializes");
    let mut tx = pool.begin().await?;
    sqlx::query("INSERT INTO dead_letter_jobs (kind, payload, reason) VALUES ($1, $2, $3)")
        .bind(reserved.job.kind())
        .bind(&payload)
        .bind(reason)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM job_queue WHERE id = $1").bind(reserved.id).execute(&mut *tx).await?;
    tx.commit().await?;
    tracing::warn!(job_id = reserved.id, kind = reserved.job.kind(), reason, "job moved to dead-letter");
    Ok(())
}

/// Spawn `concurrency` worker loops pulling from the broker and running
/// `handler` on each job, acking/failing per the handler's result. This is
/// the generalization of `job_queue.rs::start_worker`'s replay-and-dispatch
/// loop to the priority/backoff/dead-letter contract in spec §4.2.
pub fn start_workers<F, Fut>(pool: PgPool, concurrency: usize, deadline_secs: u64, handler: Arc<F>)
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, (String, bool)>> + Send,
{
    for worker_id in 0..concurrency {
        let pool = pool.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            loop {
                match reserve(&pool, deadline_secs as i64).await {
                    Ok(Some(reserved)) => {
                        let deadline = StdDuration::from_secs(deadline_secs);
                        let result = tokio::time::timeout(deadline, handler(reserved.job.clone())).await;
                        match result {
                            Ok(Ok(_outcome)) => {
                                if let Err(err) = ack(&pool, reserved.id).await {
                                    tracing::error!(?err, worker_id, "failed to ack job");
                                }
                            }
                            Ok(Err((reason, retryable))) => {
                                if retryable {
                                    let _ = fail(&pool, &reserved, &reason).await;
                                } else {
                                    let _ = dead_letter(&pool, &reserved, &reason).await;
                                }
                            }
                            Err(_elapsed) => {
                                let _ = fail(&pool, &reserved, "job deadline exceeded").await;
                            }
                        }
                    }
                    Ok(None) => sleep(StdDuration::from_millis(500)).await,
                    Err(err) => {
                        tracing::error!(?err, worker_id, "broker reserve failed");
                        sleep(StdDuration::from_secs(2)).await;
                    }
                }
            }
        });
    }
}

/// Release jobs whose visibility timeout elapsed without an ack back to
/// `queued` so another worker can pick them up.
pub async fn reap_expired_reservations(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE job_queue SET status = 'queued' WHERE status = 'reserved' AND locked_until < now()",
    )
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let first = backoff_delay_secs(1);
        assert!(first >= BACKOFF_BASE_SECS * (1.0 - BACKOFF_JITTER) - 0.01);
        assert!(first <= BACKOFF_BASE_SECS * (1.0 + BACKOFF_JITTER) + 0.01);

        let late = backoff_delay_secs(20);
        assert!(late <= BACKOFF_CAP_SECS * (1.0 + BACKOFF_JITTER) + 0.01);
    }

    #[test]
    fn job_kind_strings_are_stable() {
        let job = Job::WorkflowRun {
            repo_full_name: Some("o/r".into()),
            platform_repo_id: Some(9),
            installation_id: Some(1),
            run_id: 1,
            head_sha: Some("abc123".into()),
            head_branch: Some("main".into()),
            conclusion: Some("failure".into()),
        };
        assert_eq!(job.kind(), "workflow_run");
    }
}
