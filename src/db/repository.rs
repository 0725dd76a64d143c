//! Ingestion repository (spec §4.5): turns a parsed batch of suites/cases
//! into durable rows with idempotent upserts, chunked within one
//! transaction per job. Grounded on `artifacts.rs::record_build_artifacts`'s
//! begin-tx / insert-parent-then-children / commit shape and on
//! `ingestion.rs`'s `sqlx::query` + `Row::get` idiom.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::models::{Occurrence, OccurrenceStatus, SuiteTotals, TestCase};

/// Chunk sizes per spec §4.5: at most 100 suites, 500 cases, and 500
/// occurrences batched per round-trip group within the job's transaction.
const SUITE_CHUNK: usize = 100;
const CASE_CHUNK: usize = 500;
const OCCURRENCE_CHUNK: usize = 500;

#[derive(Debug, Clone)]
pub struct ParsedOccurrence {
    /// 1-based attempt number within the run. Most reports have exactly
    /// one attempt per case; a rerun-on-failure CI step produces more.
    pub attempt: i32,
    pub status: OccurrenceStatus,
    pub duration_ms: Option<i64>,
    pub failure_msg_signature: Option<String>,
    pub stack_trace: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParsedCase {
    pub class_name: String,
    pub name: String,
    pub file: Option<String>,
    pub occurrences: Vec<ParsedOccurrence>,
}

#[derive(Debug, Clone)]
pub struct ParsedSuite {
    pub name: String,
    pub package: Option<String>,
    pub totals: SuiteTotals,
    pub time_secs: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub cases: Vec<ParsedCase>,
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct IngestionSummary {
    pub suites_upserted: usize,
    pub cases_upserted: usize,
    pub occurrences_inserted: usize,
}

/// Best-effort fallback when a parsed case carries no `file` attribute:
/// dotted JUnit-style class names (`com.acme.widget.WidgetTest`) map to
/// their conventional source path. Only used to fill gaps; an explicit
/// `file` from the report always wins.
pub fn heuristic_source_path(class_name: &str) -> Option<String> {
    if class_name.is_empty() {
        return None;
    }
    Some(format!("{}.java", class_name.replace('.', "/")))
}

pub struct IngestionRepository {
    pool: PgPool,
}

impl IngestionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Ingest every suite/case/occurrence from one workflow run's artifacts
    /// in a single transaction, chunked per spec §4.5. Safe to call twice
    /// with the same `run_id` and identical content: every insert targets a
    /// uniquely-constrained key and no-ops on conflict.
    pub async fn ingest_report(
        &self,
        repo_id: i64,
        run_id: i64,
        suites: &[ParsedSuite],
    ) -> Result<IngestionSummary, sqlx::Error> {
        let mut summary = IngestionSummary::default();
        let mut tx = self.pool.begin().await?;

        for suite_chunk in suites.chunks(SUITE_CHUNK) {
            for suite in suite_chunk {
                let suite_id = upsert_suite(&mut tx, repo_id, run_id, suite).await?;
                summary.suites_upserted += 1;

                for case_chunk in suite.cases.chunks(CASE_CHUNK) {
                    for case in case_chunk {
                        let file = case.file.clone().or_else(|| heuristic_source_path(&case.class_name));
                        let full_name = format!("{}.{}.{}", suite.name, case.class_name, case.name);
                        let case_id =
                            upsert_case(&mut tx, repo_id, suite_id, &suite.name, case, &full_name, &file)
                                .await?;
                        summary.cases_upserted += 1;

                        for occ_chunk in case.occurrences.chunks(OCCURRENCE_CHUNK) {
                            for occurrence in occ_chunk {
                                let inserted = insert_occurrence(&mut tx, case_id, run_id, occurrence).await?;
                                if inserted {
                                    summary.occurrences_inserted += 1;
                                }
                            }
                        }
                    }
                }
            }
        }

        tx.commit().await?;
        Ok(summary)
    }

    /// Full occurrence history for a test case, most recent first, used by
    /// the scorer (spec §4.7). Bounded to a generous window so a
    /// long-lived flaky test doesn't force an unbounded scan.
    pub async fn occurrence_history(
        &self,
        test_case_id: i64,
        limit: i64,
    ) -> Result<Vec<Occurrence>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, test_case_id, run_id, status, duration_ms,
                   failure_msg_signature, stack_trace, attempt, created_at
            FROM occurrences
            WHERE test_case_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(test_case_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let status_raw: String = row.get("status");
                let status = OccurrenceStatus::from_raw(&status_raw).unwrap_or(OccurrenceStatus::Failed);
                Ok(Occurrence {
                    id: row.get("id"),
                    test_case_id: row.get("test_case_id"),
                    run_id: row.get("run_id"),
                    status,
                    duration_ms: row.get("duration_ms"),
                    failure_msg_signature: row.get("failure_msg_signature"),
                    stack_trace: row.get("stack_trace"),
                    attempt: row.get("attempt"),
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }

    /// Delete occurrences older than the retention window (spec §4.5), run
    /// periodically from the `PruneOccurrences` background job.
    pub async fn prune_occurrences(&self, repo_id: i64, retention_days: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM occurrences
            WHERE test_case_id IN (SELECT id FROM test_cases WHERE repo_id = $1)
              AND created_at < now() - make_interval(days => $2)
            "#,
        )
        .bind(repo_id)
        .bind(retention_days as i32)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// All test case ids for a repository, used to drive re-scoring sweeps.
    pub async fn test_case_ids_for_repo(&self, repo_id: i64) -> Result<Vec<i64>, sqlx::Error> {
        let rows = sqlx::query("SELECT id FROM test_cases WHERE repo_id = $1")
            .bind(repo_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get::<i64, _>("id")).collect())
    }

    /// Full rows for every test case in a repository, used by the
    /// quarantine-plan endpoint (spec §6) to score and evaluate a repo's
    /// whole test suite on demand.
    pub async fn test_cases_for_repo(&self, repo_id: i64) -> Result<Vec<TestCase>, sqlx::Error> {
        let rows = sqlx::query("SELECT id, repo_id, suite_name, class_name, name, file FROM test_cases WHERE repo_id = $1")
            .bind(repo_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| TestCase {
                id: row.get("id"),
                repo_id: row.get("repo_id"),
                suite_name: row.get("suite_name"),
                class_name: row.get("class_name"),
                name: row.get("name"),
                file: row.get("file"),
            })
            .collect())
    }
}

async fn upsert_suite(
    tx: &mut Transaction<'_, Postgres>,
    repo_id: i64,
    run_id: i64,
    suite: &ParsedSuite,
) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO test_suites (repo_id, name, run_id, package, tests, failures, errors, skipped, time_secs, "timestamp")
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (repo_id, name, (COALESCE(run_id, -1))) DO UPDATE SET
            tests = excluded.tests,
            failures = excluded.failures,
            errors = excluded.errors,
            skipped = excluded.skipped,
            time_secs = excluded.time_secs
        RETURNING id
        "#,
    )
    .bind(repo_id)
    .bind(&suite.name)
    .bind(run_id)
    .bind(&suite.package)
    .bind(suite.totals.tests)
    .bind(suite.totals.failures)
    .bind(suite.totals.errors)
    .bind(suite.totals.skipped)
    .bind(suite.time_secs)
    .bind(suite.timestamp)
    .fetch_one(&mut **tx)
    .await?;
    Ok(row.get("id"))
}

async fn upsert_case(
    tx: &mut Transaction<'_, Postgres>,
    repo_id: i64,
    suite_id: i64,
    suite_name: &str,
    case: &ParsedCase,
    full_name: &str,
    file: &Option<String>,
) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO test_cases (repo_id, suite_id, suite_name, class_name, name, full_name, file)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (repo_id, full_name, (COALESCE(file, '')), suite_name) DO UPDATE SET suite_id = excluded.suite_id
        RETURNING id
        "#,
    )
    .bind(repo_id)
    .bind(suite_id)
    .bind(suite_name)
    .bind(&case.class_name)
    .bind(&case.name)
    .bind(full_name)
    .bind(file)
    .fetch_one(&mut **tx)
    .await?;
    Ok(row.get("id"))
}

async fn insert_occurrence(
    tx: &mut Transaction<'_, Postgres>,
    test_case_id: i64,
    run_id: i64,
    occurrence: &ParsedOccurrence,
) -> Result<bool, sqlx::Error> {
    let status_str = match occurrence.status {
        OccurrenceStatus::Passed => "passed",
        OccurrenceStatus::Failed => "failed",
        OccurrenceStatus::Error => "error",
        OccurrenceStatus::Skipped => "skipped",
    };
    let row = sqlx::query(
        r#"
        INSERT INTO occurrences (test_case_id, run_id, status, duration_ms, failure_msg_signature, stack_trace, attempt)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (test_case_id, run_id, attempt) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(test_case_id)
    .bind(run_id)
    .bind(status_str)
    .bind(occurrence.duration_ms)
    .bind(&occurrence.failure_msg_signature)
    .bind(&occurrence.stack_trace)
    .bind(occurrence.attempt)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_path_converts_dots_to_slashes() {
        assert_eq!(
            heuristic_source_path("com.acme.widget.WidgetTest"),
            Some("com/acme/widget/WidgetTest.java".to_string())
        );
    }

    #[test]
    fn heuristic_path_empty_class_name_is_none() {
        assert_eq!(heuristic_source_path(""), None);
    }

    #[sqlx::test]
    #[ignore = "requires DATABASE_URL with Postgres server"]
    async fn ingest_report_is_idempotent(pool: PgPool) {
        let repo = IngestionRepository::new(pool.clone());
        sqlx::query("INSERT INTO installations (id, platform_installation_id, account_login) VALUES (1, 1, 'acme')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO repositories (id, platform_repo_id, full_name, installation_id) VALUES (1, 1, 'acme/widget', 1)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let suites = vec![ParsedSuite {
            name: "WidgetSuite".into(),
            package: Some("com.acme.widget".into()),
            totals: SuiteTotals { tests: 1, failures: 1, errors: 0, skipped: 0 },
            time_secs: Some(1.2),
            timestamp: None,
            cases: vec![ParsedCase {
                class_name: "WidgetTest".into(),
                name: "testSpin".into(),
                file: None,
                occurrences: vec![ParsedOccurrence {
                    attempt: 1,
                    status: OccurrenceStatus::Failed,
                    duration_ms: Some(42),
                    failure_msg_signature: Some("AssertionError".into()),
                    stack_trace: None,
                }],
            }],
        }];

        let first = repo.ingest_report(1, 100, &suites).await.unwrap();
        assert_eq!(first.occurrences_inserted, 1);

        let second = repo.ingest_report(1, 100, &suites).await.unwrap();
        assert_eq!(second.occurrences_inserted, 0, "replaying the same run must not duplicate occurrences");
        assert_eq!(second.cases_upserted, 1);
    }
}
