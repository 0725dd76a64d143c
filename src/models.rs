//! Core data model (spec §3). These are the shapes that flow between the
//! ingestion repository, the scorer, and the policy engine; the SQL-backed
//! persistence of `TestSuite`/`TestCase`/`Occurrence` lives in `db::repository`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub platform_repo_id: i64,
    pub full_name: String,
    pub installation_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Installation {
    pub id: i64,
    pub platform_installation_id: i64,
    pub account_login: String,
    pub suspended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStatus {
    Queued,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunConclusion {
    Success,
    Failure,
    Neutral,
    Cancelled,
    Skipped,
    TimedOut,
    ActionRequired,
    Stale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub platform_run_id: i64,
    pub repo_id: i64,
    pub head_sha: String,
    pub head_branch: String,
    pub status: WorkflowRunStatus,
    pub conclusion: Option<WorkflowRunConclusion>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuiteTotals {
    pub tests: i32,
    pub failures: i32,
    pub errors: i32,
    pub skipped: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuite {
    pub id: i64,
    pub repo_id: i64,
    pub name: String,
    pub run_id: Option<i64>,
    pub package: Option<String>,
    pub totals: SuiteTotals,
    pub time_secs: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub cases: Vec<TestCase>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: i64,
    pub repo_id: i64,
    pub suite_name: String,
    pub class_name: String,
    pub name: String,
    pub file: Option<String>,
}

impl TestCase {
    /// `fullName = suite.class.name`, the stable cross-run identity (spec §3).
    pub fn full_name(&self) -> String {
        format!("{}.{}.{}", self.suite_name, self.class_name, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OccurrenceStatus {
    Passed,
    Failed,
    Error,
    Skipped,
}

impl OccurrenceStatus {
    /// Status-mapping rule from spec §4.4: anything else lowercased and
    /// passed through is not representable here, so callers that hit an
    /// unrecognized raw status fall back to `Failed` with a parse warning
    /// rather than inventing a new variant. `flaky` is never emitted by the
    /// parser (spec §9 open question resolved: parser never produces it).
    pub fn from_raw(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "passed" | "success" => Some(OccurrenceStatus::Passed),
            "failed" | "failure" => Some(OccurrenceStatus::Failed),
            "error" => Some(OccurrenceStatus::Error),
            "skipped" | "skip" | "ignored" => Some(OccurrenceStatus::Skipped),
            _ => None,
        }
    }

    pub fn is_failure_like(self) -> bool {
        matches!(self, OccurrenceStatus::Failed | OccurrenceStatus::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Occurrence {
    pub id: i64,
    pub test_case_id: i64,
    pub run_id: i64,
    pub status: OccurrenceStatus,
    pub duration_ms: Option<i64>,
    pub failure_msg_signature: Option<String>,
    pub stack_trace: Option<String>,
    pub attempt: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlakeFeatures {
    pub fail_success_ratio: f64,
    /// `None` when no reruns were observed at all (spec §9 open question:
    /// treated as an explicit "unknown" rather than a bare 0.0).
    pub rerun_pass_rate: Option<f64>,
    pub intermittency: f64,
    pub consecutive_failures: f64,
    pub message_variance: f64,
    pub clustering: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlakeScore {
    pub test_case_id: i64,
    pub score: f64,
    pub confidence: f64,
    pub features: FlakeFeatures,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    None,
    Warn,
    Quarantine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub test_case_id: i64,
    pub full_name: String,
    pub action: Action,
    pub priority: Priority,
    pub reason: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckConclusion {
    Success,
    Failure,
    Neutral,
    Cancelled,
    Skipped,
    TimedOut,
    ActionRequired,
    Stale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRunAction {
    pub identifier: String,
    pub label: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRun {
    pub platform_check_run_id: Option<i64>,
    pub repo_id: i64,
    pub head_sha: String,
    pub status: String,
    pub conclusion: Option<CheckConclusion>,
    pub output_title: String,
    pub output_summary: String,
    pub actions: Vec<CheckRunAction>,
}
