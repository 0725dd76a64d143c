use serde_json::Value;
use thiserror::Error;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize structured JSON logging, matching the startup sequence
/// used across this codebase's entry point.
pub fn init_tracing() {
    fmt().with_env_filter(EnvFilter::from_default_env()).json().init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    WorkflowRun,
    CheckRunAction,
    WorkflowJob,
    CheckSuite,
    PullRequest,
    Installation,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::WorkflowRun => "workflow_run",
            JobKind::CheckRunAction => "check_run",
            JobKind::WorkflowJob => "workflow_job",
            JobKind::CheckSuite => "check_suite",
            JobKind::PullRequest => "pull_request",
            JobKind::Installation => "installation",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetricValidationError {
    #[error("job outcome metric for `{kind}` missing payload")]
    MissingDetails { kind: &'static str },
    #[error("job outcome metric for `{kind}` missing required field `{field}`")]
    MissingField { kind: &'static str, field: &'static str },
}

/// Validate the shape of a job-completion metric payload before it is
/// recorded, following the same fail-closed validation discipline applied
/// to registry push/tag metrics.
pub fn validate_job_outcome_details(
    kind: JobKind,
    details: Option<&Value>,
) -> Result<(), MetricValidationError> {
    let payload = details.ok_or(MetricValidationError::MissingDetails { kind: kind.as_str() })?;
    require_field(payload, kind, "processed_artifacts")?;
    require_field(payload, kind, "total_tests")?;
    require_field(payload, kind, "failed_tests")?;
    Ok(())
}

fn require_field<'a>(
    payload: &'a Value,
    kind: JobKind,
    field: &'static str,
) -> Result<&'a Value, MetricValidationError> {
    payload
        .get(field)
        .ok_or(MetricValidationError::MissingField { kind: kind.as_str(), field })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_outcome_requires_expected_fields() {
        let payload = json!({ "processed_artifacts": 1, "total_tests": 2, "failed_tests": 1 });
        assert!(validate_job_outcome_details(JobKind::WorkflowRun, Some(&payload)).is_ok());
    }

    #[test]
    fn job_outcome_missing_field_is_reported() {
        let payload = json!({ "processed_artifacts": 1 });
        let err = validate_job_outcome_details(JobKind::WorkflowRun, Some(&payload))
            .expect_err("missing total_tests should error");
        assert!(matches!(
            err,
            MetricValidationError::MissingField { field: "total_tests", .. }
        ));
    }

    #[test]
    fn job_outcome_missing_payload_is_reported() {
        let err = validate_job_outcome_details(JobKind::CheckSuite, None)
            .expect_err("missing payload should error");
        assert!(matches!(err, MetricValidationError::MissingDetails { .. }));
    }
}
