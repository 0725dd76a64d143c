//! Artifact fetcher (spec §4.3): resolves credentials, lists and filters
//! run artifacts, and streams each matching archive through the parser
//! without buffering the whole thing in memory.

use globset::{Glob, GlobSetBuilder};
use once_cell::sync::Lazy;

use crate::config::MAX_ARTIFACT_BYTES;
use crate::parser::{self, ParsedArchive};
use crate::platform::{ArtifactSummary, PlatformClient};

/// Name patterns a CI artifact must match to be considered a test-report
/// bundle (spec §4.3).
static NAME_GLOBS: Lazy<globset::GlobSet> = Lazy::new(|| {
    let mut builder = GlobSetBuilder::new();
    for pattern in
        ["test-results*", "junit*", "surefire-reports*", "test-reports*", "test-output", "coverage*"]
    {
        builder.add(Glob::new(pattern).expect("artifact name glob is valid"));
    }
    builder.build().expect("artifact name globset builds")
});

const ALLOWED_EXTENSIONS: [&str; 4] = [".xml", ".zip", ".tar.gz", ".tgz"];

#[derive(Debug, thiserror::Error)]
pub enum FetcherError {
    #[error("missing required repository or installation information")]
    MissingRepositoryContext,
    #[error(transparent)]
    Platform(#[from] crate::platform::errors::PlatformError),
}

impl FetcherError {
    pub fn retryable(&self) -> bool {
        matches!(self, FetcherError::Platform(e) if e.retryable())
    }
}

fn matches_name(name: &str) -> bool {
    NAME_GLOBS.is_match(name)
}

fn matches_extension(name: &str) -> bool {
    ALLOWED_EXTENSIONS.iter().any(|ext| name.to_ascii_lowercase().ends_with(ext))
}

fn is_eligible(artifact: &ArtifactSummary) -> bool {
    !artifact.expired
        && artifact.size_in_bytes <= *MAX_ARTIFACT_BYTES
        && matches_name(&artifact.name)
        && matches_extension(&artifact.name)
}

pub struct FetchOutcome {
    pub processed_artifacts: usize,
    pub archives: Vec<ParsedArchive>,
}

/// Fetch and parse every eligible artifact for one workflow run (spec
/// §4.3). Returns `Ok` with zero archives when no artifacts matched
/// (Scenario E) — that is success, not failure.
pub async fn fetch_and_parse(
    client: &PlatformClient,
    repo_full_name: Option<&str>,
    installation_id: Option<i64>,
    run_id: i64,
) -> Result<FetchOutcome, FetcherError> {
    let (repo_full_name, installation_id) = match (repo_full_name, installation_id) {
        (Some(r), Some(i)) => (r, i),
        _ => return Err(FetcherError::MissingRepositoryContext),
    };
    let (owner, repo) = repo_full_name
        .split_once('/')
        .ok_or(FetcherError::MissingRepositoryContext)?;

    let artifacts = client.list_artifacts(owner, repo, run_id, installation_id).await?;
    let eligible: Vec<_> = artifacts.into_iter().filter(is_eligible).collect();

    let mut archives = Vec::with_capacity(eligible.len());
    for artifact in &eligible {
        let mut buffer = Vec::new();
        let download_result = client
            .download_artifact(&artifact.archive_download_url, installation_id, *MAX_ARTIFACT_BYTES, |chunk| {
                buffer.extend_from_slice(&chunk);
                Ok(())
            })
            .await;

        match download_result {
            Ok(_) => match parser::parse_archive(&artifact.name, &buffer) {
                Ok(parsed) => archives.push(parsed),
                Err(err) => {
                    tracing::warn!(artifact = %artifact.name, error = %err, "failed to parse artifact, skipping");
                }
            },
            Err(err) if matches!(err, crate::platform::errors::PlatformError::ArtifactExpired) => {
                tracing::warn!(artifact = %artifact.name, "artifact url expired, skipping");
            }
            Err(err) => return Err(FetcherError::Platform(err)),
        }
    }

    Ok(FetchOutcome { processed_artifacts: eligible.len(), archives })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(name: &str, size: u64, expired: bool) -> ArtifactSummary {
        ArtifactSummary {
            id: 1,
            name: name.to_string(),
            size_in_bytes: size,
            expired,
            archive_download_url: "https://example.invalid/download".into(),
        }
    }

    #[test]
    fn matches_expected_name_patterns() {
        assert!(matches_name("test-results-linux"));
        assert!(matches_name("junit-xml"));
        assert!(matches_name("surefire-reports"));
        assert!(!matches_name("build-logs"));
    }

    #[test]
    fn eligible_requires_non_expired_and_known_extension() {
        assert!(is_eligible(&artifact("test-results.zip", 1024, false)));
        assert!(!is_eligible(&artifact("test-results.zip", 1024, true)));
        assert!(!is_eligible(&artifact("test-results.exe", 1024, false)));
    }

    #[test]
    fn eligible_enforces_max_size() {
        let huge = artifact("test-results.zip", *MAX_ARTIFACT_BYTES + 1, false);
        assert!(!is_eligible(&huge));
    }

    #[tokio::test]
    async fn fetch_and_parse_rejects_missing_repository_context() {
        let config = crate::platform::PlatformClientConfig {
            base_url: "https://example.invalid".to_string(),
            app_id: "1".to_string(),
            app_private_key_pem: String::new(),
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            queue_capacity: 1,
            worker_concurrency: 1,
        };
        let client = PlatformClient::new(config);
        let result = fetch_and_parse(&client, None, None, 1).await;
        assert!(matches!(result, Err(FetcherError::MissingRepositoryContext)));
    }
}
