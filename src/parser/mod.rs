//! Report parser (spec §4.4): given one fetched artifact's raw bytes,
//! walks its archive entries (or treats it as a single file), detects
//! report format, and stream-parses matching entries into normalized
//! `TestSuite`/`TestCase`/`Occurrence` records.

pub mod format;
pub mod xml;

use std::io::{Cursor, Read};

use crate::db::repository::ParsedSuite;
use format::ReportFormat;

const MAX_ENTRY_DEPTH: usize = 10;
const EXCLUDED_DIRS: [&str; 4] = ["node_modules", ".git", "__pycache__", "coverage"];

#[derive(Debug, thiserror::Error)]
pub enum ParserError {
    #[error("unsupported or unrecognized archive container")]
    UnsupportedContainer,
    #[error("zip read error: {0}")]
    Zip(String),
    #[error("tar read error: {0}")]
    Tar(String),
}

pub struct ParsedArchive {
    pub artifact_name: String,
    pub suites: Vec<ParsedSuite>,
    /// Entries that failed to parse; logged by the caller, never fatal to
    /// the job (spec §4.4: "tolerate malformed suites").
    pub warnings: Vec<String>,
}

fn entry_is_eligible(path: &str) -> bool {
    let depth = path.matches('/').count();
    if depth > MAX_ENTRY_DEPTH {
        return false;
    }
    if EXCLUDED_DIRS.iter().any(|dir| path.split('/').any(|seg| seg == *dir)) {
        return false;
    }
    path.to_ascii_lowercase().ends_with(".xml")
}

/// Parse one artifact's raw bytes. Dispatches on the artifact's declared
/// name/extension to the appropriate container reader; a bare `.xml`
/// artifact is treated as a single entry.
pub fn parse_archive(artifact_name: &str, raw: &[u8]) -> Result<ParsedArchive, ParserError> {
    let lower = artifact_name.to_ascii_lowercase();
    if lower.ends_with(".xml") {
        return Ok(parse_single_xml(artifact_name, raw));
    }
    if lower.ends_with(".zip") {
        return parse_zip(artifact_name, raw);
    }
    if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        return parse_tar_gz(artifact_name, raw);
    }
    Err(ParserError::UnsupportedContainer)
}

/// Detect the entry's report format before handing it to the XML walker
/// (spec §4.4). Only the JUnit-style XML formats (surefire, gradle,
/// pytest, phpunit, generic) are stream-parseable by `xml::parse_junit_xml`;
/// a confident Jest-JSON sniff means the content isn't XML at all, so that
/// entry is skipped with a warning instead of fed to the XML reader.
fn parse_entry(name: &str, content: &[u8]) -> (Vec<ParsedSuite>, Option<String>) {
    let (detected, confidence) = format::detect(name, content);
    if detected == ReportFormat::Jest && confidence >= 0.6 {
        return (Vec::new(), Some(format!("{name}: detected jest (json) report, no xml parser for this format, skipping")));
    }
    tracing::debug!(entry = name, format = detected.as_str(), confidence, "detected report format");
    match xml::parse_junit_xml(content) {
        Ok(suites) => (suites, None),
        Err(e) => (Vec::new(), Some(format!("{name}: {e}"))),
    }
}

fn parse_single_xml(artifact_name: &str, raw: &[u8]) -> ParsedArchive {
    let mut warnings = Vec::new();
    let (suites, warning) = parse_entry(artifact_name, raw);
    warnings.extend(warning);
    ParsedArchive { artifact_name: artifact_name.to_string(), suites, warnings }
}

fn parse_zip(artifact_name: &str, raw: &[u8]) -> Result<ParsedArchive, ParserError> {
    // `zip` entries require random access to the central directory; the
    // archive is already fully buffered by the fetcher (bounded by
    // `MAX_ARTIFACT_BYTES`), so reading it with a `Cursor` here adds no
    // further unbounded memory use.
    let reader = Cursor::new(raw);
    let mut archive = ::zip::ZipArchive::new(reader).map_err(|e| ParserError::Zip(e.to_string()))?;

    let mut suites = Vec::new();
    let mut warnings = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| ParserError::Zip(e.to_string()))?;
        let name = entry.name().to_string();
        if !entry_is_eligible(&name) {
            continue;
        }
        let mut content = Vec::new();
        if entry.read_to_end(&mut content).is_err() {
            warnings.push(format!("{name}: failed to read entry"));
            continue;
        }
        let (mut parsed, warning) = parse_entry(&name, &content);
        suites.append(&mut parsed);
        warnings.extend(warning);
    }

    Ok(ParsedArchive { artifact_name: artifact_name.to_string(), suites, warnings })
}

fn parse_tar_gz(artifact_name: &str, raw: &[u8]) -> Result<ParsedArchive, ParserError> {
    let gz = flate2::read::GzDecoder::new(Cursor::new(raw));
    let mut tar = tar::Archive::new(gz);

    let mut suites = Vec::new();
    let mut warnings = Vec::new();

    let entries = tar.entries().map_err(|e| ParserError::Tar(e.to_string()))?;
    for entry in entries {
        let mut entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warnings.push(format!("tar entry error: {e}"));
                continue;
            }
        };
        let path = entry.path().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
        if !entry_is_eligible(&path) {
            continue;
        }
        let mut content = Vec::new();
        if entry.read_to_end(&mut content).is_err() {
            warnings.push(format!("{path}: failed to read entry"));
            continue;
        }
        let (mut parsed, warning) = parse_entry(&path, &content);
        suites.append(&mut parsed);
        warnings.extend(warning);
    }

    Ok(ParsedArchive { artifact_name: artifact_name.to_string(), suites, warnings })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_depth_filter_rejects_deep_paths() {
        let deep = (0..15).map(|_| "d").collect::<Vec<_>>().join("/") + "/report.xml";
        assert!(!entry_is_eligible(&deep));
    }

    #[test]
    fn entry_excluded_dirs_are_skipped() {
        assert!(!entry_is_eligible("node_modules/pkg/report.xml"));
        assert!(!entry_is_eligible("coverage/report.xml"));
    }

    #[test]
    fn entry_only_accepts_xml() {
        assert!(!entry_is_eligible("results/report.json"));
        assert!(entry_is_eligible("results/report.xml"));
    }

    #[test]
    fn single_xml_artifact_parses_directly() {
        let xml = br#"<testsuite name="S" tests="0" failures="0" errors="0" skipped="0"></testsuite>"#;
        let parsed = parse_single_xml("report.xml", xml);
        assert_eq!(parsed.suites.len(), 1);
        assert!(parsed.warnings.is_empty());
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let result = parse_archive("report.bin", b"not an archive");
        assert!(matches!(result, Err(ParserError::UnsupportedContainer)));
    }

    #[test]
    fn jest_json_content_is_skipped_with_warning_not_fed_to_xml_parser() {
        let content = br#"{"testResults": [{"name": "a.test.js"}]}"#;
        let parsed = parse_single_xml("results.xml", content);
        assert!(parsed.suites.is_empty());
        assert_eq!(parsed.warnings.len(), 1);
        assert!(parsed.warnings[0].contains("jest"));
    }
}
