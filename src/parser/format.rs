//! Report format detection (spec §4.4): filename plus a bounded content
//! sniff over the first ≤2 KiB, content sniff winning over filename when
//! confident.

pub const SNIFF_WINDOW_BYTES: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Surefire,
    Gradle,
    Jest,
    Pytest,
    Phpunit,
    Generic,
}

impl ReportFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportFormat::Surefire => "surefire",
            ReportFormat::Gradle => "gradle",
            ReportFormat::Jest => "jest",
            ReportFormat::Pytest => "pytest",
            ReportFormat::Phpunit => "phpunit",
            ReportFormat::Generic => "generic",
        }
    }
}

fn detect_from_name(name: &str) -> Option<ReportFormat> {
    let lower = name.to_ascii_lowercase();
    if lower.contains("surefire") {
        Some(ReportFormat::Surefire)
    } else if lower.contains("gradle") {
        Some(ReportFormat::Gradle)
    } else if lower.contains("jest") {
        Some(ReportFormat::Jest)
    } else if lower.contains("pytest") {
        Some(ReportFormat::Pytest)
    } else if lower.contains("phpunit") {
        Some(ReportFormat::Phpunit)
    } else {
        None
    }
}

/// Sniff the first `SNIFF_WINDOW_BYTES` of an entry's content for
/// format-identifying markers. Higher confidence wins over the filename
/// guess.
fn detect_from_content(content_prefix: &[u8]) -> Option<(ReportFormat, f32)> {
    let window = &content_prefix[..content_prefix.len().min(SNIFF_WINDOW_BYTES)];
    let text = String::from_utf8_lossy(window);
    if text.contains("hostname=") && text.contains("<properties>") {
        return Some((ReportFormat::Surefire, 0.8));
    }
    if text.contains("pytest") || text.contains("<testsuite") && text.contains("file=") && text.contains("line=") {
        return Some((ReportFormat::Pytest, 0.6));
    }
    if text.contains("\"testResults\"") {
        return Some((ReportFormat::Jest, 0.9));
    }
    if text.contains("phpunit") {
        return Some((ReportFormat::Phpunit, 0.7));
    }
    if text.contains("<testsuite") {
        return Some((ReportFormat::Generic, 0.3));
    }
    None
}

/// Returns the detected format and a confidence in `[0,1]`.
pub fn detect(name: &str, content_prefix: &[u8]) -> (ReportFormat, f32) {
    let by_content = detect_from_content(content_prefix);
    let by_name = detect_from_name(name);

    match (by_content, by_name) {
        (Some((content_fmt, confidence)), _) if confidence >= 0.6 => (content_fmt, confidence),
        (_, Some(name_fmt)) => (name_fmt, 0.5),
        (Some((content_fmt, confidence)), None) => (content_fmt, confidence),
        (None, None) => (ReportFormat::Generic, 0.1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_hints_surefire() {
        let (fmt, _) = detect("surefire-reports/TEST-com.Foo.xml", b"<testsuite></testsuite>");
        assert_eq!(fmt, ReportFormat::Surefire);
    }

    #[test]
    fn content_sniff_wins_when_confident() {
        let content = br#"{"testResults": []}"#;
        let (fmt, confidence) = detect("results.xml", content);
        assert_eq!(fmt, ReportFormat::Jest);
        assert!(confidence >= 0.6);
    }

    #[test]
    fn unknown_defaults_to_generic() {
        let (fmt, confidence) = detect("report.xml", b"not xml at all");
        assert_eq!(fmt, ReportFormat::Generic);
        assert!(confidence < 0.5);
    }
}
