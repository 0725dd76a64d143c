//! Event-driven JUnit-style XML parsing (spec §4.4). Walks the document
//! with `quick_xml`'s pull-based reader so no DOM is ever materialized;
//! `TestSuite`/`TestCase` records are emitted as their closing tags are
//! seen.

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::db::repository::{ParsedCase, ParsedOccurrence, ParsedSuite};
use crate::models::{OccurrenceStatus, SuiteTotals};

#[derive(Debug, thiserror::Error)]
pub enum XmlParseError {
    #[error("xml parse error: {0}")]
    Malformed(String),
}

struct SuiteBuilder {
    name: String,
    package: Option<String>,
    totals: SuiteTotals,
    time_secs: Option<f64>,
    timestamp: Option<chrono::DateTime<chrono::Utc>>,
    cases: Vec<ParsedCase>,
}

struct CaseBuilder {
    class_name: String,
    name: String,
    file: Option<String>,
    time_secs: Option<f64>,
    status: OccurrenceStatus,
    failure_msg_signature: Option<String>,
    stack_trace: Option<String>,
}

fn attr_value(e: &quick_xml::events::BytesStart, key: &str) -> Option<String> {
    e.attributes().flatten().find(|a| a.key.as_ref() == key.as_bytes()).and_then(|a| {
        a.unescape_value().ok().map(|v| v.into_owned())
    })
}

fn parse_seconds(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok()
}

/// Stream-parse one JUnit-style XML report. Tolerates malformed documents
/// by returning an error for the caller to log and skip (spec §4.4's
/// "tolerate malformed suites" behavior lives one layer up, in
/// `parser::parse_archive`, which continues with other files on error).
pub fn parse_junit_xml(content: &[u8]) -> Result<Vec<ParsedSuite>, XmlParseError> {
    let mut reader = Reader::from_reader(content);
    reader.trim_text(true);

    let mut suites = Vec::new();
    let mut suite_stack: Vec<SuiteBuilder> = Vec::new();
    let mut case_stack: Vec<CaseBuilder> = Vec::new();
    let mut text_buf = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let tag = e.name().as_ref().to_vec();
                match tag.as_slice() {
                    b"testsuite" => {
                        let tests = attr_value(&e, "tests").and_then(|v| v.parse().ok()).unwrap_or(0);
                        let failures = attr_value(&e, "failures").and_then(|v| v.parse().ok()).unwrap_or(0);
                        let errors = attr_value(&e, "errors").and_then(|v| v.parse().ok()).unwrap_or(0);
                        let skipped = attr_value(&e, "skipped").and_then(|v| v.parse().ok()).unwrap_or(0);
                        let time_secs = attr_value(&e, "time").and_then(|v| parse_seconds(&v));
                        let timestamp = attr_value(&e, "timestamp")
                            .and_then(|v| chrono::DateTime::parse_from_rfc3339(&v).ok())
                            .map(|dt| dt.with_timezone(&chrono::Utc));
                        suite_stack.push(SuiteBuilder {
                            name: attr_value(&e, "name").unwrap_or_else(|| "unnamed".to_string()),
                            package: attr_value(&e, "package"),
                            totals: SuiteTotals { tests, failures, errors, skipped },
                            time_secs,
                            timestamp,
                            cases: Vec::new(),
                        });
                    }
                    b"testcase" => {
                        case_stack.push(CaseBuilder {
                            class_name: attr_value(&e, "classname").unwrap_or_default(),
                            name: attr_value(&e, "name").unwrap_or_else(|| "unnamed".to_string()),
                            file: attr_value(&e, "file"),
                            time_secs: attr_value(&e, "time").and_then(|v| parse_seconds(&v)),
                            status: OccurrenceStatus::Passed,
                            failure_msg_signature: None,
                            stack_trace: None,
                        });
                    }
                    b"failure" => {
                        if let Some(case) = case_stack.last_mut() {
                            case.status = OccurrenceStatus::Failed;
                            case.failure_msg_signature = attr_value(&e, "message");
                        }
                        text_buf.clear();
                    }
                    b"error" => {
                        if let Some(case) = case_stack.last_mut() {
                            case.status = OccurrenceStatus::Error;
                            case.failure_msg_signature = attr_value(&e, "message");
                        }
                        text_buf.clear();
                    }
                    b"system-out" | b"system-err" => {
                        text_buf.clear();
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                let tag = e.name().as_ref().to_vec();
                if tag.as_slice() == b"skipped" {
                    if let Some(case) = case_stack.last_mut() {
                        case.status = OccurrenceStatus::Skipped;
                        case.failure_msg_signature = attr_value(&e, "message");
                    }
                } else if tag.as_slice() == b"testcase" {
                    case_stack.push(CaseBuilder {
                        class_name: attr_value(&e, "classname").unwrap_or_default(),
                        name: attr_value(&e, "name").unwrap_or_else(|| "unnamed".to_string()),
                        file: attr_value(&e, "file"),
                        time_secs: attr_value(&e, "time").and_then(|v| parse_seconds(&v)),
                        status: OccurrenceStatus::Passed,
                        failure_msg_signature: None,
                        stack_trace: None,
                    });
                    close_case(&mut case_stack, &mut suite_stack);
                }
            }
            Ok(Event::Text(e)) => {
                if let Ok(unescaped) = e.unescape() {
                    text_buf.push_str(&unescaped);
                }
            }
            Ok(Event::End(e)) => {
                let tag = e.name().as_ref().to_vec();
                match tag.as_slice() {
                    b"failure" | b"error" => {
                        if let Some(case) = case_stack.last_mut() {
                            if !text_buf.trim().is_empty() {
                                case.stack_trace = Some(text_buf.trim().to_string());
                            }
                        }
                        text_buf.clear();
                    }
                    b"testcase" => {
                        close_case(&mut case_stack, &mut suite_stack);
                    }
                    b"testsuite" => {
                        if let Some(finished) = suite_stack.pop() {
                            suites.push(finish_suite(finished));
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(XmlParseError::Malformed(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(suites)
}

fn close_case(case_stack: &mut Vec<CaseBuilder>, suite_stack: &mut [SuiteBuilder]) {
    let Some(case) = case_stack.pop() else { return };
    let Some(suite) = suite_stack.last_mut() else { return };
    suite.cases.push(ParsedCase {
        class_name: case.class_name,
        name: case.name,
        file: case.file,
        occurrences: vec![ParsedOccurrence {
            attempt: 1,
            status: case.status,
            duration_ms: case.time_secs.map(|s| (s * 1000.0).round() as i64),
            failure_msg_signature: case.failure_msg_signature,
            stack_trace: case.stack_trace,
        }],
    });
}

fn finish_suite(builder: SuiteBuilder) -> ParsedSuite {
    ParsedSuite {
        name: builder.name,
        package: builder.package,
        totals: builder.totals,
        time_secs: builder.time_secs,
        timestamp: builder.timestamp,
        cases: builder.cases,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<testsuite name="ExampleTestSuite" tests="2" failures="1" errors="0" skipped="0" time="0.5">
  <testcase classname="com.example.TestClass" name="testPass" time="0.1"/>
  <testcase classname="com.example.TestClass" name="testFail" time="0.4">
    <failure message="Assertion failed">at line 10</failure>
  </testcase>
</testsuite>"#;

    #[test]
    fn parses_suite_and_case_totals() {
        let suites = parse_junit_xml(SAMPLE.as_bytes()).unwrap();
        assert_eq!(suites.len(), 1);
        let suite = &suites[0];
        assert_eq!(suite.name, "ExampleTestSuite");
        assert_eq!(suite.cases.len(), 2);
        assert_eq!(suite.totals.tests, 2);
        assert_eq!(suite.totals.failures, 1);
    }

    #[test]
    fn extracts_failure_message_and_duration() {
        let suites = parse_junit_xml(SAMPLE.as_bytes()).unwrap();
        let failing = suites[0].cases.iter().find(|c| c.name == "testFail").unwrap();
        let occ = &failing.occurrences[0];
        assert_eq!(occ.status, OccurrenceStatus::Failed);
        assert_eq!(occ.failure_msg_signature.as_deref(), Some("Assertion failed"));
        assert_eq!(occ.duration_ms, Some(400));
    }

    #[test]
    fn passing_case_has_no_failure_signature() {
        let suites = parse_junit_xml(SAMPLE.as_bytes()).unwrap();
        let passing = suites[0].cases.iter().find(|c| c.name == "testPass").unwrap();
        assert_eq!(passing.occurrences[0].status, OccurrenceStatus::Passed);
        assert_eq!(passing.occurrences[0].duration_ms, Some(100));
    }

    #[test]
    fn malformed_xml_is_reported_not_panicked() {
        let result = parse_junit_xml(b"<testsuite name=\"x\"><testcase");
        assert!(result.is_err());
    }

    #[test]
    fn nested_testsuites_root_is_supported() {
        let nested = r#"<testsuites>
          <testsuite name="A" tests="1" failures="0" errors="0" skipped="0">
            <testcase classname="c" name="t" time="0.01"/>
          </testsuite>
          <testsuite name="B" tests="1" failures="0" errors="0" skipped="1">
            <testcase classname="c" name="t2" time="0.0">
              <skipped/>
            </testcase>
          </testsuite>
        </testsuites>"#;
        let suites = parse_junit_xml(nested.as_bytes()).unwrap();
        assert_eq!(suites.len(), 2);
        assert_eq!(suites[1].cases[0].occurrences[0].status, OccurrenceStatus::Skipped);
    }
}
