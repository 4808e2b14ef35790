//! JUnit XML report for CI integration
//!
//! One `<testsuites>` document with exactly two suites, `active_tests` and
//! `after_shutdown_tests`. Failed assertions become `<failure>`, everything
//! else that went wrong becomes `<error>`.

use crate::results::{PhaseResults, RunResults, TestResult, TestStatus};
use crate::suite::Phase;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Strip ANSI color codes from strings
fn strip_ansi_codes(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // Skip escape sequence
            if chars.peek() == Some(&'[') {
                chars.next(); // consume '['
                              // Skip until we hit a letter
                while let Some(&next) = chars.peek() {
                    chars.next();
                    if next.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
        } else if c != '\0' {
            // Skip null bytes
            result.push(c);
        }
    }
    result
}

// =============================================================================
// XML Schema Structs (JUnit Format)
// =============================================================================

#[derive(Serialize)]
#[serde(rename = "testsuites")]
struct XmlTestSuites {
    #[serde(rename = "@tests")]
    tests: usize,
    #[serde(rename = "@failures")]
    failures: usize,
    #[serde(rename = "@errors")]
    errors: usize,
    #[serde(rename = "testsuite")]
    suites: Vec<XmlTestSuite>,
}

#[derive(Serialize)]
struct XmlTestSuite {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@tests")]
    tests: usize,
    #[serde(rename = "@failures")]
    failures: usize,
    #[serde(rename = "@errors")]
    errors: usize,
    #[serde(rename = "@time")]
    time: f64,
    #[serde(rename = "testcase")]
    cases: Vec<XmlTestCase>,
}

#[derive(Serialize)]
struct XmlTestCase {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@classname")]
    classname: String,
    #[serde(rename = "@time")]
    time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<XmlProblem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<XmlProblem>,
}

#[derive(Serialize)]
struct XmlProblem {
    #[serde(rename = "@message")]
    message: String,
    #[serde(rename = "$text")]
    body: String,
}

impl XmlTestCase {
    fn from_result(result: &TestResult) -> Self {
        let problem = |summary: &str| XmlProblem {
            message: summary.to_string(),
            body: strip_ansi_codes(&result.message),
        };
        let (failure, error) = match result.status {
            TestStatus::Pass => (None, None),
            TestStatus::Fail => (Some(problem("Test failed")), None),
            TestStatus::Error => (None, Some(problem("Test error"))),
        };
        Self {
            name: result.name.clone(),
            classname: result.phase.suite_name().to_string(),
            time: result.duration.as_secs_f64(),
            failure,
            error,
        }
    }
}

fn suite(phase: Phase, results: &PhaseResults) -> XmlTestSuite {
    XmlTestSuite {
        name: phase.suite_name().to_string(),
        tests: results.len(),
        failures: results.failed(),
        errors: results.errors(),
        time: results.duration().as_secs_f64(),
        cases: results.iter().map(XmlTestCase::from_result).collect(),
    }
}

/// Render the report document, XML declaration included
pub fn to_xml(results: &RunResults) -> Result<String> {
    let root = XmlTestSuites {
        tests: results.total(),
        failures: results.count(TestStatus::Fail),
        errors: results.count(TestStatus::Error),
        suites: vec![
            suite(Phase::Active, &results.active),
            suite(Phase::PostShutdown, &results.after_shutdown),
        ],
    };
    let body = quick_xml::se::to_string(&root).context("failed to serialize JUnit report")?;
    Ok(format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{}",
        body
    ))
}

pub fn write_report(path: &Path, results: &RunResults) -> Result<()> {
    let xml = to_xml(results)?;
    let file = File::create(path)
        .with_context(|| format!("failed to create JUnit report {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(xml.as_bytes())
        .with_context(|| format!("failed to write JUnit report {}", path.display()))?;
    writer.flush()?;
    info!(path = %path.display(), "JUnit report written");
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_strip_ansi_codes() {
        // Color code: "\x1b[31mRed text\x1b[0m"
        let input = "\x1b[31mRed text\x1b[0m";
        let output = strip_ansi_codes(input);
        assert_eq!(output, "Red text");

        // No ANSI codes
        assert_eq!(strip_ansi_codes("plain text"), "plain text");

        // Multiple codes
        let input = "\x1b[1m\x1b[31mBold Red\x1b[0m";
        assert_eq!(strip_ansi_codes(input), "Bold Red");
    }

    #[test]
    fn test_strip_null_bytes() {
        assert_eq!(strip_ansi_codes("text\0with\0nulls"), "textwithnulls");
    }

    #[test]
    fn test_strip_ansi_cursor_movement() {
        let input = "\x1b[2Jcleared\x1b[1;1H";
        assert_eq!(strip_ansi_codes(input), "cleared");
    }

    fn sample() -> RunResults {
        let mut results = RunResults::default();
        results.active.push(TestResult::pass(
            "test_talker_output",
            Phase::Active,
            Duration::from_millis(1500),
        ));
        results.active.push(TestResult::fail(
            "test_listener_output",
            Phase::Active,
            Duration::from_millis(20),
            "\x1b[31mnot found\x1b[0m: hello".into(),
        ));
        results.after_shutdown.push(TestResult::error(
            "test_exit_codes",
            Phase::PostShutdown,
            Duration::ZERO,
            "test panicked: boom".into(),
        ));
        results
    }

    #[test]
    fn test_report_has_exactly_two_suites() {
        let xml = to_xml(&sample()).unwrap();
        assert!(xml.starts_with("<?xml"));
        assert_eq!(xml.matches("<testsuite ").count(), 2);
        assert!(xml.contains("name=\"active_tests\""));
        assert!(xml.contains("name=\"after_shutdown_tests\""));
    }

    #[test]
    fn test_failures_and_errors_are_distinct() {
        let xml = to_xml(&sample()).unwrap();
        assert_eq!(xml.matches("<failure").count(), 1);
        assert_eq!(xml.matches("<error").count(), 1);
        assert!(xml.contains("not found: hello"));
        assert!(!xml.contains('\x1b'));
    }

    #[test]
    fn test_empty_run_still_lists_both_suites() {
        let xml = to_xml(&RunResults::default()).unwrap();
        assert_eq!(xml.matches("<testsuite ").count(), 2);
    }

    #[test]
    fn test_write_report_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.xml");
        write_report(&path, &sample()).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("test_talker_output"));
        assert!(written.contains("time=\"1.5\""));
    }
}
