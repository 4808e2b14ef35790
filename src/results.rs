//! Per-test outcomes and their aggregation into the two phase collections

use crate::suite::{Phase, TestFailure};
use serde::Serialize;
use std::time::Duration;

/// Longest failure detail kept in a result
pub const MAX_MESSAGE_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pass,
    Fail,
    Error,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Pass => "PASS",
            TestStatus::Fail => "FAIL",
            TestStatus::Error => "ERROR",
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            TestStatus::Pass => "✓",
            TestStatus::Fail => "✗",
            TestStatus::Error => "!",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestResult {
    pub name: String,
    pub phase: Phase,
    pub status: TestStatus,
    pub duration: Duration,
    /// Empty for passing tests, truncated to 4KB otherwise
    pub message: String,
}

impl TestResult {
    pub fn pass(name: impl Into<String>, phase: Phase, duration: Duration) -> Self {
        Self {
            name: name.into(),
            phase,
            status: TestStatus::Pass,
            duration,
            message: String::new(),
        }
    }

    pub fn fail(name: impl Into<String>, phase: Phase, duration: Duration, message: String) -> Self {
        Self {
            name: name.into(),
            phase,
            status: TestStatus::Fail,
            duration,
            message: truncate_message(message),
        }
    }

    pub fn error(name: impl Into<String>, phase: Phase, duration: Duration, message: String) -> Self {
        Self {
            name: name.into(),
            phase,
            status: TestStatus::Error,
            duration,
            message: truncate_message(message),
        }
    }

    pub fn from_outcome(
        name: impl Into<String>,
        phase: Phase,
        duration: Duration,
        outcome: Result<(), TestFailure>,
    ) -> Self {
        match outcome {
            Ok(()) => Self::pass(name, phase, duration),
            Err(TestFailure::Failed(msg)) => Self::fail(name, phase, duration, msg),
            Err(TestFailure::Errored(msg)) => Self::error(name, phase, duration, msg),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TestStatus::Pass
    }
}

fn truncate_message(msg: String) -> String {
    if msg.len() <= MAX_MESSAGE_LEN {
        return msg;
    }
    let mut end = MAX_MESSAGE_LEN;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &msg[..end])
}

/// All results of one phase, in execution order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseResults {
    results: Vec<TestResult>,
}

impl PhaseResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, result: TestResult) {
        self.results.push(result);
    }

    pub fn iter(&self) -> impl Iterator<Item = &TestResult> {
        self.results.iter()
    }

    pub fn get(&self, name: &str) -> Option<&TestResult> {
        self.results.iter().find(|r| r.name == name)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn count(&self, status: TestStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn passed(&self) -> usize {
        self.count(TestStatus::Pass)
    }

    pub fn failed(&self) -> usize {
        self.count(TestStatus::Fail)
    }

    pub fn errors(&self) -> usize {
        self.count(TestStatus::Error)
    }

    pub fn duration(&self) -> Duration {
        self.results.iter().map(|r| r.duration).sum()
    }

    pub fn was_successful(&self) -> bool {
        self.results.iter().all(TestResult::is_success)
    }
}

/// Both collections of a finished run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunResults {
    pub active: PhaseResults,
    pub after_shutdown: PhaseResults,
}

impl RunResults {
    pub fn phase(&self, phase: Phase) -> &PhaseResults {
        match phase {
            Phase::Active => &self.active,
            Phase::PostShutdown => &self.after_shutdown,
        }
    }

    pub fn total(&self) -> usize {
        self.active.len() + self.after_shutdown.len()
    }

    pub fn count(&self, status: TestStatus) -> usize {
        self.active.count(status) + self.after_shutdown.count(status)
    }

    pub fn was_successful(&self) -> bool {
        self.active.was_successful() && self.after_shutdown.was_successful()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_long_message() {
        let msg = "x".repeat(5000);
        let r = TestResult::fail("t", Phase::Active, Duration::ZERO, msg);
        assert!(r.message.len() < 5000);
        assert!(r.message.ends_with("... [truncated]"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        // 'é' is two bytes, so byte 4096 falls inside a character
        let msg = format!("a{}", "é".repeat(3000));
        let r = TestResult::error("t", Phase::Active, Duration::ZERO, msg);
        assert!(r.message.ends_with("... [truncated]"));
    }

    #[test]
    fn test_outcome_mapping() {
        let ok = TestResult::from_outcome("a", Phase::Active, Duration::ZERO, Ok(()));
        assert_eq!(ok.status, TestStatus::Pass);
        let fail = TestResult::from_outcome(
            "b",
            Phase::Active,
            Duration::ZERO,
            Err(TestFailure::failed("nope")),
        );
        assert_eq!(fail.status, TestStatus::Fail);
        assert_eq!(fail.message, "nope");
        let err = TestResult::from_outcome(
            "c",
            Phase::PostShutdown,
            Duration::ZERO,
            Err(TestFailure::errored("boom")),
        );
        assert_eq!(err.status, TestStatus::Error);
    }

    #[test]
    fn test_run_success_requires_both_phases() {
        let mut results = RunResults::default();
        assert!(results.was_successful());

        results
            .active
            .push(TestResult::pass("a", Phase::Active, Duration::from_millis(3)));
        assert!(results.was_successful());

        results.after_shutdown.push(TestResult::error(
            "b",
            Phase::PostShutdown,
            Duration::ZERO,
            "boom".into(),
        ));
        assert!(!results.was_successful());
        assert!(results.active.was_successful());
        assert_eq!(results.count(TestStatus::Error), 1);
        assert_eq!(results.total(), 2);
    }

    #[test]
    fn test_phase_counts() {
        let mut phase = PhaseResults::new();
        phase.push(TestResult::pass("a", Phase::Active, Duration::from_millis(1)));
        phase.push(TestResult::fail("b", Phase::Active, Duration::from_millis(2), "x".into()));
        assert_eq!(phase.passed(), 1);
        assert_eq!(phase.failed(), 1);
        assert_eq!(phase.errors(), 0);
        assert_eq!(phase.duration(), Duration::from_millis(3));
        assert_eq!(phase.get("b").map(|r| r.status), Some(TestStatus::Fail));
    }
}
