//! Test cases and suites
//!
//! A test case is a named closure plus the list of context entries it needs.
//! The declared names are the whole injection contract: the injector looks
//! them up before the body runs, and the body can only read what it declared.

use crate::asserts::AssertionError;
use crate::description::ValidationError;
use crate::inject::{Bindings, InjectionError};
use std::collections::HashSet;
use std::fmt;

/// When a test case runs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// While the topology is running
    Active,
    /// After the topology has been shut down
    PostShutdown,
}

impl Phase {
    /// Suite name used in reports
    pub fn suite_name(&self) -> &'static str {
        match self {
            Phase::Active => "active_tests",
            Phase::PostShutdown => "after_shutdown_tests",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Active => f.write_str("active"),
            Phase::PostShutdown => f.write_str("post-shutdown"),
        }
    }
}

/// Why a test case did not pass
#[derive(Debug, Clone, PartialEq)]
pub enum TestFailure {
    /// An assertion did not hold
    Failed(String),
    /// The test could not run properly (injection error, panic, other error)
    Errored(String),
}

impl TestFailure {
    pub fn failed(msg: impl Into<String>) -> Self {
        TestFailure::Failed(msg.into())
    }

    pub fn errored(msg: impl Into<String>) -> Self {
        TestFailure::Errored(msg.into())
    }

    pub fn message(&self) -> &str {
        match self {
            TestFailure::Failed(m) | TestFailure::Errored(m) => m,
        }
    }
}

impl fmt::Display for TestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl From<AssertionError> for TestFailure {
    fn from(e: AssertionError) -> Self {
        TestFailure::Failed(e.to_string())
    }
}

impl From<InjectionError> for TestFailure {
    fn from(e: InjectionError) -> Self {
        TestFailure::Errored(e.to_string())
    }
}

impl From<anyhow::Error> for TestFailure {
    fn from(e: anyhow::Error) -> Self {
        TestFailure::Errored(format!("{:#}", e))
    }
}

impl From<std::io::Error> for TestFailure {
    fn from(e: std::io::Error) -> Self {
        TestFailure::Errored(e.to_string())
    }
}

pub type TestOutcome = Result<(), TestFailure>;

type TestBody = Box<dyn Fn(&Bindings<'_>) -> TestOutcome + Send + Sync>;

pub struct TestCase {
    name: String,
    phase: Phase,
    requires: Vec<String>,
    body: TestBody,
}

impl TestCase {
    /// Active-phase test
    pub fn active<F>(name: impl Into<String>, requires: &[&str], body: F) -> Self
    where
        F: Fn(&Bindings<'_>) -> TestOutcome + Send + Sync + 'static,
    {
        Self::new(Phase::Active, name, requires, body)
    }

    /// Post-shutdown test
    pub fn post_shutdown<F>(name: impl Into<String>, requires: &[&str], body: F) -> Self
    where
        F: Fn(&Bindings<'_>) -> TestOutcome + Send + Sync + 'static,
    {
        Self::new(Phase::PostShutdown, name, requires, body)
    }

    pub fn new<F>(phase: Phase, name: impl Into<String>, requires: &[&str], body: F) -> Self
    where
        F: Fn(&Bindings<'_>) -> TestOutcome + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            phase,
            requires: requires.iter().map(|s| s.to_string()).collect(),
            body: Box::new(body),
        }
    }

    /// Same as `new`, with owned requirement names
    pub fn with_requirements<F>(
        phase: Phase,
        name: impl Into<String>,
        requires: Vec<String>,
        body: F,
    ) -> Self
    where
        F: Fn(&Bindings<'_>) -> TestOutcome + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            phase,
            requires,
            body: Box::new(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn requires(&self) -> &[String] {
        &self.requires
    }

    pub fn run(&self, bindings: &Bindings<'_>) -> TestOutcome {
        (self.body)(bindings)
    }
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("requires", &self.requires)
            .finish()
    }
}

/// Both batteries of a launch test
#[derive(Debug, Default)]
pub struct TestSuite {
    cases: Vec<TestCase>,
}

impl TestSuite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, case: TestCase) -> Self {
        self.push(case);
        self
    }

    pub fn push(&mut self, case: TestCase) {
        self.cases.push(case);
    }

    /// Cases of one phase, in declaration order
    pub fn phase(&self, phase: Phase) -> impl Iterator<Item = &TestCase> {
        self.cases.iter().filter(move |c| c.phase == phase)
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Test names must be unique within a phase
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for case in &self.cases {
            if !seen.insert((case.phase, case.name.as_str())) {
                return Err(ValidationError::DuplicateTest {
                    phase: case.phase.suite_name(),
                    name: case.name.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(phase: Phase, name: &str) -> TestCase {
        TestCase::new(phase, name, &[], |_| Ok(()))
    }

    #[test]
    fn test_phase_split_keeps_order() {
        let suite = TestSuite::new()
            .with(noop(Phase::Active, "a1"))
            .with(noop(Phase::PostShutdown, "p1"))
            .with(noop(Phase::Active, "a2"));

        let active: Vec<_> = suite.phase(Phase::Active).map(|c| c.name()).collect();
        let post: Vec<_> = suite.phase(Phase::PostShutdown).map(|c| c.name()).collect();
        assert_eq!(active, vec!["a1", "a2"]);
        assert_eq!(post, vec!["p1"]);
    }

    #[test]
    fn test_duplicate_names_per_phase() {
        let ok = TestSuite::new()
            .with(noop(Phase::Active, "same"))
            .with(noop(Phase::PostShutdown, "same"));
        assert!(ok.validate().is_ok());

        let dup = TestSuite::new()
            .with(noop(Phase::Active, "same"))
            .with(noop(Phase::Active, "same"));
        assert_eq!(
            dup.validate(),
            Err(ValidationError::DuplicateTest {
                phase: "active_tests",
                name: "same".into()
            })
        );
    }

    #[test]
    fn test_failure_conversions() {
        let failed: TestFailure = AssertionError::Mismatch("bad".into()).into();
        assert_eq!(failed, TestFailure::Failed("bad".into()));

        let errored: TestFailure = anyhow::anyhow!("boom").into();
        assert!(matches!(errored, TestFailure::Errored(ref m) if m == "boom"));
    }
}
