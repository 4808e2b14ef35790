//! Assertions available to test cases
//!
//! Everything returns `Result<(), AssertionError>` so test bodies can use `?`.
//! An `AssertionError` turns into a `Fail` result; any other error type a test
//! returns is recorded as `Error`.

use crate::output::OutputCapture;
use crate::process::{ProcInfo, ProcessRef};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Maximum number of observed lines quoted in a failure message
const OBSERVED_TAIL: usize = 20;

#[derive(Debug, Error, PartialEq)]
pub enum AssertionError {
    #[error(
        "timed out after {timeout:?} waiting for '{expected}' in output of {process}; captured so far:{}",
        format_observed(observed)
    )]
    WaitTimeout {
        expected: String,
        process: String,
        timeout: Duration,
        observed: Vec<String>,
    },
    #[error("did not find '{expected}' in output of {process}")]
    NotFound { expected: String, process: String },
    #[error("'{expected}' not found in output of {process} after line {cursor}")]
    NotFoundInSequence {
        expected: String,
        process: String,
        cursor: usize,
    },
    #[error("did not find any process matching {query}; known processes: [{}]", known.join(", "))]
    NoMatchingProcess { query: String, known: Vec<String> },
    #[error("found multiple processes matching {query}: [{}]", matches.join(", "))]
    AmbiguousProcess { query: String, matches: Vec<String> },
    #[error("process '{process}' exited with {returncode}, allowed: {allowed:?}")]
    ExitCode {
        process: String,
        returncode: i32,
        allowed: Vec<i32>,
    },
    #[error("process '{process}' has not exited yet")]
    StillRunning { process: String },
    #[error("{0}")]
    Mismatch(String),
}

fn format_observed(observed: &[String]) -> String {
    if observed.is_empty() {
        return " <nothing>".to_string();
    }
    let skipped = observed.len().saturating_sub(OBSERVED_TAIL);
    let mut out = String::new();
    if skipped > 0 {
        out.push_str(&format!("\n  ... {} earlier lines", skipped));
    }
    for line in &observed[skipped..] {
        out.push_str("\n  ");
        out.push_str(line);
    }
    out
}

// =============================================================================
// Sequential output
// =============================================================================

/// Forward-only cursor over one process's output.
///
/// Each successful `assert_in_output` moves the cursor past the matching line,
/// so a later assertion cannot match anything at or before it. Dropping the
/// checker only releases the cursor; the capture is never modified.
pub struct SequentialChecker {
    capture: Arc<OutputCapture>,
    cursor: usize,
    timeout: Duration,
}

impl SequentialChecker {
    pub fn new(capture: Arc<OutputCapture>) -> Self {
        Self {
            capture,
            cursor: 0,
            timeout: Duration::ZERO,
        }
    }

    /// Wait up to `timeout` for output that has not arrived yet
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Index of the next line that will be scanned
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn assert_in_output(&mut self, expected: &str) -> Result<(), AssertionError> {
        match self.capture.find_from(self.cursor, expected, self.timeout) {
            Some(index) => {
                self.cursor = index + 1;
                Ok(())
            }
            None => Err(AssertionError::NotFoundInSequence {
                expected: expected.to_string(),
                process: self.capture.process().to_string(),
                cursor: self.cursor,
            }),
        }
    }
}

// =============================================================================
// Exit codes and plain values
// =============================================================================

/// Every exited process returned one of `allowed`
pub fn assert_exit_codes(proc_info: &ProcInfo, allowed: &[i32]) -> Result<(), AssertionError> {
    for exit in proc_info.iter() {
        if !allowed.contains(&exit.returncode) {
            return Err(AssertionError::ExitCode {
                process: exit.process.name.clone(),
                returncode: exit.returncode,
                allowed: allowed.to_vec(),
            });
        }
    }
    Ok(())
}

/// `process` has exited, with one of `allowed`
pub fn assert_exit_code(
    proc_info: &ProcInfo,
    process: &ProcessRef,
    allowed: &[i32],
) -> Result<(), AssertionError> {
    let exit = proc_info
        .get(process)
        .ok_or_else(|| AssertionError::StillRunning {
            process: process.name.clone(),
        })?;
    if allowed.contains(&exit.returncode) {
        Ok(())
    } else {
        Err(AssertionError::ExitCode {
            process: process.name.clone(),
            returncode: exit.returncode,
            allowed: allowed.to_vec(),
        })
    }
}

pub fn expect_eq<T: PartialEq + Debug>(actual: T, expected: T) -> Result<(), AssertionError> {
    if actual == expected {
        Ok(())
    } else {
        Err(AssertionError::Mismatch(format!(
            "expected {:?}, got {:?}",
            expected, actual
        )))
    }
}

pub fn expect(condition: bool, message: impl Into<String>) -> Result<(), AssertionError> {
    if condition {
        Ok(())
    } else {
        Err(AssertionError::Mismatch(message.into()))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
