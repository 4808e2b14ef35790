//! Output capture for processes under test
//!
//! Design:
//! 1. Each launched process gets one `OutputCapture`, registered in the shared
//!    `ProcOutput` registry before the process is spawned
//! 2. Reader threads append stdout/stderr lines in arrival order
//! 3. Tests scan captures; readers never mutate, they keep their own cursor
//! 4. Shutdown freezes every capture; later appends are rejected
//!
//! Waiting readers block on a condvar that is notified on every append and on
//! freeze, so `assert_wait_for` never busy-polls.

use crate::asserts::{AssertionError, SequentialChecker};
use crate::process::ProcessRef;
use dashmap::DashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Stdout => f.write_str("stdout"),
            Stream::Stderr => f.write_str("stderr"),
        }
    }
}

/// One captured line (without its trailing newline)
#[derive(Clone, Debug, PartialEq)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
    /// Time since the capture was created
    pub elapsed: Duration,
}

#[derive(Debug, Error, PartialEq)]
#[error("output capture for '{0}' is frozen")]
pub struct CaptureFrozen(pub String);

#[derive(Default)]
struct CaptureState {
    lines: Vec<OutputLine>,
    frozen: bool,
}

/// Append-only, per-process line buffer
pub struct OutputCapture {
    process: ProcessRef,
    started: Instant,
    state: Mutex<CaptureState>,
    changed: Condvar,
}

impl OutputCapture {
    pub fn new(process: ProcessRef) -> Self {
        Self {
            process,
            started: Instant::now(),
            state: Mutex::new(CaptureState::default()),
            changed: Condvar::new(),
        }
    }

    pub fn process(&self) -> &ProcessRef {
        &self.process
    }

    fn lock(&self) -> MutexGuard<'_, CaptureState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn append(&self, stream: Stream, text: &str) -> Result<(), CaptureFrozen> {
        let mut state = self.lock();
        if state.frozen {
            return Err(CaptureFrozen(self.process.name.clone()));
        }
        state.lines.push(OutputLine {
            stream,
            text: text.to_string(),
            elapsed: self.started.elapsed(),
        });
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    /// No further writes are accepted after this
    pub fn freeze(&self) {
        self.lock().frozen = true;
        self.changed.notify_all();
    }

    pub fn is_frozen(&self) -> bool {
        self.lock().frozen
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lines(&self) -> Vec<OutputLine> {
        self.lock().lines.clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.lock().lines.iter().map(|l| l.text.clone()).collect()
    }

    pub fn line(&self, index: usize) -> Option<OutputLine> {
        self.lock().lines.get(index).cloned()
    }

    /// Index of the first line at or after `start` containing `needle`.
    ///
    /// Waits up to `timeout` for new lines to arrive; a frozen capture
    /// returns as soon as the existing lines have been scanned.
    pub fn find_from(&self, start: usize, needle: &str, timeout: Duration) -> Option<usize> {
        let deadline = Instant::now() + timeout;
        let mut scanned = start;
        let mut state = self.lock();
        loop {
            if let Some(offset) = state
                .lines
                .iter()
                .skip(scanned)
                .position(|l| l.text.contains(needle))
            {
                return Some(scanned + offset);
            }
            scanned = scanned.max(state.lines.len());

            let now = Instant::now();
            if state.frozen || now >= deadline {
                return None;
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }
}

impl fmt::Debug for OutputCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputCapture")
            .field("process", &self.process.name)
            .field("lines", &self.len())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

// =============================================================================
// Process lookup
// =============================================================================

/// Filter on a process's command-line arguments
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CmdArgs<'a> {
    Any,
    /// Only processes launched without arguments
    None,
    /// Processes with this exact argument among their arguments
    Contains(&'a str),
}

/// Which process(es) an assertion is about
#[derive(Clone, Copy, Debug)]
pub enum ProcQuery<'a> {
    /// Every launched process
    All,
    Process(&'a ProcessRef),
    Name {
        name: &'a str,
        cmd_args: CmdArgs<'a>,
        strict: bool,
    },
}

impl<'a> ProcQuery<'a> {
    /// Match by name substring; more than one match is an error
    pub fn name(name: &'a str) -> Self {
        ProcQuery::Name {
            name,
            cmd_args: CmdArgs::Any,
            strict: true,
        }
    }

    pub fn with_args(self, args: CmdArgs<'a>) -> Self {
        match self {
            ProcQuery::Name { name, strict, .. } => ProcQuery::Name {
                name,
                cmd_args: args,
                strict,
            },
            other => other,
        }
    }

    /// Accept several matches and search all of them
    pub fn lenient(self) -> Self {
        match self {
            ProcQuery::Name { name, cmd_args, .. } => ProcQuery::Name {
                name,
                cmd_args,
                strict: false,
            },
            other => other,
        }
    }

    fn matches(&self, process: &ProcessRef) -> bool {
        match self {
            ProcQuery::All => true,
            ProcQuery::Process(p) => *p == process,
            ProcQuery::Name { name, cmd_args, .. } => {
                let name_ok = process.name.contains(name);
                let args_ok = match cmd_args {
                    CmdArgs::Any => true,
                    CmdArgs::None => process.args().is_empty(),
                    CmdArgs::Contains(arg) => process.args().iter().any(|a| a == arg),
                };
                name_ok && args_ok
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            ProcQuery::All => "any process".to_string(),
            ProcQuery::Process(p) => p.to_string(),
            ProcQuery::Name { name, cmd_args, .. } => match cmd_args {
                CmdArgs::Any => format!("name '{}'", name),
                CmdArgs::None => format!("name '{}' without arguments", name),
                CmdArgs::Contains(arg) => format!("name '{}' and args '{}'", name, arg),
            },
        }
    }
}

impl<'a> From<&'a ProcessRef> for ProcQuery<'a> {
    fn from(p: &'a ProcessRef) -> Self {
        ProcQuery::Process(p)
    }
}

impl<'a> From<&'a str> for ProcQuery<'a> {
    fn from(name: &'a str) -> Self {
        ProcQuery::name(name)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Captures of every process in the run, keyed by process id
#[derive(Default)]
pub struct ProcOutput {
    captures: DashMap<usize, Arc<OutputCapture>>,
}

impl ProcOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or return the existing) capture for a process
    pub fn register(&self, process: ProcessRef) -> Arc<OutputCapture> {
        self.captures
            .entry(process.id.0)
            .or_insert_with(|| Arc::new(OutputCapture::new(process)))
            .clone()
    }

    pub fn capture(&self, process: &ProcessRef) -> Option<Arc<OutputCapture>> {
        self.captures
            .get(&process.id.0)
            .filter(|c| c.process() == process)
            .map(|c| c.clone())
    }

    /// Registered processes in launch order
    pub fn processes(&self) -> Vec<ProcessRef> {
        let mut all: Vec<ProcessRef> = self
            .captures
            .iter()
            .map(|c| c.process().clone())
            .collect();
        all.sort_by_key(|p| p.id);
        all
    }

    pub fn freeze_all(&self) {
        for capture in self.captures.iter() {
            capture.freeze();
        }
    }

    /// Captures matching the query, in launch order
    pub fn resolve<'a>(
        &self,
        query: impl Into<ProcQuery<'a>>,
    ) -> Result<Vec<Arc<OutputCapture>>, AssertionError> {
        let query = query.into();
        let known = self.processes();
        let matching: Vec<&ProcessRef> = known.iter().filter(|p| query.matches(p)).collect();

        if matching.is_empty() {
            return Err(AssertionError::NoMatchingProcess {
                query: query.describe(),
                known: known.iter().map(|p| p.to_string()).collect(),
            });
        }
        if let ProcQuery::Name { strict: true, .. } = query {
            if matching.len() > 1 {
                return Err(AssertionError::AmbiguousProcess {
                    query: query.describe(),
                    matches: matching.iter().map(|p| p.to_string()).collect(),
                });
            }
        }

        Ok(matching
            .into_iter()
            .filter_map(|p| self.capture(p))
            .collect())
    }

    fn resolve_one<'a>(
        &self,
        query: impl Into<ProcQuery<'a>>,
    ) -> Result<Arc<OutputCapture>, AssertionError> {
        let query = query.into();
        let mut found = self.resolve(query)?;
        if found.len() > 1 {
            return Err(AssertionError::AmbiguousProcess {
                query: query.describe(),
                matches: found.iter().map(|c| c.process().to_string()).collect(),
            });
        }
        found.pop().ok_or_else(|| AssertionError::NoMatchingProcess {
            query: query.describe(),
            known: Vec::new(),
        })
    }

    /// Block until the process prints a line containing `expected`
    pub fn assert_wait_for<'a>(
        &self,
        expected: &str,
        process: impl Into<ProcQuery<'a>>,
        timeout: Duration,
    ) -> Result<(), AssertionError> {
        let capture = self.resolve_one(process)?;
        match capture.find_from(0, expected, timeout) {
            Some(_) => Ok(()),
            None => Err(AssertionError::WaitTimeout {
                expected: expected.to_string(),
                process: capture.process().to_string(),
                timeout,
                observed: capture.texts(),
            }),
        }
    }

    /// Some line already captured for the matching process(es) contains `expected`
    pub fn assert_in_output<'a>(
        &self,
        expected: &str,
        process: impl Into<ProcQuery<'a>>,
    ) -> Result<(), AssertionError> {
        let captures = self.resolve(process)?;
        if captures
            .iter()
            .any(|c| c.find_from(0, expected, Duration::ZERO).is_some())
        {
            return Ok(());
        }
        Err(AssertionError::NotFound {
            expected: expected.to_string(),
            process: captures
                .iter()
                .map(|c| c.process().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    /// Ordered assertions over one process's output
    pub fn sequential<'a>(
        &self,
        process: impl Into<ProcQuery<'a>>,
    ) -> Result<SequentialChecker, AssertionError> {
        Ok(SequentialChecker::new(self.resolve_one(process)?))
    }
}

impl fmt::Debug for ProcOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcOutput")
            .field("processes", &self.processes())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ProcessId, ProcessSpec};
    use std::thread;

    fn process(id: usize, name: &str, cmd: &[&str]) -> ProcessRef {
        ProcessRef::new(ProcessId(id), &ProcessSpec::new(name, cmd.iter().copied()))
    }

    #[test]
    fn test_append_keeps_order_and_stream() {
        let capture = OutputCapture::new(process(0, "dut", &["dut"]));
        capture.append(Stream::Stdout, "one").unwrap();
        capture.append(Stream::Stderr, "two").unwrap();
        capture.append(Stream::Stdout, "three").unwrap();

        assert_eq!(capture.texts(), vec!["one", "two", "three"]);
        assert_eq!(capture.line(1).unwrap().stream, Stream::Stderr);
        let lines = capture.lines();
        assert!(lines[0].elapsed <= lines[2].elapsed);
    }

    #[test]
    fn test_frozen_capture_rejects_writes() {
        let capture = OutputCapture::new(process(0, "dut", &["dut"]));
        capture.append(Stream::Stdout, "before").unwrap();
        capture.freeze();
        assert_eq!(
            capture.append(Stream::Stdout, "after"),
            Err(CaptureFrozen("dut".into()))
        );
        assert_eq!(capture.len(), 1);
    }

    #[test]
    fn test_find_from_waits_for_late_line() {
        let capture = Arc::new(OutputCapture::new(process(0, "dut", &["dut"])));
        let writer = capture.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            writer.append(Stream::Stdout, "Loop 1").unwrap();
        });

        let found = capture.find_from(0, "Loop 1", Duration::from_secs(5));
        handle.join().unwrap();
        assert_eq!(found, Some(0));
    }

    #[test]
    fn test_find_from_frozen_returns_immediately() {
        let capture = OutputCapture::new(process(0, "dut", &["dut"]));
        capture.freeze();
        let start = Instant::now();
        assert_eq!(capture.find_from(0, "never", Duration::from_secs(10)), None);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_resolve_by_name_and_args() {
        let registry = ProcOutput::new();
        registry.register(process(0, "talker", &["talker", "--fast"]));
        registry.register(process(1, "talker", &["talker"]));
        registry.register(process(2, "listener", &["listener"]));

        let err = registry.resolve("talker").err().unwrap();
        assert!(matches!(err, AssertionError::AmbiguousProcess { .. }));

        let fast = registry
            .resolve(ProcQuery::name("talker").with_args(CmdArgs::Contains("--fast")))
            .unwrap();
        assert_eq!(fast.len(), 1);
        assert_eq!(fast[0].process().id, ProcessId(0));

        let bare = registry
            .resolve(ProcQuery::name("talker").with_args(CmdArgs::None))
            .unwrap();
        assert_eq!(bare[0].process().id, ProcessId(1));

        let both = registry.resolve(ProcQuery::name("talker").lenient()).unwrap();
        assert_eq!(both.len(), 2);
    }

    #[test]
    fn test_resolve_unknown_lists_known_processes() {
        let registry = ProcOutput::new();
        registry.register(process(0, "listener", &["listener"]));
        match registry.resolve("talker").err().unwrap() {
            AssertionError::NoMatchingProcess { known, .. } => {
                assert_eq!(known, vec!["listener".to_string()]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_assert_wait_for_timeout_reports_observed() {
        let registry = ProcOutput::new();
        let dut = process(0, "dut", &["dut"]);
        let capture = registry.register(dut.clone());
        capture.append(Stream::Stdout, "Starting Up").unwrap();

        let err = registry
            .assert_wait_for("Loop 1", &dut, Duration::from_millis(50))
            .unwrap_err();
        match err {
            AssertionError::WaitTimeout {
                expected, observed, ..
            } => {
                assert_eq!(expected, "Loop 1");
                assert_eq!(observed, vec!["Starting Up".to_string()]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_assert_in_output_any_line() {
        let registry = ProcOutput::new();
        let dut = process(0, "dut", &["dut"]);
        let capture = registry.register(dut.clone());
        capture.append(Stream::Stdout, "Shutting Down").unwrap();
        capture.append(Stream::Stdout, "Starting Up").unwrap();

        assert!(registry.assert_in_output("Starting Up", &dut).is_ok());
        assert!(registry.assert_in_output("Shutting", "dut").is_ok());
        assert!(matches!(
            registry.assert_in_output("Loop 9", &dut),
            Err(AssertionError::NotFound { .. })
        ));
    }

    #[test]
    fn test_assert_in_output_across_all_processes() {
        let registry = ProcOutput::new();
        registry
            .register(process(0, "talker", &["talker"]))
            .append(Stream::Stdout, "Starting Up")
            .unwrap();
        registry
            .register(process(1, "listener", &["listener"]))
            .append(Stream::Stdout, "I heard: hello")
            .unwrap();

        assert_eq!(registry.resolve(ProcQuery::All).unwrap().len(), 2);
        assert!(registry.assert_in_output("I heard", ProcQuery::All).is_ok());
        assert!(registry.assert_in_output("Starting", ProcQuery::All).is_ok());
        match registry.assert_in_output("missing", ProcQuery::All) {
            Err(AssertionError::NotFound { process, .. }) => {
                assert_eq!(process, "talker, listener");
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let empty = ProcOutput::new();
        assert!(matches!(
            empty.assert_in_output("x", ProcQuery::All),
            Err(AssertionError::NoMatchingProcess { .. })
        ));
    }

    #[test]
    fn test_capture_lookup_checks_identity() {
        let registry = ProcOutput::new();
        registry.register(process(0, "dut", &["dut"]));
        assert!(registry.capture(&process(0, "dut", &["dut"])).is_some());
        assert!(registry.capture(&process(0, "other", &["other"])).is_none());
    }
}
