//! Reporter Module: live progress for humans (stderr) and machines (NDJSON)
//!
//! ## Architecture
//!
//! - `Reporter` trait defines the event callbacks the runner emits
//! - `JsonReporter` outputs NDJSON to stdout (for --format=json)
//! - `HumanReporter` outputs human-readable text to stderr
//! - `MultiReporter` fans events out to several reporters
//!
//! ## Stdout Purity
//!
//! When JsonReporter is active, ONLY valid JSON goes to stdout.
//! All other output (logs, errors, progress) goes to stderr.

use crate::results::{PhaseResults, RunResults, TestResult, TestStatus};
use crate::suite::Phase;
use serde::Serialize;
use tracing::warn;

/// Machine-readable events for JSON output
#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MachineEvent<'a> {
    /// Emitted once the topology is about to be launched
    RunStart { processes: usize, tests: usize },
    /// Emitted when a battery of tests begins
    PhaseStart { suite: &'a str, count: usize },
    /// Emitted when a test begins execution
    TestStart { suite: &'a str, id: &'a str },
    /// Emitted when a test completes
    TestFinished {
        suite: &'a str,
        id: &'a str,
        status: TestStatus,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<&'a str>,
    },
    /// Emitted when a battery of tests completes
    PhaseFinished {
        suite: &'a str,
        passed: usize,
        failed: usize,
        errors: usize,
    },
    /// Emitted at end of the run
    RunFinished {
        passed: usize,
        failed: usize,
        errors: usize,
        duration_ms: u64,
    },
    /// Emitted on fatal error
    Error { message: &'a str },
}

/// Reporter trait for output abstraction
pub trait Reporter {
    /// Called before the topology is launched
    fn on_run_start(&mut self, processes: usize, tests: usize);

    fn on_phase_start(&mut self, phase: Phase, count: usize);

    /// Called when a test begins execution
    fn on_test_start(&mut self, phase: Phase, name: &str);

    /// Called when a test completes
    fn on_test_finished(&mut self, result: &TestResult);

    fn on_phase_finished(&mut self, phase: Phase, results: &PhaseResults);

    /// Called at end of a run that reached `Done`
    fn on_run_finished(&mut self, results: &RunResults, duration_ms: u64);

    /// Called on fatal error
    fn on_error(&mut self, message: &str);
}

/// Discards every event
pub struct NullReporter;

impl Reporter for NullReporter {
    fn on_run_start(&mut self, _processes: usize, _tests: usize) {}
    fn on_phase_start(&mut self, _phase: Phase, _count: usize) {}
    fn on_test_start(&mut self, _phase: Phase, _name: &str) {}
    fn on_test_finished(&mut self, _result: &TestResult) {}
    fn on_phase_finished(&mut self, _phase: Phase, _results: &PhaseResults) {}
    fn on_run_finished(&mut self, _results: &RunResults, _duration_ms: u64) {}
    fn on_error(&mut self, _message: &str) {}
}

// =============================================================================
// JsonReporter
// =============================================================================

/// JSON Reporter - outputs NDJSON to stdout
pub struct JsonReporter;

impl JsonReporter {
    fn emit(&self, event: &MachineEvent<'_>) {
        // ONLY JsonReporter touches stdout
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("failed to serialize reporter event: {}", e),
        }
    }
}

impl Reporter for JsonReporter {
    fn on_run_start(&mut self, processes: usize, tests: usize) {
        self.emit(&MachineEvent::RunStart { processes, tests });
    }

    fn on_phase_start(&mut self, phase: Phase, count: usize) {
        self.emit(&MachineEvent::PhaseStart {
            suite: phase.suite_name(),
            count,
        });
    }

    fn on_test_start(&mut self, phase: Phase, name: &str) {
        self.emit(&MachineEvent::TestStart {
            suite: phase.suite_name(),
            id: name,
        });
    }

    fn on_test_finished(&mut self, result: &TestResult) {
        let message = if result.message.is_empty() {
            None
        } else {
            Some(result.message.as_str())
        };
        self.emit(&MachineEvent::TestFinished {
            suite: result.phase.suite_name(),
            id: &result.name,
            status: result.status,
            duration_ms: result.duration.as_millis() as u64,
            message,
        });
    }

    fn on_phase_finished(&mut self, phase: Phase, results: &PhaseResults) {
        self.emit(&MachineEvent::PhaseFinished {
            suite: phase.suite_name(),
            passed: results.passed(),
            failed: results.failed(),
            errors: results.errors(),
        });
    }

    fn on_run_finished(&mut self, results: &RunResults, duration_ms: u64) {
        self.emit(&MachineEvent::RunFinished {
            passed: results.count(TestStatus::Pass),
            failed: results.count(TestStatus::Fail),
            errors: results.count(TestStatus::Error),
            duration_ms,
        });
    }

    fn on_error(&mut self, message: &str) {
        self.emit(&MachineEvent::Error { message });
    }
}

// =============================================================================
// HumanReporter
// =============================================================================

/// Human Reporter - outputs readable text to stderr
pub struct HumanReporter;

impl Reporter for HumanReporter {
    fn on_run_start(&mut self, processes: usize, tests: usize) {
        eprintln!(
            "[launchtest] Launching {} processes, {} tests...\n",
            processes, tests
        );
    }

    fn on_phase_start(&mut self, phase: Phase, count: usize) {
        if count > 0 {
            eprintln!("{} ({} tests)", phase.suite_name(), count);
        }
    }

    fn on_test_start(&mut self, _phase: Phase, name: &str) {
        eprint!("  {} ... ", name);
    }

    fn on_test_finished(&mut self, result: &TestResult) {
        let ms = result.duration.as_millis();
        match result.status {
            TestStatus::Pass => eprintln!("{} ({}ms)", result.status.icon(), ms),
            TestStatus::Fail | TestStatus::Error => {
                eprintln!("{} {} ({}ms)", result.status.icon(), result.status.as_str(), ms);
                // Indent failure message
                for line in result.message.lines().take(10) {
                    eprintln!("    {}", line);
                }
            }
        }
    }

    fn on_phase_finished(&mut self, _phase: Phase, results: &PhaseResults) {
        if !results.is_empty() {
            eprintln!();
        }
    }

    fn on_run_finished(&mut self, results: &RunResults, duration_ms: u64) {
        eprintln!(
            "[launchtest] {} passed, {} failed, {} errors in {}ms",
            results.count(TestStatus::Pass),
            results.count(TestStatus::Fail),
            results.count(TestStatus::Error),
            duration_ms
        );
    }

    fn on_error(&mut self, message: &str) {
        eprintln!("[launchtest] FATAL ERROR: {}", message);
    }
}

// =============================================================================
// MultiReporter
// =============================================================================

/// MultiReporter - broadcasts events to multiple reporters
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new(reporters: Vec<Box<dyn Reporter>>) -> Self {
        Self { reporters }
    }
}

impl Reporter for MultiReporter {
    fn on_run_start(&mut self, processes: usize, tests: usize) {
        for r in &mut self.reporters {
            r.on_run_start(processes, tests);
        }
    }

    fn on_phase_start(&mut self, phase: Phase, count: usize) {
        for r in &mut self.reporters {
            r.on_phase_start(phase, count);
        }
    }

    fn on_test_start(&mut self, phase: Phase, name: &str) {
        for r in &mut self.reporters {
            r.on_test_start(phase, name);
        }
    }

    fn on_test_finished(&mut self, result: &TestResult) {
        for r in &mut self.reporters {
            r.on_test_finished(result);
        }
    }

    fn on_phase_finished(&mut self, phase: Phase, results: &PhaseResults) {
        for r in &mut self.reporters {
            r.on_phase_finished(phase, results);
        }
    }

    fn on_run_finished(&mut self, results: &RunResults, duration_ms: u64) {
        for r in &mut self.reporters {
            r.on_run_finished(results, duration_ms);
        }
    }

    fn on_error(&mut self, message: &str) {
        for r in &mut self.reporters {
            r.on_error(message);
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_json_event_serialization() {
        let event = MachineEvent::TestFinished {
            suite: "active_tests",
            id: "test_foo",
            status: TestStatus::Pass,
            duration_ms: 42,
            message: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"test_finished\""));
        assert!(json.contains("\"id\":\"test_foo\""));
        assert!(json.contains("\"status\":\"pass\""));
        assert!(json.contains("\"suite\":\"active_tests\""));
        assert!(!json.contains("message")); // skip_serializing_if = None
    }

    #[test]
    fn test_json_event_with_message() {
        let event = MachineEvent::TestFinished {
            suite: "after_shutdown_tests",
            id: "test_bar",
            status: TestStatus::Fail,
            duration_ms: 100,
            message: Some("assertion failed"),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"message\":\"assertion failed\""));
        assert!(json.contains("\"status\":\"fail\""));
    }

    #[test]
    fn test_error_event() {
        let event = MachineEvent::Error {
            message: "processes did not signal readiness within 15s",
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"error\""));
    }

    struct Recording(Rc<RefCell<Vec<String>>>);

    impl Reporter for Recording {
        fn on_run_start(&mut self, processes: usize, tests: usize) {
            self.0.borrow_mut().push(format!("start {} {}", processes, tests));
        }
        fn on_phase_start(&mut self, phase: Phase, _count: usize) {
            self.0.borrow_mut().push(format!("phase {}", phase));
        }
        fn on_test_start(&mut self, _phase: Phase, name: &str) {
            self.0.borrow_mut().push(format!("test {}", name));
        }
        fn on_test_finished(&mut self, result: &TestResult) {
            self.0.borrow_mut().push(format!("done {}", result.name));
        }
        fn on_phase_finished(&mut self, _phase: Phase, _results: &PhaseResults) {}
        fn on_run_finished(&mut self, _results: &RunResults, _duration_ms: u64) {
            self.0.borrow_mut().push("finished".into());
        }
        fn on_error(&mut self, message: &str) {
            self.0.borrow_mut().push(format!("error {}", message));
        }
    }

    #[test]
    fn test_multi_reporter_broadcasts() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut multi = MultiReporter::new(vec![
            Box::new(Recording(log.clone())),
            Box::new(Recording(log.clone())),
        ]);

        multi.on_run_start(2, 1);
        multi.on_phase_start(Phase::Active, 1);
        multi.on_error("boom");

        assert_eq!(
            *log.borrow(),
            vec![
                "start 2 1",
                "start 2 1",
                "phase active",
                "phase active",
                "error boom",
                "error boom"
            ]
        );
    }
}
