//! Run orchestration
//!
//! Drives one launch test through
//! `Init → Launched → Ready → ActiveTestsRunning → Shutdown →
//! PostShutdownTestsRunning → Done`, or into the absorbing `Error` state.
//! Whatever was launched is shut down on every path out of `Launched`; the
//! [`CleanupGuard`](crate::lifecycle::CleanupGuard) inside the process group
//! covers panics.

use crate::description::{
    ready_channel, LaunchArguments, LaunchDescription, ReadinessTrigger, ReadyWaiter,
    ValidationError,
};
use crate::inject::Injector;
use crate::output::ProcOutput;
use crate::process::{LaunchError, ProcessGroup};
use crate::reporter::Reporter;
use crate::results::{PhaseResults, RunResults, TestResult};
use crate::signals::ShutdownFlag;
use crate::suite::{Phase, TestFailure, TestSuite};
use crossbeam_channel::RecvTimeoutError;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Slice of the readiness wait between shutdown-flag checks
const READY_POLL: Duration = Duration::from_millis(100);
/// Extra wait for a ready line still in flight when every process has exited
const READY_LINGER: Duration = Duration::from_millis(200);
/// Output lines quoted per failed process in `ExitedBeforeReady`
const EXIT_SUMMARY_LINES: usize = 10;

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("processes did not signal readiness within {timeout:?}")]
    ReadinessTimeout { timeout: Duration },
    #[error("all processes exited before signaling readiness{summary}")]
    ExitedBeforeReady { summary: String },
    #[error("run interrupted by signal")]
    Interrupted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Init,
    Launched,
    Ready,
    ActiveTestsRunning,
    Shutdown,
    PostShutdownTestsRunning,
    Done,
    Error,
}

#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub ready_timeout: Duration,
    /// Budget for the whole run; tests starting after it are not run
    pub run_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Added to the environment of every launched process
    pub extra_env: BTreeMap<String, String>,
    pub shutdown: ShutdownFlag,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            ready_timeout: DEFAULT_READY_TIMEOUT,
            run_timeout: DEFAULT_RUN_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            extra_env: BTreeMap::new(),
            shutdown: ShutdownFlag::new(),
        }
    }
}

pub struct Runner<'a> {
    description: &'a dyn LaunchDescription,
    suite: TestSuite,
    args: LaunchArguments,
    config: RunnerConfig,
    state: RunState,
}

impl<'a> Runner<'a> {
    pub fn new(
        description: &'a dyn LaunchDescription,
        suite: TestSuite,
        args: LaunchArguments,
        config: RunnerConfig,
    ) -> Self {
        Self {
            description,
            suite,
            args,
            config,
            state: RunState::Init,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn transition(&mut self, next: RunState) {
        info!(from = ?self.state, to = ?next, "run state changed");
        self.state = next;
    }

    fn fail<T>(&mut self, err: RunError, reporter: &mut dyn Reporter) -> Result<T, RunError> {
        warn!("run failed: {}", err);
        reporter.on_error(&err.to_string());
        self.transition(RunState::Error);
        Err(err)
    }

    /// Static checks that need no process: description and suite
    pub fn validate(&mut self) -> Result<(), RunError> {
        let checked = self
            .description
            .validate()
            .and_then(|()| self.suite.validate());
        if let Err(e) = checked {
            self.transition(RunState::Error);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn run(&mut self, reporter: &mut dyn Reporter) -> Result<RunResults, RunError> {
        if self.state != RunState::Init {
            warn!(state = ?self.state, "runner reused; starting over");
            self.state = RunState::Init;
        }
        if let Err(e) = self.validate() {
            reporter.on_error(&e.to_string());
            return Err(e);
        }

        let started = Instant::now();
        let deadline = started + self.config.run_timeout;
        let (ready, waiter) = ready_channel();

        let description = match self
            .description
            .generate_test_description(&self.args, ready.clone())
            .and_then(|d| d.topology.validate().map(|()| d))
        {
            Ok(d) => d,
            Err(e) => return self.fail(e.into(), reporter),
        };

        reporter.on_run_start(description.topology.len(), self.suite.len());

        let proc_output = ProcOutput::new();
        let mut group = match ProcessGroup::launch(
            &description.topology,
            &proc_output,
            &ready,
            &self.config.extra_env,
            self.config.shutdown_grace,
        ) {
            Ok(g) => g,
            Err(e) => {
                proc_output.freeze_all();
                return self.fail(e.into(), reporter);
            }
        };
        self.transition(RunState::Launched);

        if *description.topology.readiness() == ReadinessTrigger::Immediate {
            ready.fire();
        }

        if let Err(e) = self.wait_until_ready(&waiter, &mut group, &proc_output) {
            group.shutdown(self.config.shutdown_grace);
            proc_output.freeze_all();
            return self.fail(e, reporter);
        }
        self.transition(RunState::Ready);

        let mut results = RunResults::default();
        let args = self.args.clone();
        let mut injector = Injector::new(&description.context, &proc_output, &args);

        self.transition(RunState::ActiveTestsRunning);
        results.active = self.run_phase(Phase::Active, &mut injector, &mut group, deadline, reporter);

        self.transition(RunState::Shutdown);
        let final_info = group.shutdown(self.config.shutdown_grace);
        proc_output.freeze_all();
        debug!(exits = final_info.len(), "topology shut down");

        self.transition(RunState::PostShutdownTestsRunning);
        results.after_shutdown =
            self.run_phase(Phase::PostShutdown, &mut injector, &mut group, deadline, reporter);

        self.transition(RunState::Done);
        reporter.on_run_finished(&results, started.elapsed().as_millis() as u64);
        Ok(results)
    }

    fn wait_until_ready(
        &self,
        waiter: &ReadyWaiter,
        group: &mut ProcessGroup,
        proc_output: &ProcOutput,
    ) -> Result<(), RunError> {
        let timeout = self.config.ready_timeout;
        let deadline = Instant::now() + timeout;
        info!(?timeout, "waiting for readiness");

        loop {
            if self.config.shutdown.is_requested() {
                return Err(RunError::Interrupted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RunError::ReadinessTimeout { timeout });
            }

            match waiter.wait(READY_POLL.min(deadline - now)) {
                Ok(()) => return Ok(()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(RunError::ReadinessTimeout { timeout })
                }
            }

            if group.all_exited() {
                // The ready line may still be on its way through a reader thread
                if waiter.wait(READY_LINGER).is_ok() {
                    return Ok(());
                }
                return Err(RunError::ExitedBeforeReady {
                    summary: exit_summary(group, proc_output),
                });
            }
        }
    }

    fn run_phase(
        &self,
        phase: Phase,
        injector: &mut Injector<'_>,
        group: &mut ProcessGroup,
        deadline: Instant,
        reporter: &mut dyn Reporter,
    ) -> PhaseResults {
        let cases: Vec<_> = self.suite.phase(phase).collect();
        let mut results = PhaseResults::new();
        reporter.on_phase_start(phase, cases.len());

        for case in cases {
            reporter.on_test_start(phase, case.name());
            let start = Instant::now();

            let outcome = if self.config.shutdown.is_requested() {
                Err(TestFailure::errored("not run: shutdown requested"))
            } else if Instant::now() >= deadline {
                Err(TestFailure::errored(format!(
                    "not run: run timeout of {:?} exceeded",
                    self.config.run_timeout
                )))
            } else {
                injector.set_proc_info(group.poll_exits());
                match injector.resolve(case) {
                    Ok(bindings) => catch_unwind(AssertUnwindSafe(|| case.run(&bindings)))
                        .unwrap_or_else(|payload| {
                            Err(TestFailure::errored(format!(
                                "test panicked: {}",
                                panic_message(payload.as_ref())
                            )))
                        }),
                    Err(e) => Err(e.into()),
                }
            };

            let result = TestResult::from_outcome(case.name(), phase, start.elapsed(), outcome);
            debug!(test = %result.name, status = result.status.as_str(), "test finished");
            reporter.on_test_finished(&result);
            results.push(result);
        }

        reporter.on_phase_finished(phase, &results);
        results
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Exit codes and trailing output of processes that exited non-zero
fn exit_summary(group: &ProcessGroup, proc_output: &ProcOutput) -> String {
    let mut out = String::new();
    for exit in group.proc_info().iter().filter(|e| e.returncode != 0) {
        out.push_str(&format!(
            "\n  {} exited with {}",
            exit.process.name, exit.returncode
        ));
        if let Some(capture) = proc_output.capture(&exit.process) {
            let lines = capture.texts();
            let skip = lines.len().saturating_sub(EXIT_SUMMARY_LINES);
            for line in &lines[skip..] {
                out.push_str("\n    ");
                out.push_str(line);
            }
        }
    }
    out
}

// =============================================================================
// Unit Tests
// =============================================================================
