//! Launch Description boundary
//!
//! The runner does not know how a topology is described on disk. A launch
//! description is anything implementing [`LaunchDescription`]: given the
//! parsed launch arguments and a [`ReadySignal`], it returns the processes to
//! start and the context its tests may ask for.

use crate::context::TestContext;
use crate::process::{ProcessId, ProcessRef, ProcessSpec};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::time::Duration;
use thiserror::Error;

/// Configuration problems detected before any process is started
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("launch description declares no processes")]
    EmptyTopology,
    #[error("process name '{0}' is used more than once")]
    DuplicateProcess(String),
    #[error("process '{0}' has an empty command")]
    EmptyCommand(String),
    #[error("readiness trigger refers to process '{0}' which is not part of the topology")]
    UnknownReadyProcess(String),
    #[error("duplicate {phase} test name '{name}'")]
    DuplicateTest { phase: &'static str, name: String },
    #[error("malformed launch argument '{0}' (expected '<name>:=<value>')")]
    MalformedArgument(String),
    #[error("launch argument '{0}' has no value and no default")]
    MissingArgument(String),
    #[error("invalid launch description: {0}")]
    Description(String),
}

// =============================================================================
// Readiness
// =============================================================================

/// Fired once the launched topology is ready for active tests.
///
/// Cheap to clone; firing more than once is harmless.
#[derive(Clone, Debug)]
pub struct ReadySignal {
    tx: Sender<()>,
}

impl ReadySignal {
    pub fn fire(&self) {
        // A full channel means someone already fired.
        let _ = self.tx.try_send(());
    }
}

/// Receiving side of a [`ReadySignal`], owned by the runner
#[derive(Debug)]
pub struct ReadyWaiter {
    rx: Receiver<()>,
}

impl ReadyWaiter {
    pub fn wait(&self, timeout: Duration) -> Result<(), RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn is_ready(&self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

pub fn ready_channel() -> (ReadySignal, ReadyWaiter) {
    let (tx, rx) = bounded(1);
    (ReadySignal { tx }, ReadyWaiter { rx })
}

/// What makes the topology "ready"
#[derive(Clone, Debug, PartialEq)]
pub enum ReadinessTrigger {
    /// Ready as soon as every process has been spawned
    Immediate,
    /// Ready when the process prints a stdout line containing `text`
    OutputContains { process: ProcessRef, text: String },
    /// The description keeps a [`ReadySignal`] clone and fires it itself
    External,
}

// =============================================================================
// Topology
// =============================================================================

#[derive(Clone, Debug)]
pub struct Topology {
    processes: Vec<(ProcessRef, ProcessSpec)>,
    readiness: ReadinessTrigger,
}

impl Topology {
    pub fn new() -> Self {
        Self {
            processes: Vec::new(),
            readiness: ReadinessTrigger::Immediate,
        }
    }

    /// Add a process; the returned reference can be stored in the test context
    pub fn add_process(&mut self, spec: ProcessSpec) -> ProcessRef {
        let process = ProcessRef::new(ProcessId(self.processes.len()), &spec);
        self.processes.push((process.clone(), spec));
        process
    }

    pub fn ready_when(&mut self, trigger: ReadinessTrigger) {
        self.readiness = trigger;
    }

    pub fn readiness(&self) -> &ReadinessTrigger {
        &self.readiness
    }

    pub fn processes(&self) -> impl Iterator<Item = (&ProcessRef, &ProcessSpec)> {
        self.processes.iter().map(|(p, s)| (p, s))
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.processes.is_empty() {
            return Err(ValidationError::EmptyTopology);
        }

        let mut names = HashSet::new();
        for (process, spec) in &self.processes {
            if !names.insert(process.name.as_str()) {
                return Err(ValidationError::DuplicateProcess(process.name.clone()));
            }
            if spec.cmd.is_empty() || spec.cmd[0].is_empty() {
                return Err(ValidationError::EmptyCommand(process.name.clone()));
            }
        }

        if let ReadinessTrigger::OutputContains { process, .. } = &self.readiness {
            let known = self.processes.iter().any(|(p, _)| p == process);
            if !known {
                return Err(ValidationError::UnknownReadyProcess(process.name.clone()));
            }
        }

        Ok(())
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Launch Arguments
// =============================================================================

/// Parsed `<name>:=<value>` arguments; for duplicates the last one wins
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LaunchArguments {
    values: Vec<(String, String)>,
}

impl LaunchArguments {
    pub fn parse<I, S>(tokens: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut args = Self::default();
        for token in tokens {
            let token = token.as_ref();
            let (name, value) = token
                .split_once(":=")
                .ok_or_else(|| ValidationError::MalformedArgument(token.to_string()))?;
            if name.is_empty() {
                return Err(ValidationError::MalformedArgument(token.to_string()));
            }
            args.set(name, value);
        }
        Ok(args)
    }

    pub fn set(&mut self, name: &str, value: &str) {
        match self.values.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.values.push((name.to_string(), value.to_string())),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// An argument a launch description accepts, for `--show-args`
#[derive(Clone, Debug, PartialEq)]
pub struct DeclaredArgument {
    pub name: String,
    pub description: String,
    pub default: Option<String>,
}

/// Human-readable listing of declared arguments
pub fn describe_arguments(arguments: &[DeclaredArgument]) -> String {
    let mut out = String::from("Arguments (pass arguments as '<name>:=<value>'):\n");
    if arguments.is_empty() {
        out.push_str("\n  No arguments.\n");
        return out;
    }
    for arg in arguments {
        let _ = write!(out, "\n    '{}':\n        {}", arg.name, arg.description);
        if let Some(default) = &arg.default {
            let _ = write!(out, "\n        (default: '{}')", default);
        }
        out.push('\n');
    }
    out
}

// =============================================================================
// Collaborator contract
// =============================================================================

/// Everything the runner needs from a launch description
#[derive(Clone, Debug)]
pub struct TestDescription {
    pub topology: Topology,
    pub context: TestContext,
}

pub trait LaunchDescription {
    /// Arguments the description understands
    fn declared_arguments(&self) -> Vec<DeclaredArgument> {
        Vec::new()
    }

    /// Static checks run before anything is generated or launched
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }

    fn generate_test_description(
        &self,
        args: &LaunchArguments,
        ready: ReadySignal,
    ) -> Result<TestDescription, ValidationError>;
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, cmd: &[&str]) -> ProcessSpec {
        ProcessSpec::new(name, cmd.iter().copied())
    }

    #[test]
    fn test_launch_arguments_last_duplicate_wins() {
        let args = LaunchArguments::parse(["a:=1", "b:=two", "a:=3"]).unwrap();
        assert_eq!(args.get("a"), Some("3"));
        assert_eq!(args.get("b"), Some("two"));
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn test_launch_arguments_value_may_contain_separator() {
        let args = LaunchArguments::parse(["url:=http://x:=y", "empty:="]).unwrap();
        assert_eq!(args.get("url"), Some("http://x:=y"));
        assert_eq!(args.get("empty"), Some(""));
    }

    #[test]
    fn test_launch_arguments_malformed() {
        assert_eq!(
            LaunchArguments::parse(["novalue"]).unwrap_err(),
            ValidationError::MalformedArgument("novalue".into())
        );
        assert!(LaunchArguments::parse([":=x"]).is_err());
    }

    #[test]
    fn test_topology_validation() {
        assert_eq!(Topology::new().validate(), Err(ValidationError::EmptyTopology));

        let mut topology = Topology::new();
        topology.add_process(spec("dut", &["true"]));
        topology.add_process(spec("dut", &["false"]));
        assert_eq!(
            topology.validate(),
            Err(ValidationError::DuplicateProcess("dut".into()))
        );

        let mut topology = Topology::new();
        topology.add_process(spec("empty", &[]));
        assert_eq!(
            topology.validate(),
            Err(ValidationError::EmptyCommand("empty".into()))
        );
    }

    #[test]
    fn test_topology_rejects_foreign_ready_process() {
        let mut other = Topology::new();
        let foreign = other.add_process(spec("elsewhere", &["true"]));

        let mut topology = Topology::new();
        topology.add_process(spec("dut", &["true"]));
        topology.ready_when(ReadinessTrigger::OutputContains {
            process: foreign,
            text: "ready".into(),
        });
        assert_eq!(
            topology.validate(),
            Err(ValidationError::UnknownReadyProcess("elsewhere".into()))
        );
    }

    #[test]
    fn test_ready_signal_fires_once() {
        let (signal, waiter) = ready_channel();
        assert!(!waiter.is_ready());
        signal.fire();
        signal.clone().fire();
        assert!(waiter.wait(Duration::from_millis(10)).is_ok());
        assert!(waiter.wait(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn test_describe_arguments() {
        assert!(describe_arguments(&[]).contains("No arguments."));
        let text = describe_arguments(&[DeclaredArgument {
            name: "loops".into(),
            description: "How many loops".into(),
            default: Some("3".into()),
        }]);
        assert!(text.contains("'loops'"));
        assert!(text.contains("(default: '3')"));
    }
}
