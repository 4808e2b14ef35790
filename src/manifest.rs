//! TOML test manifests
//!
//! A manifest is a launch description plus a declarative test suite in one
//! file:
//!
//! ```toml
//! [[argument]]
//! name = "loops"
//! description = "How many loops the DUT prints"
//! default = "3"
//!
//! [[process]]
//! name = "dut"
//! cmd = ["sh", "-c", "echo Starting Up; for i in $(seq $(arg loops)); do echo Loop $i; done"]
//!
//! [ready]
//! process = "dut"
//! output = "Starting Up"
//!
//! [context]
//! int_val = 10
//!
//! [[test]]
//! name = "test_loops"
//!
//! [[test.check]]
//! kind = "wait_for"
//! process = "dut"
//! text = "Loop 1"
//! ```
//!
//! Every process name is also a context entry holding its process reference,
//! so checks reach processes through the injector like hand-written tests.

use crate::asserts::{assert_exit_code, assert_exit_codes, expect_eq};
use crate::context::{ContextValue, TestContext};
use crate::description::{
    DeclaredArgument, LaunchArguments, LaunchDescription, ReadinessTrigger, ReadySignal,
    TestDescription, Topology, ValidationError,
};
use crate::inject::{Bindings, BUILTIN_NAMES};
use crate::output::ProcQuery;
use crate::process::ProcessSpec;
use crate::suite::{Phase, TestCase, TestOutcome, TestSuite};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_WAIT_SECS: f64 = 10.0;

// =============================================================================
// File format
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default, rename = "argument")]
    pub arguments: Vec<ArgumentEntry>,
    #[serde(default, rename = "process")]
    pub processes: Vec<ProcessEntry>,
    #[serde(default)]
    pub ready: Option<ReadyEntry>,
    #[serde(default)]
    pub context: BTreeMap<String, toml::Value>,
    #[serde(default, rename = "test")]
    pub tests: Vec<TestEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArgumentEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub default: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessEntry {
    pub name: String,
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadyEntry {
    #[serde(default)]
    pub immediate: bool,
    pub process: Option<String>,
    pub output: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseEntry {
    #[default]
    Active,
    PostShutdown,
}

impl From<PhaseEntry> for Phase {
    fn from(p: PhaseEntry) -> Self {
        match p {
            PhaseEntry::Active => Phase::Active,
            PhaseEntry::PostShutdown => Phase::PostShutdown,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestEntry {
    pub name: String,
    #[serde(default)]
    pub phase: PhaseEntry,
    #[serde(default, rename = "check")]
    pub checks: Vec<Check>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Check {
    /// Wait until the process prints `text`
    WaitFor {
        process: String,
        text: String,
        timeout_secs: Option<f64>,
    },
    /// Some line already captured contains `text`; without `process`, any
    /// process's output counts
    InOutput {
        process: Option<String>,
        text: String,
    },
    /// `lines` appear in this order
    Sequential {
        process: String,
        lines: Vec<String>,
        #[serde(default)]
        timeout_secs: f64,
    },
    /// Every exited process returned one of `allowed`. With `process`, that
    /// process must also have exited already.
    ExitCodes {
        #[serde(default = "default_allowed")]
        allowed: Vec<i32>,
        process: Option<String>,
    },
    /// A context entry has the given value
    ContextEquals { name: String, value: toml::Value },
}

fn default_allowed() -> Vec<i32> {
    vec![0]
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl Check {
    /// Context entries the check reads
    fn requires(&self) -> Vec<String> {
        match self {
            Check::WaitFor { process, .. } | Check::Sequential { process, .. } => {
                vec![process.clone()]
            }
            Check::InOutput { process, .. } | Check::ExitCodes { process, .. } => {
                process.iter().cloned().collect()
            }
            Check::ContextEquals { name, .. } => vec![name.clone()],
        }
    }

    fn timeout_secs(&self) -> Option<f64> {
        match self {
            Check::WaitFor { timeout_secs, .. } => *timeout_secs,
            Check::Sequential { timeout_secs, .. } => Some(*timeout_secs),
            _ => None,
        }
    }

    fn run(&self, bindings: &Bindings<'_>) -> TestOutcome {
        match self {
            Check::WaitFor {
                process,
                text,
                timeout_secs,
            } => {
                let process = bindings.process(process)?;
                let timeout = secs(timeout_secs.unwrap_or(DEFAULT_WAIT_SECS));
                bindings.proc_output().assert_wait_for(text, process, timeout)?;
            }
            Check::InOutput { process, text } => {
                let query = match process {
                    Some(name) => ProcQuery::Process(bindings.process(name)?),
                    None => ProcQuery::All,
                };
                bindings.proc_output().assert_in_output(text, query)?;
            }
            Check::Sequential {
                process,
                lines,
                timeout_secs,
            } => {
                let process = bindings.process(process)?;
                let mut checker = bindings
                    .proc_output()
                    .sequential(process)?
                    .with_timeout(secs(*timeout_secs));
                for line in lines {
                    checker.assert_in_output(line)?;
                }
            }
            Check::ExitCodes { allowed, process } => match process {
                Some(name) => {
                    assert_exit_code(bindings.proc_info(), bindings.process(name)?, allowed)?
                }
                None => assert_exit_codes(bindings.proc_info(), allowed)?,
            },
            Check::ContextEquals { name, value } => {
                let actual = bindings.value(name)?;
                expect_eq(actual, &context_value(value))?;
            }
        }
        Ok(())
    }
}

/// Scalars map onto their context variants; anything else is kept as a
/// custom `toml::Value`
fn context_value(value: &toml::Value) -> ContextValue {
    match value {
        toml::Value::Integer(v) => ContextValue::Integer(*v),
        toml::Value::Float(v) => ContextValue::Float(*v),
        toml::Value::String(v) => ContextValue::Text(v.clone()),
        toml::Value::Boolean(v) => ContextValue::Flag(*v),
        other => ContextValue::custom(other.clone()),
    }
}

fn is_scalar(value: &toml::Value) -> bool {
    matches!(
        value,
        toml::Value::Integer(_)
            | toml::Value::Float(_)
            | toml::Value::String(_)
            | toml::Value::Boolean(_)
    )
}

// =============================================================================
// Loading
// =============================================================================

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read test file {}", path.display()))?;
        let manifest = Self::from_toml(&text)
            .with_context(|| format!("failed to parse test file {}", path.display()))?;
        debug!(
            path = %path.display(),
            processes = manifest.processes.len(),
            tests = manifest.tests.len(),
            "loaded manifest"
        );
        Ok(manifest)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// The declared tests as runnable cases
    pub fn test_suite(&self) -> TestSuite {
        let mut suite = TestSuite::new();
        for test in &self.tests {
            let mut requires: Vec<String> = Vec::new();
            for name in test.checks.iter().flat_map(Check::requires) {
                if !requires.contains(&name) {
                    requires.push(name);
                }
            }
            let checks = test.checks.clone();
            suite.push(TestCase::with_requirements(
                test.phase.into(),
                test.name.clone(),
                requires,
                move |bindings| {
                    for check in &checks {
                        check.run(bindings)?;
                    }
                    Ok(())
                },
            ));
        }
        suite
    }

    fn default_for(&self, name: &str) -> Option<&str> {
        self.arguments
            .iter()
            .find(|a| a.name == name)
            .and_then(|a| a.default.as_deref())
    }

    /// Replace every `$(arg name)` in `text`
    fn substitute(&self, text: &str, args: &LaunchArguments) -> Result<String, ValidationError> {
        const OPEN: &str = "$(arg ";
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find(OPEN) {
            out.push_str(&rest[..start]);
            let after = &rest[start + OPEN.len()..];
            let end = after.find(')').ok_or_else(|| {
                ValidationError::Description(format!("unterminated '$(arg' in '{}'", text))
            })?;
            let name = after[..end].trim();
            let value = args
                .get(name)
                .or_else(|| self.default_for(name))
                .ok_or_else(|| ValidationError::MissingArgument(name.to_string()))?;
            out.push_str(value);
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

impl LaunchDescription for Manifest {
    fn declared_arguments(&self) -> Vec<DeclaredArgument> {
        self.arguments
            .iter()
            .map(|a| DeclaredArgument {
                name: a.name.clone(),
                description: a.description.clone(),
                default: a.default.clone(),
            })
            .collect()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |msg: String| -> Result<(), ValidationError> {
            Err(ValidationError::Description(msg))
        };

        let process_names: HashSet<&str> = self.processes.iter().map(|p| p.name.as_str()).collect();
        for name in process_names
            .iter()
            .copied()
            .chain(self.context.keys().map(String::as_str))
        {
            if BUILTIN_NAMES.contains(&name) {
                return invalid(format!(
                    "'{}' is reserved for the built-in test arguments",
                    name
                ));
            }
        }
        for name in self.context.keys() {
            if process_names.contains(name.as_str()) {
                return invalid(format!(
                    "context entry '{}' has the same name as a process",
                    name
                ));
            }
        }

        if let Some(ready) = &self.ready {
            match (&ready.process, &ready.output) {
                (Some(_), Some(_)) if ready.immediate => {
                    return invalid("[ready] cannot be both immediate and output based".into())
                }
                (Some(process), Some(_)) if !process_names.contains(process.as_str()) => {
                    return Err(ValidationError::UnknownReadyProcess(process.clone()))
                }
                (Some(_), None) | (None, Some(_)) => {
                    return invalid("[ready] needs both 'process' and 'output'".into())
                }
                _ => {}
            }
        }

        for test in &self.tests {
            for check in &test.checks {
                if let Some(timeout) = check.timeout_secs() {
                    if !timeout.is_finite() || timeout < 0.0 {
                        return invalid(format!(
                            "test '{}' has an invalid timeout_secs of {}",
                            test.name, timeout
                        ));
                    }
                }
                if let Check::ContextEquals { name, value } = check {
                    if !self.context.contains_key(name) {
                        return invalid(format!(
                            "test '{}' compares unknown context entry '{}'",
                            test.name, name
                        ));
                    }
                    if !is_scalar(value) {
                        return invalid(format!(
                            "test '{}' compares '{}' against a non-scalar value",
                            test.name, name
                        ));
                    }
                    continue;
                }
                for name in check.requires() {
                    if !process_names.contains(name.as_str()) {
                        return invalid(format!(
                            "test '{}' refers to unknown process '{}'",
                            test.name, name
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    fn generate_test_description(
        &self,
        args: &LaunchArguments,
        _ready: ReadySignal,
    ) -> Result<TestDescription, ValidationError> {
        for (name, _) in args.iter() {
            if !self.arguments.iter().any(|a| a.name == name) {
                warn!(argument = name, "launch argument is not declared by the test file");
            }
        }

        let mut topology = Topology::new();
        let mut context = TestContext::new();

        for entry in &self.processes {
            let cmd = entry
                .cmd
                .iter()
                .map(|part| self.substitute(part, args))
                .collect::<Result<Vec<_>, _>>()?;
            let mut spec = ProcessSpec::new(entry.name.clone(), cmd);
            for (key, value) in &entry.env {
                spec = spec.env(key.clone(), self.substitute(value, args)?);
            }
            if let Some(cwd) = &entry.cwd {
                spec = spec.cwd(cwd.clone());
            }
            let process = topology.add_process(spec);
            context.insert(entry.name.clone(), process);
        }

        if let Some(ReadyEntry {
            process: Some(name),
            output: Some(text),
            ..
        }) = &self.ready
        {
            let process = match context.get(name) {
                Some(ContextValue::Process(p)) => p.clone(),
                _ => return Err(ValidationError::UnknownReadyProcess(name.clone())),
            };
            topology.ready_when(ReadinessTrigger::OutputContains {
                process,
                text: self.substitute(text, args)?,
            });
        }

        for (name, value) in &self.context {
            context.insert(name.clone(), context_value(value));
        }

        Ok(TestDescription { topology, context })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::ready_channel;

    const SAMPLE: &str = r#"
[[argument]]
name = "loops"
description = "Number of loops"
default = "3"

[[argument]]
name = "greeting"
description = "Printed first"

[[process]]
name = "dut"
cmd = ["sh", "-c", "echo $(arg greeting); seq $(arg loops)"]
env = { MODE = "loops=$(arg loops)" }

[ready]
process = "dut"
output = "$(arg greeting)"

[context]
int_val = 10
label = "x"

[[test]]
name = "test_output"

[[test.check]]
kind = "wait_for"
process = "dut"
text = "hello"

[[test.check]]
kind = "context_equals"
name = "int_val"
value = 10

[[test]]
name = "test_exit"
phase = "post_shutdown"

[[test.check]]
kind = "exit_codes"
"#;

    fn generate(manifest: &Manifest, tokens: &[&str]) -> Result<TestDescription, ValidationError> {
        let args = LaunchArguments::parse(tokens.iter().copied())?;
        let (ready, _waiter) = ready_channel();
        manifest.generate_test_description(&args, ready)
    }

    #[test]
    fn test_parse_sample() {
        let manifest = Manifest::from_toml(SAMPLE).unwrap();
        assert_eq!(manifest.arguments.len(), 2);
        assert_eq!(manifest.processes[0].name, "dut");
        assert_eq!(manifest.tests[1].phase, PhaseEntry::PostShutdown);
        assert_eq!(
            manifest.tests[1].checks,
            vec![Check::ExitCodes {
                allowed: vec![0],
                process: None
            }]
        );
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_substitution_uses_args_then_defaults() {
        let manifest = Manifest::from_toml(SAMPLE).unwrap();
        let desc = generate(&manifest, &["greeting:=hello"]).unwrap();

        let (_, spec) = desc.topology.processes().next().unwrap();
        assert_eq!(spec.cmd[2], "echo hello; seq 3");
        assert_eq!(spec.env.get("MODE").map(String::as_str), Some("loops=3"));
        assert!(matches!(
            desc.topology.readiness(),
            ReadinessTrigger::OutputContains { text, .. } if text == "hello"
        ));
        assert!(matches!(desc.context.get("dut"), Some(ContextValue::Process(_))));
        assert_eq!(desc.context.get("int_val"), Some(&ContextValue::Integer(10)));
    }

    #[test]
    fn test_missing_argument_is_validation_error() {
        let manifest = Manifest::from_toml(SAMPLE).unwrap();
        assert_eq!(
            generate(&manifest, &[]).err(),
            Some(ValidationError::MissingArgument("greeting".into()))
        );
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = Manifest::from_toml("[[process]]\nname = \"a\"\ncmd = [\"true\"]\nbogus = 1\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_process_in_check() {
        let manifest = Manifest::from_toml(
            r#"
[[process]]
name = "dut"
cmd = ["true"]

[[test]]
name = "t"

[[test.check]]
kind = "in_output"
process = "other"
text = "x"
"#,
        )
        .unwrap();
        let err = manifest.validate().unwrap_err();
        assert!(err.to_string().contains("unknown process 'other'"));
    }

    #[test]
    fn test_validate_rejects_half_ready_section() {
        let manifest = Manifest::from_toml(
            "[[process]]\nname = \"dut\"\ncmd = [\"true\"]\n[ready]\nprocess = \"dut\"\n",
        )
        .unwrap();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_suite_requirements_are_deduplicated() {
        let manifest = Manifest::from_toml(
            r#"
[[process]]
name = "dut"
cmd = ["true"]

[[test]]
name = "t"

[[test.check]]
kind = "in_output"
process = "dut"
text = "a"

[[test.check]]
kind = "sequential"
process = "dut"
lines = ["a", "b"]
"#,
        )
        .unwrap();
        let suite = manifest.test_suite();
        let case = suite.phase(Phase::Active).next().unwrap();
        assert_eq!(case.requires(), ["dut".to_string()]);
    }

    fn single_check(check: &str) -> Manifest {
        Manifest::from_toml(&format!(
            "[[process]]\nname = \"dut\"\ncmd = [\"true\"]\n\n[[test]]\nname = \"t\"\n\n[[test.check]]\n{}\n",
            check
        ))
        .unwrap()
    }

    #[test]
    fn test_validate_rejects_bad_timeouts() {
        let negative =
            single_check("kind = \"wait_for\"\nprocess = \"dut\"\ntext = \"x\"\ntimeout_secs = -1.0");
        let err = negative.validate().unwrap_err();
        assert!(err.to_string().contains("invalid timeout_secs"));

        let nan = single_check(
            "kind = \"sequential\"\nprocess = \"dut\"\nlines = [\"x\"]\ntimeout_secs = nan",
        );
        assert!(nan.validate().is_err());

        let fine =
            single_check("kind = \"wait_for\"\nprocess = \"dut\"\ntext = \"x\"\ntimeout_secs = 0.5");
        assert!(fine.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_builtin_names() {
        let process = Manifest::from_toml("[[process]]\nname = \"proc_output\"\ncmd = [\"true\"]\n")
            .unwrap();
        let err = process.validate().unwrap_err();
        assert!(err.to_string().contains("'proc_output' is reserved"));

        let context = Manifest::from_toml(
            "[[process]]\nname = \"dut\"\ncmd = [\"true\"]\n[context]\nlaunch_args = 1\n",
        )
        .unwrap();
        assert!(context.validate().is_err());
    }

    #[test]
    fn test_in_output_without_process_needs_nothing() {
        let manifest = single_check("kind = \"in_output\"\ntext = \"x\"");
        assert!(manifest.validate().is_ok());
        let suite = manifest.test_suite();
        let case = suite.phase(Phase::Active).next().unwrap();
        assert!(case.requires().is_empty());
    }

    #[test]
    fn test_declared_arguments_listing() {
        let manifest = Manifest::from_toml(SAMPLE).unwrap();
        let declared = manifest.declared_arguments();
        assert_eq!(declared[0].default.as_deref(), Some("3"));
        assert_eq!(declared[1].default, None);
    }
}
