//! Dependency injection of context entries into test cases
//!
//! Each test case lists the context names it needs. The injector looks every
//! name up before the body runs, so a missing entry is reported as an error
//! result instead of a failure halfway through a test. The bound entries are
//! exposed through typed accessors on [`Bindings`].

use crate::context::{ContextValue, TestContext};
use crate::description::LaunchArguments;
use crate::output::ProcOutput;
use crate::process::{ProcInfo, ProcessRef};
use crate::suite::TestCase;
use std::any::Any;
use std::collections::BTreeMap;
use thiserror::Error;

/// Names every test can use without a context entry
pub const BUILTIN_NAMES: [&str; 3] = ["proc_output", "proc_info", "launch_args"];

#[derive(Debug, Error, PartialEq)]
pub enum InjectionError {
    #[error("test '{test}' requires '{name}', which is not in the test context")]
    MissingContextEntry { test: String, name: String },
    #[error("test '{test}' read '{name}' without declaring it")]
    Undeclared { test: String, name: String },
    #[error("context entry '{name}' is a {found}, not a {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// Resolves test requirements against one run's context and collaborators
pub struct Injector<'a> {
    context: &'a TestContext,
    proc_output: &'a ProcOutput,
    launch_args: &'a LaunchArguments,
    proc_info: ProcInfo,
}

impl<'a> Injector<'a> {
    pub fn new(
        context: &'a TestContext,
        proc_output: &'a ProcOutput,
        launch_args: &'a LaunchArguments,
    ) -> Self {
        Self {
            context,
            proc_output,
            launch_args,
            proc_info: ProcInfo::default(),
        }
    }

    /// Exit snapshot handed to tests resolved from now on
    pub fn set_proc_info(&mut self, proc_info: ProcInfo) {
        self.proc_info = proc_info;
    }

    pub fn resolve(&self, case: &TestCase) -> Result<Bindings<'a>, InjectionError> {
        let mut entries = BTreeMap::new();
        for name in case.requires() {
            if BUILTIN_NAMES.contains(&name.as_str()) {
                continue;
            }
            let value = self
                .context
                .get(name)
                .ok_or_else(|| InjectionError::MissingContextEntry {
                    test: case.name().to_string(),
                    name: name.clone(),
                })?;
            entries.insert(name.clone(), value);
        }

        Ok(Bindings {
            test: case.name().to_string(),
            entries,
            proc_output: self.proc_output,
            proc_info: self.proc_info.clone(),
            launch_args: self.launch_args,
        })
    }
}

/// What one test case can see
pub struct Bindings<'a> {
    test: String,
    entries: BTreeMap<String, &'a ContextValue>,
    proc_output: &'a ProcOutput,
    proc_info: ProcInfo,
    launch_args: &'a LaunchArguments,
}

/// Result of resolving a test case
pub type BoundArguments<'a> = Bindings<'a>;

impl<'a> Bindings<'a> {
    pub fn test_name(&self) -> &str {
        &self.test
    }

    /// Names bound for this test, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn value(&self, name: &str) -> Result<&'a ContextValue, InjectionError> {
        self.entries
            .get(name)
            .copied()
            .ok_or_else(|| InjectionError::Undeclared {
                test: self.test.clone(),
                name: name.to_string(),
            })
    }

    pub fn process(&self, name: &str) -> Result<&'a ProcessRef, InjectionError> {
        match self.value(name)? {
            ContextValue::Process(p) => Ok(p),
            other => Err(mismatch(name, "process", other)),
        }
    }

    pub fn integer(&self, name: &str) -> Result<i64, InjectionError> {
        match self.value(name)? {
            ContextValue::Integer(v) => Ok(*v),
            other => Err(mismatch(name, "integer", other)),
        }
    }

    pub fn float(&self, name: &str) -> Result<f64, InjectionError> {
        match self.value(name)? {
            ContextValue::Float(v) => Ok(*v),
            other => Err(mismatch(name, "float", other)),
        }
    }

    pub fn text(&self, name: &str) -> Result<&'a str, InjectionError> {
        match self.value(name)? {
            ContextValue::Text(v) => Ok(v.as_str()),
            other => Err(mismatch(name, "text", other)),
        }
    }

    pub fn flag(&self, name: &str) -> Result<bool, InjectionError> {
        match self.value(name)? {
            ContextValue::Flag(v) => Ok(*v),
            other => Err(mismatch(name, "flag", other)),
        }
    }

    pub fn custom<T: Any + Send + Sync>(&self, name: &str) -> Result<&'a T, InjectionError> {
        match self.value(name)? {
            ContextValue::Custom(v) => v.downcast_ref::<T>().ok_or(InjectionError::TypeMismatch {
                name: name.to_string(),
                expected: std::any::type_name::<T>(),
                found: "custom",
            }),
            other => Err(mismatch(name, std::any::type_name::<T>(), other)),
        }
    }

    pub fn proc_output(&self) -> &'a ProcOutput {
        self.proc_output
    }

    pub fn proc_info(&self) -> &ProcInfo {
        &self.proc_info
    }

    pub fn launch_args(&self) -> &'a LaunchArguments {
        self.launch_args
    }
}

fn mismatch(name: &str, expected: &'static str, found: &ContextValue) -> InjectionError {
    InjectionError::TypeMismatch {
        name: name.to_string(),
        expected,
        found: found.kind(),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::Topology;
    use crate::process::ProcessSpec;
    use crate::suite::Phase;

    struct Fixture {
        context: TestContext,
        proc_output: ProcOutput,
        args: LaunchArguments,
    }

    fn fixture() -> Fixture {
        let mut topology = Topology::new();
        let dut = topology.add_process(ProcessSpec::new("dut", ["dut"]));
        let context = TestContext::new()
            .with("dut", dut)
            .with("int_val", 10i64)
            .with("ratio", 0.5f64)
            .with("label", "hello")
            .with("enabled", true)
            .with("payload", ContextValue::custom(vec![1u8, 2, 3]));
        Fixture {
            context,
            proc_output: ProcOutput::new(),
            args: LaunchArguments::default(),
        }
    }

    fn case(requires: &[&str]) -> TestCase {
        TestCase::new(Phase::Active, "test_case", requires, |_| Ok(()))
    }

    #[test]
    fn test_declared_names_resolve_in_any_order() {
        let f = fixture();
        let injector = Injector::new(&f.context, &f.proc_output, &f.args);

        let a = injector.resolve(&case(&["int_val", "dut"])).unwrap();
        let b = injector.resolve(&case(&["dut", "int_val"])).unwrap();
        assert_eq!(a.integer("int_val").unwrap(), 10);
        assert_eq!(b.integer("int_val").unwrap(), 10);
        assert_eq!(a.process("dut").unwrap(), b.process("dut").unwrap());
    }

    #[test]
    fn test_missing_entry_names_test_and_entry() {
        let f = fixture();
        let injector = Injector::new(&f.context, &f.proc_output, &f.args);
        let err = injector.resolve(&case(&["int_val", "nope"])).err().unwrap();
        assert_eq!(
            err,
            InjectionError::MissingContextEntry {
                test: "test_case".into(),
                name: "nope".into()
            }
        );
    }

    #[test]
    fn test_zero_requirements_is_valid() {
        let f = fixture();
        let injector = Injector::new(&f.context, &f.proc_output, &f.args);
        let bindings = injector.resolve(&case(&[])).unwrap();
        assert_eq!(bindings.names().count(), 0);
    }

    #[test]
    fn test_undeclared_read_is_rejected() {
        let f = fixture();
        let injector = Injector::new(&f.context, &f.proc_output, &f.args);
        let bindings = injector.resolve(&case(&["dut"])).unwrap();
        assert!(matches!(
            bindings.integer("int_val"),
            Err(InjectionError::Undeclared { .. })
        ));
    }

    #[test]
    fn test_typed_accessors() {
        let f = fixture();
        let injector = Injector::new(&f.context, &f.proc_output, &f.args);
        let b = injector
            .resolve(&case(&["ratio", "label", "enabled", "payload", "dut"]))
            .unwrap();

        assert_eq!(b.float("ratio").unwrap(), 0.5);
        assert_eq!(b.text("label").unwrap(), "hello");
        assert!(b.flag("enabled").unwrap());
        assert_eq!(b.custom::<Vec<u8>>("payload").unwrap(), &vec![1, 2, 3]);
        assert_eq!(
            b.integer("label"),
            Err(InjectionError::TypeMismatch {
                name: "label".into(),
                expected: "integer",
                found: "text"
            })
        );
        assert!(b.custom::<String>("payload").is_err());
    }

    #[test]
    fn test_builtins_need_no_context_entry() {
        let f = fixture();
        let mut injector = Injector::new(&f.context, &f.proc_output, &f.args);
        injector.set_proc_info(ProcInfo::default());
        let b = injector
            .resolve(&case(&["proc_output", "proc_info", "launch_args"]))
            .unwrap();
        assert!(b.proc_info().is_empty());
        assert!(b.launch_args().is_empty());
    }
}
