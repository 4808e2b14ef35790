//! Test Context: the named-object registry handed to test cases
//!
//! Built once by the launch description and frozen when the runner takes
//! ownership of it. Test cases never write to it; they only read the entries
//! they declared (see `inject`).

use crate::process::ProcessRef;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A value stored in the test context
#[derive(Clone)]
pub enum ContextValue {
    Process(ProcessRef),
    Integer(i64),
    Float(f64),
    Text(String),
    Flag(bool),
    /// Anything else a launch description wants to share with its tests
    Custom(Arc<dyn Any + Send + Sync>),
}

impl ContextValue {
    pub fn custom<T: Any + Send + Sync>(value: T) -> Self {
        ContextValue::Custom(Arc::new(value))
    }

    /// Short type label used in mismatch errors
    pub fn kind(&self) -> &'static str {
        match self {
            ContextValue::Process(_) => "process",
            ContextValue::Integer(_) => "integer",
            ContextValue::Float(_) => "float",
            ContextValue::Text(_) => "text",
            ContextValue::Flag(_) => "flag",
            ContextValue::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextValue::Process(p) => write!(f, "Process({})", p),
            ContextValue::Integer(v) => write!(f, "Integer({})", v),
            ContextValue::Float(v) => write!(f, "Float({})", v),
            ContextValue::Text(v) => write!(f, "Text({:?})", v),
            ContextValue::Flag(v) => write!(f, "Flag({})", v),
            ContextValue::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl PartialEq for ContextValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ContextValue::Process(a), ContextValue::Process(b)) => a == b,
            (ContextValue::Integer(a), ContextValue::Integer(b)) => a == b,
            (ContextValue::Float(a), ContextValue::Float(b)) => a == b,
            (ContextValue::Text(a), ContextValue::Text(b)) => a == b,
            (ContextValue::Flag(a), ContextValue::Flag(b)) => a == b,
            (ContextValue::Custom(a), ContextValue::Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<ProcessRef> for ContextValue {
    fn from(p: ProcessRef) -> Self {
        ContextValue::Process(p)
    }
}

impl From<i64> for ContextValue {
    fn from(v: i64) -> Self {
        ContextValue::Integer(v)
    }
}

impl From<f64> for ContextValue {
    fn from(v: f64) -> Self {
        ContextValue::Float(v)
    }
}

impl From<bool> for ContextValue {
    fn from(v: bool) -> Self {
        ContextValue::Flag(v)
    }
}

impl From<&str> for ContextValue {
    fn from(v: &str) -> Self {
        ContextValue::Text(v.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(v: String) -> Self {
        ContextValue::Text(v)
    }
}

/// Name → value registry. Later inserts of the same name replace earlier ones.
#[derive(Clone, Debug, Default)]
pub struct TestContext {
    entries: BTreeMap<String, ContextValue>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, used while the description assembles the context
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ContextValue>) {
        self.entries.insert(name.into(), value.into());
    }

    /// Merge another context on top of this one
    pub fn extend(&mut self, other: TestContext) {
        self.entries.extend(other.entries);
    }

    pub fn get(&self, name: &str) -> Option<&ContextValue> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
