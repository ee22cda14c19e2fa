//! Compilation environments and evaluation bindings.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::value::Value;

/// An extension function callable from expressions.
pub type Function = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// Declares the names an expression may reference.
#[derive(Clone, Default)]
pub struct Env {
    variables: BTreeSet<String>,
    constants: BTreeMap<String, Value>,
    functions: BTreeMap<String, Function>,
}

impl Env {
    /// Creates an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a variable bound at evaluation time.
    pub fn variable(mut self, name: impl Into<String>) -> Self {
        self.variables.insert(name.into());
        self
    }

    /// Declares several variables.
    pub fn variables<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.variables.extend(names.into_iter().map(Into::into));
        self
    }

    /// Declares a constant.
    pub fn constant(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.constants.insert(name.into(), value.into());
        self
    }

    /// Registers an extension function.
    pub fn function<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(f));
        self
    }

    /// Declares binary and decimal size unit constants (`KiB`, `MB`, ...).
    pub fn with_size_units(mut self) -> Self {
        let binary = ["KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];
        let decimal = ["kB", "MB", "GB", "TB", "PB", "EB"];
        for (i, name) in binary.iter().enumerate() {
            self = self.constant(*name, 1024u64.pow(i as u32 + 1));
        }
        for (i, name) in decimal.iter().enumerate() {
            self = self.constant(*name, 1000u64.pow(i as u32 + 1));
        }
        self
    }

    /// Whether `name` resolves to a variable or constant.
    pub fn resolves(&self, name: &str) -> bool {
        self.variables.contains(name) || self.constants.contains_key(name)
    }

    /// Value of a constant.
    pub fn constant_value(&self, name: &str) -> Option<&Value> {
        self.constants.get(name)
    }

    /// Looks up an extension function.
    pub fn lookup_function(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("variables", &self.variables)
            .field("constants", &self.constants)
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Variable bindings for one evaluation.
#[derive(Debug, Clone, Default)]
pub struct Activation {
    values: HashMap<String, Value>,
}

impl Activation {
    /// Creates empty bindings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a variable, builder style.
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Binds a variable.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    /// Bound value of a variable.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Iterates over the bindings.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}
