//! Arguments, targets and options accepted by the dispatcher

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::registry::TaskTarget;

/// One positional argument of a deferred call
///
/// Plain JSON travels inline. [`Arg::Live`] marks a value that stands for a
/// live object; the codec moves it to the side-store and sends a reference
/// in its place.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Value(Value),
    List(Vec<Arg>),
    Map(BTreeMap<String, Arg>),
    Live(Value),
}

impl Arg {
    /// Snapshot `value` as a live object
    pub fn live<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::Live(serde_json::to_value(value)?))
    }

    /// True when no leaf needs the side-store
    pub fn is_inline(&self) -> bool {
        match self {
            Self::Value(_) => true,
            Self::List(items) => items.iter().all(Arg::is_inline),
            Self::Map(entries) => entries.values().all(Arg::is_inline),
            Self::Live(_) => false,
        }
    }

    /// JSON view with live leaves replaced by their snapshots
    pub fn to_value(&self) -> Value {
        match self {
            Self::Value(v) | Self::Live(v) => v.clone(),
            Self::List(items) => Value::Array(items.iter().map(Arg::to_value).collect()),
            Self::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_value()))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Self::Value(Value::from(value))
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Self::Value(Value::from(value))
    }
}

impl From<i64> for Arg {
    fn from(value: i64) -> Self {
        Self::Value(Value::from(value))
    }
}

impl From<f64> for Arg {
    fn from(value: f64) -> Self {
        Self::Value(Value::from(value))
    }
}

impl From<bool> for Arg {
    fn from(value: bool) -> Self {
        Self::Value(Value::from(value))
    }
}

impl From<Vec<Arg>> for Arg {
    fn from(items: Vec<Arg>) -> Self {
        Self::List(items)
    }
}

impl From<BTreeMap<String, Arg>> for Arg {
    fn from(entries: BTreeMap<String, Arg>) -> Self {
        Self::Map(entries)
    }
}

/// Snapshot of a live target instance
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    type_name: String,
    state: Value,
}

impl Instance {
    pub fn capture<T: TaskTarget>(target: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            type_name: T::TYPE_NAME.to_string(),
            state: serde_json::to_value(target)?,
        })
    }

    /// Snapshot from an already serialized state
    pub fn from_state(type_name: impl Into<String>, state: Value) -> Self {
        Self {
            type_name: type_name.into(),
            state,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn state(&self) -> &Value {
        &self.state
    }
}

/// What a task is invoked on
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// Construct a fresh instance of the named type
    Type(String),
    /// Invoke on this instance; its type name becomes the record's target
    Instance(Instance),
}

impl Target {
    pub fn type_name(&self) -> &str {
        match self {
            Self::Type(name) => name,
            Self::Instance(instance) => instance.type_name(),
        }
    }
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Self::Type(name.to_string())
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        Self::Type(name)
    }
}

impl From<Instance> for Target {
    fn from(instance: Instance) -> Self {
        Self::Instance(instance)
    }
}

/// Per-call options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOptions {
    /// Existing instance to invoke on instead of constructing one
    pub instance: Option<Instance>,
    /// Constructor arguments, used only without an instance
    pub instance_args: Vec<Value>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance(mut self, instance: Instance) -> Self {
        self.instance = Some(instance);
        self
    }

    pub fn with_instance_args(mut self, instance_args: Vec<Value>) -> Self {
        self.instance_args = instance_args;
        self
    }
}
