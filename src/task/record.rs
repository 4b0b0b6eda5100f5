//! Task record wire format
//!
//! ```json
//! {"class": "Mailer", "method": "send", "args": [...], "instance": null, "instance_args": []}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DispatchError, Result};

/// Serialized description of a deferred method call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(rename = "class")]
    pub target: String,
    pub method: String,
    pub args: Vec<Value>,
    /// Side-store reference of a live instance
    pub instance: Option<String>,
    pub instance_args: Vec<Value>,
}

impl TaskRecord {
    pub fn to_body(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| DispatchError::params(format!("task record is not serializable: {}", e)))
    }
}

/// Where the worker gets the instance to invoke on
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceSource {
    /// Restore from a side-store reference
    Reference(String),
    /// Construct from these arguments
    Construct(Vec<Value>),
}

/// A task body as the worker sees it, before rehydration
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTask {
    pub target: String,
    pub method: String,
    pub args: Vec<Value>,
    pub source: InstanceSource,
}

/// Parse a task body
///
/// `class` and `method` must be strings. Empty or null `args` and
/// `instance_args` read as no arguments; a falsy `instance` reads as absent.
pub fn decode(body: &[u8]) -> Result<DecodedTask> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| DispatchError::params(format!("task body is not valid JSON: {}", e)))?;
    let Value::Object(fields) = value else {
        return Err(DispatchError::params("task body is not a JSON object"));
    };

    let target = required_string(&fields, "class")?;
    let method = required_string(&fields, "method")?;
    let args = positional(&fields, "args")?;

    let source = match fields.get("instance") {
        Some(value @ Value::String(reference)) if !is_falsy(value) => {
            InstanceSource::Reference(reference.clone())
        }
        Some(value) if !is_falsy(value) => {
            return Err(DispatchError::instance(format!(
                "instance reference must be a string, got {}",
                value
            )))
        }
        _ => InstanceSource::Construct(positional(&fields, "instance_args")?),
    };

    Ok(DecodedTask {
        target,
        method,
        args,
        source,
    })
}

fn required_string(fields: &Map<String, Value>, name: &str) -> Result<String> {
    match fields.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(DispatchError::params(format!(
            "'{}' must be a string, got {}",
            name, other
        ))),
        None => Err(DispatchError::params(format!("missing '{}'", name))),
    }
}

fn positional(fields: &Map<String, Value>, name: &str) -> Result<Vec<Value>> {
    match fields.get(name) {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(value) if !is_falsy(value) => Err(DispatchError::params(format!(
            "'{}' must be an array, got {}",
            name, value
        ))),
        _ => Ok(Vec::new()),
    }
}

/// Null, false, zero, "", "0", [] and {}
pub(crate) fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty() || s == "0",
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
    }
}
