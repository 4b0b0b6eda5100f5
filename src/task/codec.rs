//! # Task Codec
//!
//! Converts calls into [`TaskRecord`]s and back. Live-object leaves are
//! written to the side-store under generated reference keys
//! (`<namespace>.<counter>.<uuid>`); the worker resolves them again with
//! [`TaskCodec::rehydrate`] and releases them after a successful invocation.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use super::args::{Arg, RunOptions, Target};
use super::record::{self, DecodedTask, TaskRecord};
use crate::cache::CacheService;
use crate::config::CacheConfig;
use crate::constants::{DEFAULT_KEY_NAMESPACE, DEFAULT_REFERENCE_TTL_SECONDS};
use crate::error::{DispatchError, Result};

/// Arguments with references resolved, plus the keys that were read
#[derive(Debug, Clone, PartialEq)]
pub struct Rehydrated {
    pub args: Vec<Value>,
    pub keys: Vec<String>,
}

/// Encodes and decodes task records against one side-store
#[derive(Debug)]
pub struct TaskCodec<C> {
    cache: Arc<C>,
    namespace: String,
    reference_ttl: Duration,
    counter: AtomicU64,
    reference_pattern: Regex,
}

impl<C: CacheService> TaskCodec<C> {
    pub fn new(cache: Arc<C>, namespace: impl Into<String>, reference_ttl: Duration) -> Result<Self> {
        let namespace = namespace.into();
        let reference_pattern =
            Regex::new(&format!(r"^{}\.\d+\.[0-9a-f]{{32}}$", regex::escape(&namespace)))
                .map_err(|e| DispatchError::configuration(format!("invalid key namespace: {}", e)))?;

        Ok(Self {
            cache,
            namespace,
            reference_ttl,
            counter: AtomicU64::new(0),
            reference_pattern,
        })
    }

    pub fn from_config(cache: Arc<C>, config: &CacheConfig) -> Result<Self> {
        Self::new(
            cache,
            config.key_namespace.clone(),
            Duration::from_secs(config.reference_ttl_seconds),
        )
    }

    /// Default namespace and 24-hour reference lifetime
    pub fn with_defaults(cache: Arc<C>) -> Result<Self> {
        Self::new(
            cache,
            DEFAULT_KEY_NAMESPACE,
            Duration::from_secs(DEFAULT_REFERENCE_TTL_SECONDS),
        )
    }

    pub fn cache(&self) -> &Arc<C> {
        &self.cache
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// References generated by this codec so far
    pub fn references_created(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Whether `value` has the shape of a reference key in this namespace
    pub fn is_reference(&self, value: &str) -> bool {
        self.reference_pattern.is_match(value)
    }

    fn next_key(&self) -> String {
        let count = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}.{}.{}", self.namespace, count, Uuid::new_v4().simple())
    }

    /// Build a record, writing live leaves and any instance to the side-store
    pub async fn encode(
        &self,
        target: Target,
        method: &str,
        args: Vec<Arg>,
        options: RunOptions,
    ) -> Result<TaskRecord> {
        let mut pending = Vec::new();
        let args = args
            .into_iter()
            .map(|arg| self.externalize(arg, &mut pending))
            .collect::<Result<Vec<_>>>()?;

        let (type_name, instance) = match target {
            Target::Type(name) => (name, options.instance),
            Target::Instance(instance) => (instance.type_name().to_string(), Some(instance)),
        };

        let instance_ref = match instance {
            Some(instance) => {
                let key = self.next_key();
                pending.push((key.clone(), snapshot(instance.state())?));
                Some(key)
            }
            None => None,
        };

        for (key, value) in &pending {
            self.cache.set(key, value, self.reference_ttl).await?;
        }
        if !pending.is_empty() {
            debug!(
                references = pending.len(),
                target_type = %type_name,
                method = %method,
                "Externalized task arguments"
            );
        }

        Ok(TaskRecord {
            target: type_name,
            method: method.to_string(),
            args,
            instance: instance_ref,
            instance_args: options.instance_args,
        })
    }

    fn externalize(&self, arg: Arg, pending: &mut Vec<(String, String)>) -> Result<Value> {
        Ok(match arg {
            Arg::Value(value) => value,
            Arg::List(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| self.externalize(item, pending))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Arg::Map(entries) => Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((k, self.externalize(v, pending)?)))
                    .collect::<Result<Map<_, _>>>()?,
            ),
            Arg::Live(state) => {
                let key = self.next_key();
                pending.push((key.clone(), snapshot(&state)?));
                Value::String(key)
            }
        })
    }

    pub fn decode(&self, body: &[u8]) -> Result<DecodedTask> {
        record::decode(body)
    }

    /// Replace every reference leaf with the value it points to
    ///
    /// A reference that no longer resolves is a side-store error, which the
    /// worker retries.
    pub async fn rehydrate(&self, args: Vec<Value>) -> Result<Rehydrated> {
        let mut keys = BTreeSet::new();
        for arg in &args {
            self.collect_references(arg, &mut keys);
        }
        if keys.is_empty() {
            return Ok(Rehydrated {
                args,
                keys: Vec::new(),
            });
        }

        let mut resolved = Vec::with_capacity(keys.len());
        for key in &keys {
            let value = self.fetch(key).await?.ok_or_else(|| {
                DispatchError::cache(format!("side-store reference '{}' did not resolve", key))
            })?;
            resolved.push((key.clone(), value));
        }

        let args = args
            .into_iter()
            .map(|arg| substitute(arg, &resolved))
            .collect();
        Ok(Rehydrated {
            args,
            keys: keys.into_iter().collect(),
        })
    }

    /// Resolve the snapshot behind an instance reference
    pub async fn rehydrate_instance(&self, reference: &str) -> Result<Value> {
        if !self.is_reference(reference) {
            return Err(DispatchError::instance(format!(
                "'{}' is not a side-store reference",
                reference
            )));
        }

        // Fieldless targets snapshot as `null` or `{}`; only a miss is empty
        match self.fetch(reference).await? {
            Some(Value::Bool(false)) | None => Err(DispatchError::instance(format!(
                "instance reference '{}' resolved to nothing",
                reference
            ))),
            Some(state) => Ok(state),
        }
    }

    /// Delete references after a successful invocation; failures only log
    pub async fn release(&self, keys: &[String]) {
        for key in keys {
            if let Err(e) = self.cache.delete(key).await {
                warn!(key = %key, error = %e, "Failed to release side-store reference");
            }
        }
    }

    async fn fetch(&self, key: &str) -> Result<Option<Value>> {
        let Some(raw) = self.cache.get(key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw).map(Some).map_err(|e| {
            DispatchError::cache(format!("side-store value for '{}' is not JSON: {}", key, e))
        })
    }

    fn collect_references(&self, value: &Value, keys: &mut BTreeSet<String>) {
        match value {
            Value::String(s) if self.is_reference(s) => {
                keys.insert(s.clone());
            }
            Value::Array(items) => items.iter().for_each(|v| self.collect_references(v, keys)),
            Value::Object(fields) => fields
                .values()
                .for_each(|v| self.collect_references(v, keys)),
            _ => {}
        }
    }
}

fn snapshot(state: &Value) -> Result<String> {
    serde_json::to_string(state)
        .map_err(|e| DispatchError::params(format!("live argument is not serializable: {}", e)))
}

fn substitute(value: Value, resolved: &[(String, Value)]) -> Value {
    match value {
        Value::String(s) => match resolved.iter().find(|(key, _)| *key == s) {
            Some((_, replacement)) => replacement.clone(),
            None => Value::String(s),
        },
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| substitute(item, resolved))
                .collect(),
        ),
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(k, v)| (k, substitute(v, resolved)))
                .collect(),
        ),
        other => other,
    }
}
