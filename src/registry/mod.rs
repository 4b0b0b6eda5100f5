//! # Target Registry
//!
//! Maps the type names carried in task records to constructors and method
//! tables, replacing runtime reflection with explicit registration.
//!
//! ## Usage
//!
//! ```rust
//! use async_trait::async_trait;
//! use serde::{Deserialize, Serialize};
//! use serde_json::Value;
//! use tasker_async::registry::{TargetError, TargetRegistry, TaskTarget};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Mailer {
//!     sender: String,
//! }
//!
//! #[async_trait]
//! impl TaskTarget for Mailer {
//!     const TYPE_NAME: &'static str = "Mailer";
//!     const METHODS: &'static [&'static str] = &["send"];
//!
//!     fn construct(_instance_args: &[Value]) -> Result<Self, TargetError> {
//!         Ok(Self { sender: "noreply@example.com".to_string() })
//!     }
//!
//!     async fn call(&mut self, method: &str, args: Vec<Value>) -> Result<(), TargetError> {
//!         match method {
//!             "send" => Ok(()),
//!             other => Err(TargetError::known(format!("unsupported method {}", other))),
//!         }
//!     }
//! }
//!
//! let registry = TargetRegistry::new();
//! registry.register::<Mailer>();
//! assert!(registry.has_method("Mailer", "send"));
//! assert!(!registry.has_method("Mailer", "archive"));
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

/// Failure raised by a target's constructor or method
#[derive(Error, Debug)]
pub enum TargetError {
    /// Expected failure that retrying cannot fix; the task is dropped
    #[error("{0}")]
    Known(String),

    /// Any other failure; the task is retried per its retry policy
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl TargetError {
    pub fn known(message: impl Into<String>) -> Self {
        Self::Known(message.into())
    }

    pub fn failed(message: impl fmt::Display) -> Self {
        Self::Failed(anyhow::anyhow!("{}", message))
    }
}

/// A type whose methods can be invoked from a task record
///
/// `Serialize`/`DeserializeOwned` let a live instance travel through the
/// side-store: the producer snapshots it, the worker restores it.
#[async_trait]
pub trait TaskTarget: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name carried in the `class` field of a task record
    const TYPE_NAME: &'static str;

    /// Methods callable by name
    const METHODS: &'static [&'static str];

    /// Build a fresh instance from the record's `instance_args`
    fn construct(instance_args: &[Value]) -> Result<Self, TargetError>;

    /// Invoke `method` with positional arguments
    async fn call(&mut self, method: &str, args: Vec<Value>) -> Result<(), TargetError>;
}

/// Object-safe view of a constructed or restored target
#[async_trait]
pub trait DynTarget: Send {
    async fn invoke(&mut self, method: &str, args: Vec<Value>) -> Result<(), TargetError>;
}

#[async_trait]
impl<T: TaskTarget> DynTarget for T {
    async fn invoke(&mut self, method: &str, args: Vec<Value>) -> Result<(), TargetError> {
        self.call(method, args).await
    }
}

/// Type-erased constructor and method table for one registered type
pub trait TargetFactory: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn methods(&self) -> &'static [&'static str];

    fn has_method(&self, method: &str) -> bool {
        self.methods().contains(&method)
    }

    fn construct(&self, instance_args: &[Value]) -> Result<Box<dyn DynTarget>, TargetError>;

    /// Rebuild an instance from a side-store snapshot
    fn restore(&self, state: Value) -> Result<Box<dyn DynTarget>, serde_json::Error>;
}

struct TypedFactory<T>(PhantomData<fn() -> T>);

impl<T: TaskTarget> TargetFactory for TypedFactory<T> {
    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn methods(&self) -> &'static [&'static str] {
        T::METHODS
    }

    fn construct(&self, instance_args: &[Value]) -> Result<Box<dyn DynTarget>, TargetError> {
        Ok(Box::new(T::construct(instance_args)?))
    }

    fn restore(&self, state: Value) -> Result<Box<dyn DynTarget>, serde_json::Error> {
        Ok(Box::new(serde_json::from_value::<T>(state)?))
    }
}

/// Registered target types, shared between clones
#[derive(Clone, Default)]
pub struct TargetRegistry {
    factories: Arc<DashMap<String, Arc<dyn TargetFactory>>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `T::TYPE_NAME`, replacing any previous registration
    pub fn register<T: TaskTarget>(&self) -> &Self {
        self.factories.insert(
            T::TYPE_NAME.to_string(),
            Arc::new(TypedFactory::<T>(PhantomData)),
        );
        info!(
            type_name = T::TYPE_NAME,
            methods = ?T::METHODS,
            "Task target registered"
        );
        self
    }

    pub fn resolve(&self, type_name: &str) -> Option<Arc<dyn TargetFactory>> {
        self.factories
            .get(type_name)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    pub fn has_method(&self, type_name: &str, method: &str) -> bool {
        self.resolve(type_name)
            .is_some_and(|factory| factory.has_method(method))
    }

    /// Registered type names, sorted
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for TargetRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}
