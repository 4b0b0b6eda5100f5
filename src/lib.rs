#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Tasker Async
//!
//! Deferred method dispatch over a message broker.
//!
//! ## Overview
//!
//! A producer describes a call (`target`, `method`, positional arguments) and
//! hands it to the [`Dispatcher`], which publishes it as a JSON task record.
//! A worker process runs a [`Consumer`] that receives the record, rebuilds the
//! call and invokes it through the [`TargetRegistry`]. Failed invocations are
//! retried by the broker itself, either through TTL delay queues (bounded by
//! attempt count) or by rejecting with requeue (bounded by wall-clock time).
//!
//! ## Module Organization
//!
//! - [`task`] - Task record wire format and the side-store codec
//! - [`messaging`] - Broker capability, providers and topology
//! - [`cache`] - Side-store capability and providers
//! - [`registry`] - Type-name to constructor and method table mapping
//! - [`dispatch`] - Producer side
//! - [`worker`] - Consumer loop and retry controller
//! - [`config`] - Layered configuration
//! - [`error`] - Dispatch error taxonomy
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use tasker_async::cache::CacheProvider;
//! use tasker_async::messaging::providers::InMemoryBroker;
//! use tasker_async::task::{Arg, RunOptions, TaskCodec};
//! use tasker_async::Dispatcher;
//!
//! # async fn example() -> tasker_async::Result<()> {
//! let cache = Arc::new(CacheProvider::in_memory(10_000, Duration::from_secs(86_400)));
//! let mut dispatcher = Dispatcher::new(InMemoryBroker::new(), TaskCodec::with_defaults(cache)?);
//! dispatcher.set_max_retries(3);
//!
//! let sent = dispatcher
//!     .run("Mailer", "send", vec![Arg::from("a@example.com")], RunOptions::new())
//!     .await;
//! assert!(sent);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod constants;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod registry;
pub mod task;
pub mod worker;

pub use config::{AsyncConfig, ConfigLoader};
pub use dispatch::Dispatcher;
pub use error::{DispatchError, Result};
pub use messaging::{RetryMetadata, RetryMode, RetryPolicy};
pub use registry::{TargetError, TargetRegistry, TaskTarget};
pub use task::{Arg, Instance, RunOptions, Target};
pub use worker::{Consumer, Outcome, RetryController};
