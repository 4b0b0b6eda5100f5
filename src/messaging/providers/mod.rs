//! # Broker Providers
//!
//! - [`RabbitMqBroker`] - RabbitMQ via the lapin crate
//! - [`InMemoryBroker`] - process-local broker for tests and development

mod in_memory;
mod rabbitmq;

pub use in_memory::{InMemoryBroker, InMemorySession};
pub use rabbitmq::{RabbitMqBroker, RabbitMqSession};
