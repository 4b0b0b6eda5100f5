//! # Messaging Module
//!
//! Broker capability used by the dispatcher and the worker.
//!
//! ## Architecture
//!
//! ```text
//! BrokerProvider (enum)          <- Zero-cost dispatch, selected from config
//!   ├── RabbitMq(RabbitMqBroker) <- AMQP 0.9.1 via lapin
//!   └── InMemory(InMemoryBroker) <- Tests and local development
//!
//! MessageBroker::connect() -> BrokerSession
//!   declare / bind / publish / transactions / consume / ack / reject / close
//! ```
//!
//! Retry state crosses this boundary as a typed [`RetryMetadata`]; only the
//! providers know the `x-*` header encoding.

pub mod errors;
pub mod provider;
pub mod providers;
pub mod topology;
pub mod traits;
pub mod types;

pub use errors::{BrokerError, BrokerResult};
pub use provider::{BrokerProvider, ProviderSession};
pub use providers::{InMemoryBroker, InMemorySession, RabbitMqBroker, RabbitMqSession};
pub use topology::{ensure_delay_route, ensure_main_route, Route};
pub use traits::{BrokerSession, DeliveryStream, MessageBroker};
pub use types::{
    Delivery, MessageHeaders, OutgoingMessage, QueueArguments, RetryMetadata, RetryMode,
    RetryPolicy,
};
