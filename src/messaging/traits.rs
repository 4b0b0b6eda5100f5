//! # Broker Capability Traits
//!
//! The dispatcher and the worker only talk to a broker through these two
//! traits. A [`MessageBroker`] is a cheap, cloneable factory; each operation
//! that needs the broker opens its own [`BrokerSession`] and closes it when
//! done.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::debug;

use super::errors::BrokerResult;
use super::types::{Delivery, OutgoingMessage, QueueArguments};

/// Stream of deliveries from a consumer registration
pub type DeliveryStream = BoxStream<'static, BrokerResult<Delivery>>;

/// Opens sessions against a broker
#[async_trait]
pub trait MessageBroker: Send + Sync + 'static {
    type Session: BrokerSession;

    /// Open a connection and a channel on it
    async fn connect(&self) -> BrokerResult<Self::Session>;

    /// Provider name for logging
    fn provider_name(&self) -> &'static str;
}

/// One connection plus channel
///
/// Exchanges are always durable direct exchanges, queues are always durable,
/// and publishes are persistent with an empty routing key.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Declare a durable direct exchange (idempotent)
    async fn declare_exchange(&self, name: &str) -> BrokerResult<()>;

    /// Declare a durable queue (idempotent for identical arguments)
    async fn declare_queue(&self, name: &str, arguments: &QueueArguments) -> BrokerResult<()>;

    /// Bind a queue to an exchange with the empty routing key
    async fn bind_queue(&self, queue: &str, exchange: &str) -> BrokerResult<()>;

    /// Publish a persistent message; buffered by the broker inside a transaction
    async fn publish(&self, exchange: &str, message: OutgoingMessage) -> BrokerResult<()>;

    /// Maximum unacknowledged deliveries on this session; 0 is unlimited
    async fn set_prefetch(&self, count: u16) -> BrokerResult<()>;

    async fn begin_transaction(&self) -> BrokerResult<()>;

    async fn commit_transaction(&self) -> BrokerResult<()>;

    async fn rollback_transaction(&self) -> BrokerResult<()>;

    /// Register a consumer on `queue`
    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream>;

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()>;

    /// Close the channel and the connection. Unacknowledged deliveries go
    /// back to their queues.
    async fn close(&self) -> BrokerResult<()>;

    /// Close, swallowing teardown errors
    async fn close_quietly(&self) {
        if let Err(e) = self.close().await {
            debug!(error = %e, "Ignoring broker session close failure");
        }
    }
}
