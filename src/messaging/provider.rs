//! # Broker Provider Enum
//!
//! Enum dispatch over the broker backends, avoiding trait objects while
//! keeping the dispatcher and the worker non-generic at the binary level.

use async_trait::async_trait;

use super::errors::BrokerResult;
use super::providers::{InMemoryBroker, InMemorySession, RabbitMqBroker, RabbitMqSession};
use super::traits::{BrokerSession, DeliveryStream, MessageBroker};
use super::types::{OutgoingMessage, QueueArguments};
use crate::config::{BrokerConfig, ConfigResult, ConfigurationError};

/// Broker backend chosen at startup
#[derive(Debug, Clone)]
pub enum BrokerProvider {
    /// RabbitMQ via lapin
    RabbitMq(RabbitMqBroker),

    /// Process-local broker
    InMemory(InMemoryBroker),
}

impl BrokerProvider {
    /// Build the provider named by `config.backend`
    pub fn from_config(config: &BrokerConfig) -> ConfigResult<Self> {
        match config.backend.as_str() {
            "rabbitmq" | "amqp" => Ok(Self::RabbitMq(RabbitMqBroker::new(config.clone()))),
            "in_memory" | "in-memory" | "memory" => Ok(Self::InMemory(InMemoryBroker::new())),
            other => Err(ConfigurationError::invalid_value(
                "broker.backend",
                other,
                "expected 'rabbitmq' or 'in_memory'",
            )),
        }
    }
}

#[async_trait]
impl MessageBroker for BrokerProvider {
    type Session = ProviderSession;

    async fn connect(&self) -> BrokerResult<Self::Session> {
        match self {
            Self::RabbitMq(b) => b.connect().await.map(ProviderSession::RabbitMq),
            Self::InMemory(b) => b.connect().await.map(ProviderSession::InMemory),
        }
    }

    fn provider_name(&self) -> &'static str {
        match self {
            Self::RabbitMq(b) => b.provider_name(),
            Self::InMemory(b) => b.provider_name(),
        }
    }
}

/// Session on whichever backend the provider wraps
#[derive(Debug)]
pub enum ProviderSession {
    RabbitMq(RabbitMqSession),
    InMemory(InMemorySession),
}

#[async_trait]
impl BrokerSession for ProviderSession {
    async fn declare_exchange(&self, name: &str) -> BrokerResult<()> {
        match self {
            Self::RabbitMq(s) => s.declare_exchange(name).await,
            Self::InMemory(s) => s.declare_exchange(name).await,
        }
    }

    async fn declare_queue(&self, name: &str, arguments: &QueueArguments) -> BrokerResult<()> {
        match self {
            Self::RabbitMq(s) => s.declare_queue(name, arguments).await,
            Self::InMemory(s) => s.declare_queue(name, arguments).await,
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> BrokerResult<()> {
        match self {
            Self::RabbitMq(s) => s.bind_queue(queue, exchange).await,
            Self::InMemory(s) => s.bind_queue(queue, exchange).await,
        }
    }

    async fn publish(&self, exchange: &str, message: OutgoingMessage) -> BrokerResult<()> {
        match self {
            Self::RabbitMq(s) => s.publish(exchange, message).await,
            Self::InMemory(s) => s.publish(exchange, message).await,
        }
    }

    async fn set_prefetch(&self, count: u16) -> BrokerResult<()> {
        match self {
            Self::RabbitMq(s) => s.set_prefetch(count).await,
            Self::InMemory(s) => s.set_prefetch(count).await,
        }
    }

    async fn begin_transaction(&self) -> BrokerResult<()> {
        match self {
            Self::RabbitMq(s) => s.begin_transaction().await,
            Self::InMemory(s) => s.begin_transaction().await,
        }
    }

    async fn commit_transaction(&self) -> BrokerResult<()> {
        match self {
            Self::RabbitMq(s) => s.commit_transaction().await,
            Self::InMemory(s) => s.commit_transaction().await,
        }
    }

    async fn rollback_transaction(&self) -> BrokerResult<()> {
        match self {
            Self::RabbitMq(s) => s.rollback_transaction().await,
            Self::InMemory(s) => s.rollback_transaction().await,
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream> {
        match self {
            Self::RabbitMq(s) => s.consume(queue, consumer_tag).await,
            Self::InMemory(s) => s.consume(queue, consumer_tag).await,
        }
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        match self {
            Self::RabbitMq(s) => s.ack(delivery_tag).await,
            Self::InMemory(s) => s.ack(delivery_tag).await,
        }
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        match self {
            Self::RabbitMq(s) => s.reject(delivery_tag, requeue).await,
            Self::InMemory(s) => s.reject(delivery_tag, requeue).await,
        }
    }

    async fn close(&self) -> BrokerResult<()> {
        match self {
            Self::RabbitMq(s) => s.close().await,
            Self::InMemory(s) => s.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_selects_backend() {
        let provider = BrokerProvider::from_config(&BrokerConfig::default()).unwrap();
        assert_eq!(provider.provider_name(), "rabbitmq");

        let config = BrokerConfig {
            backend: "in_memory".to_string(),
            ..BrokerConfig::default()
        };
        let provider = BrokerProvider::from_config(&config).unwrap();
        assert_eq!(provider.provider_name(), "in_memory");
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let config = BrokerConfig {
            backend: "kafka".to_string(),
            ..BrokerConfig::default()
        };
        assert!(matches!(
            BrokerProvider::from_config(&config),
            Err(ConfigurationError::InvalidValue { .. })
        ));
    }

    #[tokio::test]
    async fn test_in_memory_session_dispatch() {
        let config = BrokerConfig {
            backend: "memory".to_string(),
            ..BrokerConfig::default()
        };
        let provider = BrokerProvider::from_config(&config).unwrap();
        let session = provider.connect().await.unwrap();
        assert!(matches!(session, ProviderSession::InMemory(_)));
        session.declare_exchange("async.direct").await.unwrap();
        session.close().await.unwrap();
    }
}
