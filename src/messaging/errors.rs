//! # Broker Error Types
//!
//! Structured transport errors using thiserror instead of
//! `Box<dyn Error>` patterns.

use thiserror::Error;

/// Transport-level errors raised by broker providers
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Broker connection error: {message}")]
    Connection { message: String },

    #[error("Broker channel error: {message}")]
    Channel { message: String },

    #[error("Declaration failed: {name}: {message}")]
    Declaration { name: String, message: String },

    #[error("Publish failed: {exchange}: {message}")]
    Publish { exchange: String, message: String },

    #[error("Consume failed: {queue_name}: {message}")]
    Consume { queue_name: String, message: String },

    #[error("Acknowledgement failed: {operation}(delivery_tag={delivery_tag}): {message}")]
    Acknowledgement {
        operation: String,
        delivery_tag: u64,
        message: String,
    },

    #[error("Transaction error: {message}")]
    Transaction { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },
}

impl BrokerError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn channel(message: impl Into<String>) -> Self {
        Self::Channel {
            message: message.into(),
        }
    }

    pub fn declaration(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Declaration {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn publish(exchange: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            exchange: exchange.into(),
            message: message.into(),
        }
    }

    pub fn consume(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Consume {
            queue_name: queue_name.into(),
            message: message.into(),
        }
    }

    pub fn ack(delivery_tag: u64, message: impl Into<String>) -> Self {
        Self::Acknowledgement {
            operation: "ack".to_string(),
            delivery_tag,
            message: message.into(),
        }
    }

    pub fn reject(delivery_tag: u64, message: impl Into<String>) -> Self {
        Self::Acknowledgement {
            operation: "reject".to_string(),
            delivery_tag,
            message: message.into(),
        }
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Whether the broker could not be reached at all
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
