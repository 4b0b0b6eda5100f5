//! # RabbitMQ Broker
//!
//! AMQP 0.9.1 implementation of [`MessageBroker`] using the `lapin` crate.
//!
//! ## Features
//!
//! - **Durable topology**: direct exchanges and queues survive broker restarts
//! - **Persistent publishes**: delivery mode 2, `application/json` bodies
//! - **Delay routes**: `x-message-ttl` + `x-dead-letter-exchange` queue arguments
//! - **Transactions**: `tx.select` / `tx.commit` / `tx.rollback`
//! - **Prefetch**: `basic.qos` bounds unacknowledged deliveries per channel
//!
//! Retry metadata travels as integer `x-*` headers. The broker-maintained
//! `x-death` header is read into [`Delivery::dead_letter_count`] and never
//! copied into outgoing headers.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, info};

use crate::config::BrokerConfig;
use crate::constants::{headers, TASK_CONTENT_TYPE};
use crate::messaging::errors::{BrokerError, BrokerResult};
use crate::messaging::traits::{BrokerSession, DeliveryStream, MessageBroker};
use crate::messaging::types::{
    Delivery, MessageHeaders, OutgoingMessage, QueueArguments, RetryMetadata,
};

const MESSAGE_TTL_ARGUMENT: &str = "x-message-ttl";
const DEAD_LETTER_EXCHANGE_ARGUMENT: &str = "x-dead-letter-exchange";
const PERSISTENT_DELIVERY_MODE: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Connection factory for a RabbitMQ broker
#[derive(Debug, Clone)]
pub struct RabbitMqBroker {
    config: BrokerConfig,
}

impl RabbitMqBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}

#[async_trait]
impl MessageBroker for RabbitMqBroker {
    type Session = RabbitMqSession;

    async fn connect(&self) -> BrokerResult<Self::Session> {
        let properties = ConnectionProperties::default()
            .with_connection_name(self.config.connection_name.clone().into());
        let timeout = Duration::from_secs(self.config.connection_timeout_seconds);

        let connection =
            tokio::time::timeout(timeout, Connection::connect(&self.config.url, properties))
                .await
                .map_err(|_| {
                    BrokerError::connection(format!(
                        "RabbitMQ connection to {} timed out after {}s",
                        self.config.redacted_url(),
                        self.config.connection_timeout_seconds
                    ))
                })?
                .map_err(|e| {
                    BrokerError::connection(format!(
                        "RabbitMQ connection to {} failed: {}",
                        self.config.redacted_url(),
                        e
                    ))
                })?;

        let channel = connection.create_channel().await.map_err(|e| {
            BrokerError::channel(format!("RabbitMQ channel creation failed: {}", e))
        })?;

        debug!(url = %self.config.redacted_url(), "RabbitMQ session opened");
        Ok(RabbitMqSession {
            connection,
            channel,
        })
    }

    fn provider_name(&self) -> &'static str {
        "rabbitmq"
    }
}

/// One AMQP connection with a single channel
#[derive(Debug)]
pub struct RabbitMqSession {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerSession for RabbitMqSession {
    async fn declare_exchange(&self, name: &str) -> BrokerResult<()> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::declaration(name, e.to_string()))
    }

    async fn declare_queue(&self, name: &str, arguments: &QueueArguments) -> BrokerResult<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                queue_arguments_table(arguments),
            )
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::declaration(name, e.to_string()))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> BrokerResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::declaration(queue, format!("bind to {}: {}", exchange, e)))
    }

    async fn publish(&self, exchange: &str, message: OutgoingMessage) -> BrokerResult<()> {
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_content_type(TASK_CONTENT_TYPE.into())
            .with_headers(headers_table(&message.metadata));

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                "",
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| BrokerError::publish(exchange, e.to_string()))?;

        confirm
            .await
            .map_err(|e| BrokerError::publish(exchange, format!("confirmation failed: {}", e)))?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> BrokerResult<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::channel(format!("basic.qos failed: {}", e)))
    }

    async fn begin_transaction(&self) -> BrokerResult<()> {
        self.channel
            .tx_select()
            .await
            .map_err(|e| BrokerError::transaction(format!("tx.select failed: {}", e)))
    }

    async fn commit_transaction(&self) -> BrokerResult<()> {
        self.channel
            .tx_commit()
            .await
            .map_err(|e| BrokerError::transaction(format!("tx.commit failed: {}", e)))
    }

    async fn rollback_transaction(&self) -> BrokerResult<()> {
        self.channel
            .tx_rollback()
            .await
            .map_err(|e| BrokerError::transaction(format!("tx.rollback failed: {}", e)))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::consume(queue, e.to_string()))?;

        info!(queue_name = %queue, consumer_tag = %consumer_tag, "RabbitMQ consumer registered");

        let queue_name = queue.to_string();
        let stream = consumer.map(move |result| {
            result
                .map(|delivery| {
                    let table = delivery.properties.headers().clone().unwrap_or_default();
                    Delivery {
                        delivery_tag: delivery.delivery_tag,
                        metadata: RetryMetadata::from_headers(&headers_from_table(&table)),
                        dead_letter_count: dead_letter_count(&table),
                        redelivered: delivery.redelivered,
                        body: delivery.data,
                    }
                })
                .map_err(|e| BrokerError::consume(&queue_name, e.to_string()))
        });
        Ok(Box::pin(stream))
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::ack(delivery_tag, e.to_string()))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| BrokerError::reject(delivery_tag, e.to_string()))
    }

    async fn close(&self) -> BrokerResult<()> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| BrokerError::channel(format!("channel close failed: {}", e)))?;
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| BrokerError::connection(format!("connection close failed: {}", e)))
    }
}

fn queue_arguments_table(arguments: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    if let Some(ttl_ms) = arguments.message_ttl_ms {
        table.insert(
            MESSAGE_TTL_ARGUMENT.into(),
            AMQPValue::LongLongInt(i64::try_from(ttl_ms).unwrap_or(i64::MAX)),
        );
    }
    if let Some(exchange) = &arguments.dead_letter_exchange {
        table.insert(
            DEAD_LETTER_EXCHANGE_ARGUMENT.into(),
            AMQPValue::LongString(exchange.clone().into()),
        );
    }
    table
}

fn headers_table(metadata: &RetryMetadata) -> FieldTable {
    let mut table = FieldTable::default();
    for (name, value) in metadata.to_headers() {
        table.insert(name.into(), AMQPValue::LongLongInt(value));
    }
    table
}

fn header_int(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::Timestamp(v) => i64::try_from(*v).ok(),
        _ => None,
    }
}

/// Integer headers, without broker bookkeeping
fn headers_from_table(table: &FieldTable) -> MessageHeaders {
    table
        .inner()
        .iter()
        .filter(|(name, _)| name.as_str() != headers::DEATH)
        .filter_map(|(name, value)| header_int(value).map(|v| (name.as_str().to_string(), v)))
        .collect()
}

/// Sum of the per-queue `count` fields of `x-death`
fn dead_letter_count(table: &FieldTable) -> u32 {
    let deaths = table
        .inner()
        .iter()
        .find(|(name, _)| name.as_str() == headers::DEATH)
        .map(|(_, value)| value);

    let Some(AMQPValue::FieldArray(deaths)) = deaths else {
        return 0;
    };

    deaths
        .as_slice()
        .iter()
        .map(|death| match death {
            AMQPValue::FieldTable(entry) => entry
                .inner()
                .iter()
                .find(|(name, _)| name.as_str() == "count")
                .and_then(|(_, count)| header_int(count))
                .and_then(|count| u32::try_from(count).ok())
                .unwrap_or(1),
            _ => 1,
        })
        .sum()
}
