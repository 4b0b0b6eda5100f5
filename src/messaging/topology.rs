//! # Topology Manager
//!
//! Broker routing for direct delivery and delayed redelivery.
//!
//! ```text
//!                publish                          consume
//! dispatcher ──────────────► <queue>.direct ──► <queue> ──────► worker
//!                                  ▲                               │
//!                                  │ dead-letter after TTL         │ retry
//!                                  │                               ▼
//!                            <queue>.ttl_<s> ◄── <queue>.ttl_<s>.direct
//! ```
//!
//! Every declaration is idempotent, so both routes are ensured on every use
//! rather than once per deployment.

use tracing::debug;

use super::errors::BrokerResult;
use super::traits::BrokerSession;
use super::types::QueueArguments;
use crate::constants::DIRECT_EXCHANGE_SUFFIX;

/// A queue and the exchange that feeds it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub queue: String,
    pub exchange: String,
}

/// `<queue>.direct`
pub fn main_exchange_name(queue_name: &str) -> String {
    format!("{}{}", queue_name, DIRECT_EXCHANGE_SUFFIX)
}

/// `<queue>.ttl_<seconds>`
pub fn delay_queue_name(queue_name: &str, delay_seconds: u64) -> String {
    format!("{}.ttl_{}", queue_name, delay_seconds)
}

/// `<queue>.ttl_<seconds>.direct`
pub fn delay_exchange_name(queue_name: &str, delay_seconds: u64) -> String {
    main_exchange_name(&delay_queue_name(queue_name, delay_seconds))
}

/// Declare `<queue>.direct` and `<queue>` and bind them
pub async fn ensure_main_route<S>(session: &S, queue_name: &str) -> BrokerResult<Route>
where
    S: BrokerSession + ?Sized,
{
    let route = Route {
        queue: queue_name.to_string(),
        exchange: main_exchange_name(queue_name),
    };

    session.declare_exchange(&route.exchange).await?;
    session
        .declare_queue(&route.queue, &QueueArguments::durable())
        .await?;
    session.bind_queue(&route.queue, &route.exchange).await?;

    debug!(queue_name = %route.queue, exchange = %route.exchange, "Main route ensured");
    Ok(route)
}

/// Declare the delay pair for `delay_seconds`; messages published to the
/// returned exchange reach `<queue>.direct` after the delay
pub async fn ensure_delay_route<S>(
    session: &S,
    queue_name: &str,
    delay_seconds: u64,
) -> BrokerResult<Route>
where
    S: BrokerSession + ?Sized,
{
    let route = Route {
        queue: delay_queue_name(queue_name, delay_seconds),
        exchange: delay_exchange_name(queue_name, delay_seconds),
    };
    let arguments = QueueArguments::delayed(delay_seconds, main_exchange_name(queue_name));

    session.declare_exchange(&route.exchange).await?;
    session.declare_queue(&route.queue, &arguments).await?;
    session.bind_queue(&route.queue, &route.exchange).await?;

    debug!(
        queue_name = %route.queue,
        exchange = %route.exchange,
        delay_seconds,
        "Delay route ensured"
    );
    Ok(route)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::providers::InMemoryBroker;
    use crate::messaging::{MessageBroker, OutgoingMessage, RetryMetadata};
    use std::time::Duration;

    #[test]
    fn test_route_names() {
        assert_eq!(main_exchange_name("async"), "async.direct");
        assert_eq!(delay_queue_name("async", 3), "async.ttl_3");
        assert_eq!(delay_exchange_name("async", 3), "async.ttl_3.direct");
    }

    #[tokio::test]
    async fn test_ensure_main_route_is_idempotent() {
        let broker = InMemoryBroker::new();
        let session = broker.connect().await.unwrap();

        let first = ensure_main_route(&session, "mailers").await.unwrap();
        let second = ensure_main_route(&session, "mailers").await.unwrap();

        assert_eq!(first, second);
        assert!(broker.has_exchange("mailers.direct"));
        assert!(broker.is_bound("mailers", "mailers.direct"));
        assert_eq!(broker.queue_arguments("mailers"), Some(QueueArguments::durable()));
    }

    #[tokio::test]
    async fn test_delay_route_arguments() {
        let broker = InMemoryBroker::new();
        let session = broker.connect().await.unwrap();

        let route = ensure_delay_route(&session, "mailers", 5).await.unwrap();
        ensure_delay_route(&session, "mailers", 5).await.unwrap();

        assert_eq!(route.queue, "mailers.ttl_5");
        assert_eq!(route.exchange, "mailers.ttl_5.direct");
        let arguments = broker.queue_arguments("mailers.ttl_5").unwrap();
        assert_eq!(arguments.message_ttl_ms, Some(5_000));
        assert_eq!(arguments.dead_letter_exchange.as_deref(), Some("mailers.direct"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_route_redelivers_to_main_queue() {
        let broker = InMemoryBroker::new();
        let session = broker.connect().await.unwrap();
        ensure_main_route(&session, "mailers").await.unwrap();
        let delay = ensure_delay_route(&session, "mailers", 3).await.unwrap();

        let metadata = RetryMetadata::default().next_attempt();
        session
            .publish(&delay.exchange, OutgoingMessage::new(b"{}".to_vec(), metadata))
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("mailers"), 0);

        tokio::time::advance(Duration::from_secs(3)).await;
        let redelivered = broker.messages("mailers");
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].metadata.retries, 1);
    }

    #[tokio::test]
    async fn test_declaration_failure_propagates() {
        let broker = InMemoryBroker::new();
        let session = broker.connect().await.unwrap();
        session
            .declare_queue("mailers.ttl_3", &QueueArguments::durable())
            .await
            .unwrap();

        assert!(ensure_delay_route(&session, "mailers", 3).await.is_err());
    }
}
