//! # Consumer / Invoker
//!
//! The worker loop. Each delivery is decoded, its arguments and instance are
//! rehydrated from the side-store, the method is invoked through the
//! [`TargetRegistry`], and the delivery is settled:
//!
//! ```text
//! RECEIVED ──ok──► release references ──► ack            (AckedSuccess)
//!     │
//!     └─err──► RetryController ──► AckedTerminalFailure | Rescheduled | AckedExhausted
//! ```
//!
//! References are only released after a successful invocation, so a retried
//! delivery can still rehydrate them. One delivery is processed at a time
//! (prefetch 1).

use std::future::Future;

use futures::StreamExt;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::retry::{system_clock, Clock, Outcome, RetryController};
use crate::cache::CacheService;
use crate::constants::CONSUMER_PREFETCH;
use crate::error::{DispatchError, Result};
use crate::logging::log_delivery_outcome;
use crate::messaging::{ensure_main_route, BrokerResult, BrokerSession, Delivery, MessageBroker};
use crate::registry::{DynTarget, TargetError, TargetRegistry};
use crate::task::{InstanceSource, TaskCodec};

pub struct Consumer<B, C> {
    broker: B,
    codec: TaskCodec<C>,
    registry: TargetRegistry,
    retry: RetryController,
    clock: Clock,
    consumer_tag: String,
}

impl<B, C> std::fmt::Debug for Consumer<B, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("consumer_tag", &self.consumer_tag)
            .field("registry", &self.registry)
            .field("retry", &self.retry)
            .finish()
    }
}

impl<B: MessageBroker, C: CacheService> Consumer<B, C> {
    pub fn new(
        broker: B,
        codec: TaskCodec<C>,
        registry: TargetRegistry,
        retry: RetryController,
    ) -> Self {
        Self {
            broker,
            codec,
            registry,
            retry,
            clock: system_clock(),
            consumer_tag: format!("async-worker-{}", Uuid::new_v4().simple()),
        }
    }

    /// Replace the clock used for REJECT-mode deadlines
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    pub fn codec(&self) -> &TaskCodec<C> {
        &self.codec
    }

    /// Consume `queue_name` until the broker closes the stream
    pub async fn consume(&self, queue_name: &str) -> Result<u64> {
        self.consume_until(queue_name, std::future::pending()).await
    }

    /// Consume `queue_name` until `shutdown` resolves
    ///
    /// A delivery in progress always runs to completion before shutdown is
    /// observed. Returns the number of deliveries handled.
    pub async fn consume_until<F>(&self, queue_name: &str, shutdown: F) -> Result<u64>
    where
        F: Future<Output = ()>,
    {
        let session = self.broker.connect().await?;
        let result = self.run_loop(&session, queue_name, shutdown).await;
        session.close_quietly().await;
        result
    }

    async fn run_loop<S, F>(&self, session: &S, queue_name: &str, shutdown: F) -> Result<u64>
    where
        S: BrokerSession,
        F: Future<Output = ()>,
    {
        ensure_main_route(session, queue_name).await?;
        session.set_prefetch(CONSUMER_PREFETCH).await?;
        let mut deliveries = session.consume(queue_name, &self.consumer_tag).await?;

        info!(
            queue_name = %queue_name,
            consumer_tag = %self.consumer_tag,
            provider = self.broker.provider_name(),
            targets = ?self.registry.type_names(),
            "Worker consuming"
        );

        tokio::pin!(shutdown);
        let mut handled = 0u64;
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!(queue_name = %queue_name, handled, "Worker shutdown requested");
                    return Ok(handled);
                }

                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        handled += 1;
                        if let Err(e) = self.handle_delivery(session, queue_name, &delivery).await {
                            error!(
                                queue_name = %queue_name,
                                delivery_tag = delivery.delivery_tag,
                                error = %e,
                                "Failed to settle delivery"
                            );
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        return Err(DispatchError::broker(format!(
                            "delivery stream for '{}' closed by the broker",
                            queue_name
                        )));
                    }
                },
            }
        }
    }

    /// Invoke one delivery and settle it with the broker
    ///
    /// Invocation failures never surface here; only a failure to ack,
    /// reject or republish does.
    pub async fn handle_delivery<S>(
        &self,
        session: &S,
        queue_name: &str,
        delivery: &Delivery,
    ) -> BrokerResult<Outcome>
    where
        S: BrokerSession + ?Sized,
    {
        debug!(
            queue_name = %queue_name,
            delivery_tag = delivery.delivery_tag,
            retries = delivery.metadata.retries,
            redelivered = delivery.redelivered,
            dead_letter_count = delivery.dead_letter_count,
            "Delivery received"
        );

        match self.invoke(&delivery.body).await {
            Ok(references) => {
                self.codec.release(&references).await;
                session.ack(delivery.delivery_tag).await?;
                let outcome = Outcome::AckedSuccess;
                log_delivery_outcome(
                    queue_name,
                    delivery.delivery_tag,
                    &delivery.metadata,
                    outcome,
                    None,
                );
                Ok(outcome)
            }
            Err(error) => {
                let now = (self.clock)();
                let outcome = self
                    .retry
                    .handle(session, queue_name, delivery, &error, now)
                    .await?;
                log_delivery_outcome(
                    queue_name,
                    delivery.delivery_tag,
                    &delivery.metadata,
                    outcome,
                    Some(&error),
                );
                Ok(outcome)
            }
        }
    }

    /// Decode, rehydrate and invoke; returns the references to release
    async fn invoke(&self, body: &[u8]) -> Result<Vec<String>> {
        let task = self.codec.decode(body)?;
        let factory = self.registry.resolve(&task.target).ok_or_else(|| {
            DispatchError::invocation(&task.target, &task.method, "target type is not registered")
        })?;

        let rehydrated = self.codec.rehydrate(task.args).await?;
        let mut references = rehydrated.keys;

        let mut target: Box<dyn DynTarget> = match task.source {
            InstanceSource::Reference(reference) => {
                let state = self.codec.rehydrate_instance(&reference).await?;
                references.push(reference);
                factory.restore(state).map_err(|e| {
                    DispatchError::instance(format!(
                        "cannot restore {} from side-store: {}",
                        task.target, e
                    ))
                })?
            }
            InstanceSource::Construct(instance_args) => factory
                .construct(&instance_args)
                .map_err(|e| target_failure(&task.target, "construct", e))?,
        };

        if !factory.has_method(&task.method) {
            return Err(DispatchError::method_does_not_exist(
                &task.target,
                &task.method,
            ));
        }

        target
            .invoke(&task.method, rehydrated.args)
            .await
            .map_err(|e| target_failure(&task.target, &task.method, e))?;
        Ok(references)
    }
}

fn target_failure(target: &str, method: &str, error: TargetError) -> DispatchError {
    match error {
        TargetError::Known(message) => DispatchError::known(message),
        TargetError::Failed(e) => DispatchError::invocation(target, method, format!("{:#}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MokaCacheService;
    use crate::messaging::providers::InMemoryBroker;
    use crate::messaging::{OutgoingMessage, RetryMetadata, RetryMode, RetryPolicy};
    use crate::registry::TaskTarget;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize)]
    struct Echo {
        prefix: String,
    }

    #[async_trait]
    impl TaskTarget for Echo {
        const TYPE_NAME: &'static str = "Echo";
        const METHODS: &'static [&'static str] = &["say", "refuse", "crash"];

        fn construct(instance_args: &[Value]) -> std::result::Result<Self, TargetError> {
            Ok(Self {
                prefix: instance_args
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
            })
        }

        async fn call(&mut self, method: &str, _args: Vec<Value>) -> std::result::Result<(), TargetError> {
            match method {
                "say" => Ok(()),
                "refuse" => Err(TargetError::known("refused")),
                _ => Err(TargetError::failed("crashed")),
            }
        }
    }

    fn consumer(broker: &InMemoryBroker) -> Consumer<InMemoryBroker, MokaCacheService> {
        let cache = Arc::new(MokaCacheService::new(100, Duration::from_secs(60)));
        let registry = TargetRegistry::new();
        registry.register::<Echo>();
        Consumer::new(
            broker.clone(),
            TaskCodec::with_defaults(cache).unwrap(),
            registry,
            RetryController::default(),
        )
    }

    async fn deliver(
        broker: &InMemoryBroker,
        body: Value,
        metadata: RetryMetadata,
    ) -> (crate::messaging::providers::InMemorySession, Delivery) {
        let session = broker.connect().await.unwrap();
        let route = ensure_main_route(&session, "jobs").await.unwrap();
        session
            .publish(
                &route.exchange,
                OutgoingMessage::new(serde_json::to_vec(&body).unwrap(), metadata),
            )
            .await
            .unwrap();
        let mut stream = session.consume("jobs", "test").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        (session, delivery)
    }

    fn ttl_metadata(max_retries: i64) -> RetryMetadata {
        RetryPolicy::new(RetryMode::Ttl, max_retries, -1).metadata_for_new_task(1)
    }

    #[tokio::test]
    async fn test_success_is_acked() {
        let broker = InMemoryBroker::new();
        let consumer = consumer(&broker);
        let (session, delivery) = deliver(
            &broker,
            json!({"class": "Echo", "method": "say", "args": ["hi"]}),
            ttl_metadata(1),
        )
        .await;

        let outcome = consumer
            .handle_delivery(&session, "jobs", &delivery)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::AckedSuccess);
        assert_eq!(broker.unacked_count("jobs"), 0);
        assert_eq!(broker.queue_depth("jobs"), 0);
    }

    #[tokio::test]
    async fn test_terminal_failures_are_dropped() {
        let broker = InMemoryBroker::new();
        let consumer = consumer(&broker);

        for body in [
            json!({"class": "Echo", "method": "missing"}),
            json!({"class": "Echo", "method": "refuse"}),
            json!({"method": "say"}),
        ] {
            let (session, delivery) = deliver(&broker, body, ttl_metadata(5)).await;
            let outcome = consumer
                .handle_delivery(&session, "jobs", &delivery)
                .await
                .unwrap();
            assert_eq!(outcome, Outcome::AckedTerminalFailure);
        }
        assert!(broker.queue_arguments("jobs.ttl_3").is_none());
    }

    #[tokio::test]
    async fn test_unregistered_type_is_retried() {
        let broker = InMemoryBroker::new();
        let consumer = consumer(&broker);
        let (session, delivery) = deliver(
            &broker,
            json!({"class": "Unknown", "method": "say"}),
            ttl_metadata(2),
        )
        .await;

        let outcome = consumer
            .handle_delivery(&session, "jobs", &delivery)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Rescheduled);
        assert_eq!(broker.queue_depth("jobs.ttl_3"), 1);
    }

    #[tokio::test]
    async fn test_dangling_instance_reference_is_retried() {
        let broker = InMemoryBroker::new();
        let consumer = consumer(&broker);
        let reference = format!("async.cache.1.{}", Uuid::new_v4().simple());
        let (session, delivery) = deliver(
            &broker,
            json!({"class": "Echo", "method": "say", "instance": reference}),
            ttl_metadata(2),
        )
        .await;

        let outcome = consumer
            .handle_delivery(&session, "jobs", &delivery)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Rescheduled);
    }

    #[tokio::test]
    async fn test_consume_until_shutdown_closes_session() {
        let broker = InMemoryBroker::new();
        let consumer = consumer(&broker);
        let (session, _) = deliver(
            &broker,
            json!({"class": "Echo", "method": "say"}),
            ttl_metadata(1),
        )
        .await;
        session.close().await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let worker = async {
            consumer
                .consume_until("jobs", async {
                    let _ = rx.await;
                })
                .await
        };
        let trigger = async {
            while broker.queue_depth("jobs") > 0 || broker.unacked_count("jobs") > 0 {
                tokio::task::yield_now().await;
            }
            let _ = tx.send(());
        };

        let (handled, ()) = tokio::join!(worker, trigger);
        assert_eq!(handled.unwrap(), 1);
        assert_eq!(broker.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_consume_fails_when_broker_is_down() {
        let broker = InMemoryBroker::new();
        broker.set_connect_failure(true);
        let err = consumer(&broker).consume("jobs").await.unwrap_err();
        assert!(matches!(err, DispatchError::ConnectionFailed { .. }));
    }
}
