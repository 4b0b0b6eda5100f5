//! # Dispatcher
//!
//! Producer side: encodes calls, attaches retry metadata and publishes them
//! to `<queue>.direct`.
//!
//! Outside a transaction each call opens its own session, publishes one
//! message and closes the session. Inside a transaction, encoded messages
//! are held in a local buffer and published together on [`Dispatcher::commit`]
//! within a broker transaction, so either all of them reach the queue or
//! none do.

use tracing::{debug, error, warn};

use crate::cache::CacheService;
use crate::config::AsyncConfig;
use crate::constants::DEFAULT_QUEUE_NAME;
use crate::error::{DispatchError, Result};
use crate::logging::log_task_operation;
use crate::messaging::{
    ensure_main_route, BrokerError, BrokerSession, MessageBroker, OutgoingMessage, RetryPolicy,
};
use crate::task::{Arg, RunOptions, Target, TaskCodec};
use crate::worker::{system_clock, Clock};

struct OpenTransaction<S> {
    session: S,
    exchange: String,
    buffer: Vec<OutgoingMessage>,
}

impl<S: BrokerSession> OpenTransaction<S> {
    async fn flush(&mut self) -> std::result::Result<(), BrokerError> {
        for message in self.buffer.drain(..) {
            self.session.publish(&self.exchange, message).await?;
        }
        self.session.commit_transaction().await
    }
}

pub struct Dispatcher<B: MessageBroker, C> {
    broker: B,
    codec: TaskCodec<C>,
    queue_name: String,
    policy: RetryPolicy,
    clock: Clock,
    transaction: Option<OpenTransaction<B::Session>>,
}

impl<B: MessageBroker, C> std::fmt::Debug for Dispatcher<B, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("provider", &self.broker.provider_name())
            .field("queue_name", &self.queue_name)
            .field("policy", &self.policy)
            .field(
                "buffered",
                &self.transaction.as_ref().map_or(0, |tx| tx.buffer.len()),
            )
            .finish()
    }
}

impl<B: MessageBroker, C: CacheService> Dispatcher<B, C> {
    /// Dispatcher for the default queue with an unlimited TTL-mode policy
    pub fn new(broker: B, codec: TaskCodec<C>) -> Self {
        Self {
            broker,
            codec,
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            policy: RetryPolicy::default(),
            clock: system_clock(),
            transaction: None,
        }
    }

    pub fn from_config(broker: B, codec: TaskCodec<C>, config: &AsyncConfig) -> Self {
        let mut dispatcher = Self::new(broker, codec);
        dispatcher.queue_name = config.queue.name.clone();
        dispatcher.policy = config.retry.policy();
        dispatcher
    }

    /// Replace the clock that stamps `x-start`
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn set_queue_name(&mut self, queue_name: impl Into<String>) {
        self.queue_name = queue_name.into();
    }

    /// Bound retries by count; switches to TTL mode
    pub fn set_max_retries(&mut self, max_retries: i64) {
        self.policy.set_max_retries(max_retries);
    }

    /// Bound retries by seconds since publish; switches to REJECT mode
    pub fn set_max_duration(&mut self, max_duration: i64) {
        self.policy.set_max_duration(max_duration);
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn codec(&self) -> &TaskCodec<C> {
        &self.codec
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Messages waiting for [`Dispatcher::commit`]
    pub fn buffered(&self) -> usize {
        self.transaction.as_ref().map_or(0, |tx| tx.buffer.len())
    }

    /// Schedule `method` on `target`; `false` when the task could not be
    /// encoded or published
    pub async fn run(
        &mut self,
        target: impl Into<Target>,
        method: &str,
        args: Vec<Arg>,
        options: RunOptions,
    ) -> bool {
        let target = target.into();
        let type_name = target.type_name().to_string();

        match self.try_run(target, method, args, options).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    queue_name = %self.queue_name,
                    target_type = %type_name,
                    method = %method,
                    error_code = e.code(),
                    error = %e,
                    "Failed to dispatch task"
                );
                false
            }
        }
    }

    /// [`Dispatcher::run`] with the failure reason
    pub async fn try_run(
        &mut self,
        target: impl Into<Target>,
        method: &str,
        args: Vec<Arg>,
        options: RunOptions,
    ) -> Result<()> {
        let target = target.into();
        let type_name = target.type_name().to_string();

        let record = self.codec.encode(target, method, args, options).await?;
        let metadata = self.policy.metadata_for_new_task((self.clock)());
        let message = OutgoingMessage::new(record.to_body()?, metadata);

        if let Some(tx) = self.transaction.as_mut() {
            tx.buffer.push(message);
            debug!(
                queue_name = %self.queue_name,
                target_type = %type_name,
                method = %method,
                buffered = tx.buffer.len(),
                "Task buffered in transaction"
            );
            return Ok(());
        }

        let session = self.broker.connect().await?;
        let published = async {
            let route = ensure_main_route(&session, &self.queue_name).await?;
            session.publish(&route.exchange, message).await
        }
        .await;
        session.close_quietly().await;
        published?;

        log_task_operation(
            "publish",
            &self.queue_name,
            Some(&type_name),
            Some(method),
            "published",
            Some(&format!("retry_mode={}", metadata.mode)),
        );
        Ok(())
    }

    /// Start buffering tasks; an already open transaction is rolled back
    pub async fn begin_transaction(&mut self) -> Result<()> {
        if self.transaction.is_some() {
            warn!(
                queue_name = %self.queue_name,
                discarded = self.buffered(),
                "Transaction already open, rolling it back"
            );
            self.rollback().await;
        }

        let session = self.broker.connect().await?;
        let opened = async {
            let route = ensure_main_route(&session, &self.queue_name).await?;
            session.begin_transaction().await?;
            Ok::<_, BrokerError>(route)
        }
        .await;

        match opened {
            Ok(route) => {
                self.transaction = Some(OpenTransaction {
                    session,
                    exchange: route.exchange,
                    buffer: Vec::new(),
                });
                debug!(queue_name = %self.queue_name, "Transaction opened");
                Ok(())
            }
            Err(e) => {
                session.close_quietly().await;
                Err(e.into())
            }
        }
    }

    /// Publish every buffered task atomically; returns how many were sent
    ///
    /// The session is closed whether or not the commit succeeds.
    pub async fn commit(&mut self) -> Result<usize> {
        let Some(mut tx) = self.transaction.take() else {
            return Err(DispatchError::broker("commit called without an open transaction"));
        };

        let count = tx.buffer.len();
        let result = tx.flush().await;
        if result.is_err() {
            if let Err(e) = tx.session.rollback_transaction().await {
                debug!(error = %e, "Ignoring rollback failure after failed commit");
            }
        }
        tx.session.close_quietly().await;

        match result {
            Ok(()) => {
                log_task_operation(
                    "commit",
                    &self.queue_name,
                    None,
                    None,
                    "committed",
                    Some(&format!("messages={}", count)),
                );
                Ok(count)
            }
            Err(e) => {
                log_task_operation(
                    "commit",
                    &self.queue_name,
                    None,
                    None,
                    "failed",
                    Some(&e.to_string()),
                );
                Err(e.into())
            }
        }
    }

    /// Discard buffered tasks; returns how many were dropped
    pub async fn rollback(&mut self) -> usize {
        let Some(tx) = self.transaction.take() else {
            return 0;
        };

        let discarded = tx.buffer.len();
        if let Err(e) = tx.session.rollback_transaction().await {
            warn!(queue_name = %self.queue_name, error = %e, "Broker rollback failed");
        }
        tx.session.close_quietly().await;

        log_task_operation(
            "rollback",
            &self.queue_name,
            None,
            None,
            "rolled_back",
            Some(&format!("messages={}", discarded)),
        );
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MokaCacheService;
    use crate::messaging::providers::InMemoryBroker;
    use crate::messaging::RetryMode;
    use std::sync::Arc;
    use std::time::Duration;

    fn dispatcher(broker: &InMemoryBroker) -> Dispatcher<InMemoryBroker, MokaCacheService> {
        let cache = Arc::new(MokaCacheService::new(100, Duration::from_secs(60)));
        Dispatcher::new(broker.clone(), TaskCodec::with_defaults(cache).unwrap())
            .with_clock(Arc::new(|| 1_700_000_000))
    }

    #[tokio::test]
    async fn test_run_publishes_one_message() {
        let broker = InMemoryBroker::new();
        let mut dispatcher = dispatcher(&broker);

        assert!(
            dispatcher
                .run("Mailer", "send", vec![Arg::from("a@example.com")], RunOptions::new())
                .await
        );

        let messages = broker.messages("async");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].metadata.retries, 0);
        assert_eq!(messages[0].metadata.start, 1_700_000_000);
        assert_eq!(messages[0].metadata.mode, RetryMode::Ttl);
        assert!(broker.is_bound("async", "async.direct"));
        assert_eq!(broker.open_sessions(), 0);

        let body: serde_json::Value = serde_json::from_slice(&messages[0].body).unwrap();
        assert_eq!(body["class"], "Mailer");
        assert_eq!(body["args"][0], "a@example.com");
    }

    #[tokio::test]
    async fn test_policy_limits_travel_with_the_message() {
        let broker = InMemoryBroker::new();
        let mut dispatcher = dispatcher(&broker);
        dispatcher.set_queue_name("mail");

        dispatcher.set_max_duration(60);
        dispatcher.try_run("Mailer", "send", vec![], RunOptions::new()).await.unwrap();
        dispatcher.set_max_retries(4);
        dispatcher.try_run("Mailer", "send", vec![], RunOptions::new()).await.unwrap();

        let messages = broker.messages("mail");
        assert_eq!(messages[0].metadata.mode, RetryMode::Reject);
        assert_eq!(messages[0].metadata.max_duration, 60);
        assert_eq!(messages[1].metadata.mode, RetryMode::Ttl);
        assert_eq!(messages[1].metadata.max_retries, 4);
    }

    #[tokio::test]
    async fn test_run_returns_false_when_broker_is_down() {
        let broker = InMemoryBroker::new();
        broker.set_connect_failure(true);
        let mut dispatcher = dispatcher(&broker);

        assert!(!dispatcher.run("Mailer", "send", vec![], RunOptions::new()).await);
        let err = dispatcher
            .try_run("Mailer", "send", vec![], RunOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ConnectionFailed { .. }));
    }

    #[tokio::test]
    async fn test_publish_failure_closes_session() {
        let broker = InMemoryBroker::new();
        broker.set_publish_failure(true);
        let mut dispatcher = dispatcher(&broker);

        assert!(!dispatcher.run("Mailer", "send", vec![], RunOptions::new()).await);
        assert_eq!(broker.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_transaction_publishes_on_commit_only() {
        let broker = InMemoryBroker::new();
        let mut dispatcher = dispatcher(&broker);

        dispatcher.begin_transaction().await.unwrap();
        for n in 0i64..3 {
            assert!(dispatcher.run("Counter", "add", vec![Arg::from(n)], RunOptions::new()).await);
        }
        assert!(dispatcher.in_transaction());
        assert_eq!(dispatcher.buffered(), 3);
        assert_eq!(broker.queue_depth("async"), 0);

        assert_eq!(dispatcher.commit().await.unwrap(), 3);
        assert_eq!(broker.queue_depth("async"), 3);
        assert!(!dispatcher.in_transaction());
        assert_eq!(broker.open_sessions(), 0);

        let order: Vec<i64> = broker
            .messages("async")
            .iter()
            .map(|m| {
                let body: serde_json::Value = serde_json::from_slice(&m.body).unwrap();
                body["args"][0].as_i64().unwrap()
            })
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_rollback_discards_buffer() {
        let broker = InMemoryBroker::new();
        let mut dispatcher = dispatcher(&broker);

        dispatcher.begin_transaction().await.unwrap();
        dispatcher.run("Counter", "add", vec![], RunOptions::new()).await;
        dispatcher.run("Counter", "add", vec![], RunOptions::new()).await;

        assert_eq!(dispatcher.rollback().await, 2);
        assert_eq!(dispatcher.buffered(), 0);
        assert_eq!(broker.queue_depth("async"), 0);
        assert_eq!(broker.open_sessions(), 0);
        assert_eq!(dispatcher.rollback().await, 0);
    }

    #[tokio::test]
    async fn test_commit_failure_publishes_nothing() {
        let broker = InMemoryBroker::new();
        let mut dispatcher = dispatcher(&broker);

        dispatcher.begin_transaction().await.unwrap();
        dispatcher.run("Counter", "add", vec![], RunOptions::new()).await;
        dispatcher.run("Counter", "add", vec![], RunOptions::new()).await;
        broker.set_publish_failure(true);

        assert!(dispatcher.commit().await.is_err());
        assert_eq!(broker.queue_depth("async"), 0);
        assert!(!dispatcher.in_transaction());
        assert_eq!(broker.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_commit_without_transaction_fails() {
        let broker = InMemoryBroker::new();
        let mut dispatcher = dispatcher(&broker);
        assert!(dispatcher.commit().await.is_err());
    }

    #[tokio::test]
    async fn test_begin_twice_discards_first_buffer() {
        let broker = InMemoryBroker::new();
        let mut dispatcher = dispatcher(&broker);

        dispatcher.begin_transaction().await.unwrap();
        dispatcher.run("Counter", "add", vec![], RunOptions::new()).await;
        dispatcher.begin_transaction().await.unwrap();
        assert_eq!(dispatcher.buffered(), 0);
        dispatcher.run("Counter", "add", vec![], RunOptions::new()).await;

        assert_eq!(dispatcher.commit().await.unwrap(), 1);
        assert_eq!(broker.queue_depth("async"), 1);
        assert_eq!(broker.open_sessions(), 0);
    }
}
