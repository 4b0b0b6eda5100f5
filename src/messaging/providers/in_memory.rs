//! # In-Memory Broker
//!
//! Process-local broker for tests and local development.
//!
//! ## Features
//!
//! - **Durable direct exchanges and queues**: declare, bind, idempotent redeclare
//! - **Message TTL + dead-lettering**: expired messages are routed to the queue's
//!   dead-letter exchange with their dead-letter count incremented
//! - **Transactions**: publishes are buffered per session until commit
//! - **Prefetch**: a consumer holds at most `prefetch` unacknowledged deliveries
//! - **Requeue**: rejected or abandoned deliveries return to the head of the queue
//!
//! Expiry is measured with [`tokio::time::Instant`], so tests running with a
//! paused clock can drive delay routes with `tokio::time::advance`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::messaging::errors::{BrokerError, BrokerResult};
use crate::messaging::traits::{BrokerSession, DeliveryStream, MessageBroker};
use crate::messaging::types::{
    Delivery, MessageHeaders, OutgoingMessage, QueueArguments, RetryMetadata,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    headers: MessageHeaders,
    redelivered: bool,
    dead_letter_count: u32,
    expires_at: Option<Instant>,
}

impl StoredMessage {
    fn to_delivery(&self, delivery_tag: u64) -> Delivery {
        Delivery {
            delivery_tag,
            body: self.body.clone(),
            metadata: RetryMetadata::from_headers(&self.headers),
            redelivered: self.redelivered,
            dead_letter_count: self.dead_letter_count,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    arguments: QueueArguments,
    ready: VecDeque<StoredMessage>,
    unacked: usize,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    /// exchange -> bound queues
    bindings: HashMap<String, Vec<String>>,
    queues: HashMap<String, QueueState>,
    /// exchange -> messages accepted from publishers
    published: HashMap<String, u64>,
    fail_connect: bool,
    fail_publish: bool,
}

impl BrokerState {
    fn enqueue(&mut self, queue_name: &str, mut message: StoredMessage, now: Instant) {
        if let Some(queue) = self.queues.get_mut(queue_name) {
            message.expires_at = queue
                .arguments
                .message_ttl_ms
                .map(|ms| now + Duration::from_millis(ms));
            queue.ready.push_back(message);
        }
    }

    /// Route to every queue bound to `exchange`; unbound exchanges drop
    fn route(&mut self, exchange: &str, message: StoredMessage, now: Instant) {
        let targets = self.bindings.get(exchange).cloned().unwrap_or_default();
        for queue_name in targets {
            self.enqueue(&queue_name, message.clone(), now);
        }
    }

    /// Move expired queue heads to their dead-letter exchanges
    fn expire(&mut self, now: Instant) {
        let mut dead = Vec::new();
        for queue in self.queues.values_mut() {
            while queue
                .ready
                .front()
                .and_then(|m| m.expires_at)
                .is_some_and(|at| at <= now)
            {
                let Some(message) = queue.ready.pop_front() else {
                    break;
                };
                if let Some(dlx) = &queue.arguments.dead_letter_exchange {
                    dead.push((dlx.clone(), message));
                }
            }
        }

        for (exchange, mut message) in dead {
            message.dead_letter_count += 1;
            message.redelivered = false;
            self.route(&exchange, message, now);
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.queues
            .values()
            .filter_map(|q| q.ready.front().and_then(|m| m.expires_at))
            .min()
    }

    fn dead_letter_or_drop(&mut self, queue_name: &str, message: StoredMessage, now: Instant) {
        let dlx = self
            .queues
            .get(queue_name)
            .and_then(|q| q.arguments.dead_letter_exchange.clone());
        if let Some(exchange) = dlx {
            let mut message = message;
            message.dead_letter_count += 1;
            message.redelivered = false;
            self.route(&exchange, message, now);
        }
    }

    fn requeue(&mut self, queue_name: &str, mut message: StoredMessage) {
        if let Some(queue) = self.queues.get_mut(queue_name) {
            queue.unacked = queue.unacked.saturating_sub(1);
            message.redelivered = true;
            queue.ready.push_front(message);
        }
    }

    fn release(&mut self, queue_name: &str) {
        if let Some(queue) = self.queues.get_mut(queue_name) {
            queue.unacked = queue.unacked.saturating_sub(1);
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
    next_delivery_tag: AtomicU64,
    open_sessions: AtomicUsize,
}

/// Process-local broker; clones share the same exchanges and queues
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `connect` calls fail as if the broker were down
    pub fn set_connect_failure(&self, fail: bool) {
        self.shared.state.lock().fail_connect = fail;
    }

    /// Make subsequent publishes fail
    pub fn set_publish_failure(&self, fail: bool) {
        self.shared.state.lock().fail_publish = fail;
    }

    /// Ready (not yet delivered) messages in `queue`
    pub fn queue_depth(&self, queue: &str) -> usize {
        let mut state = self.shared.state.lock();
        state.expire(Instant::now());
        state.queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    /// Delivered but not yet acknowledged messages from `queue`
    pub fn unacked_count(&self, queue: &str) -> usize {
        let state = self.shared.state.lock();
        state.queues.get(queue).map(|q| q.unacked).unwrap_or(0)
    }

    /// Ready messages in `queue`, head first, with delivery tag 0
    pub fn messages(&self, queue: &str) -> Vec<Delivery> {
        let mut state = self.shared.state.lock();
        state.expire(Instant::now());
        state
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.to_delivery(0)).collect())
            .unwrap_or_default()
    }

    /// Messages publishers handed to `exchange` (committed ones only)
    pub fn published_count(&self, exchange: &str) -> u64 {
        let state = self.shared.state.lock();
        state.published.get(exchange).copied().unwrap_or(0)
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.shared.state.lock().exchanges.contains(name)
    }

    pub fn queue_arguments(&self, name: &str) -> Option<QueueArguments> {
        let state = self.shared.state.lock();
        state.queues.get(name).map(|q| q.arguments.clone())
    }

    pub fn is_bound(&self, queue: &str, exchange: &str) -> bool {
        let state = self.shared.state.lock();
        state
            .bindings
            .get(exchange)
            .is_some_and(|queues| queues.iter().any(|q| q == queue))
    }

    /// Sessions opened and not yet closed
    pub fn open_sessions(&self) -> usize {
        self.shared.open_sessions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    type Session = InMemorySession;

    async fn connect(&self) -> BrokerResult<Self::Session> {
        if self.shared.state.lock().fail_connect {
            return Err(BrokerError::connection("in-memory broker is unavailable"));
        }
        self.shared.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(InMemorySession {
            shared: Arc::clone(&self.shared),
            inner: Arc::new(Mutex::new(SessionState::default())),
        })
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}

#[derive(Debug, Default)]
struct SessionState {
    closed: bool,
    prefetch: u16,
    /// Publishes buffered while in transactional mode
    transaction: Option<Vec<(String, OutgoingMessage)>>,
    /// delivery tag -> (queue, message)
    unacked: HashMap<u64, (String, StoredMessage)>,
}

impl SessionState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }
}

/// Session on an [`InMemoryBroker`]
#[derive(Debug)]
pub struct InMemorySession {
    shared: Arc<Shared>,
    inner: Arc<Mutex<SessionState>>,
}

impl InMemorySession {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.inner.lock().closed {
            return Err(BrokerError::channel("session is closed"));
        }
        Ok(())
    }

    fn stored(message: OutgoingMessage) -> StoredMessage {
        StoredMessage {
            body: message.body,
            headers: message.metadata.to_headers(),
            redelivered: false,
            dead_letter_count: 0,
            expires_at: None,
        }
    }

    fn publish_now(&self, state: &mut BrokerState, exchange: &str, message: OutgoingMessage) {
        *state.published.entry(exchange.to_string()).or_default() += 1;
        state.route(exchange, Self::stored(message), Instant::now());
    }

    /// Requeue everything this session still holds; idempotent
    fn shutdown(&self) {
        let unacked = {
            let mut session = self.inner.lock();
            if session.closed {
                return;
            }
            session.closed = true;
            session.transaction = None;
            std::mem::take(&mut session.unacked)
        };

        {
            let mut state = self.shared.state.lock();
            for (_, (queue, message)) in unacked {
                state.requeue(&queue, message);
            }
        }
        self.shared.open_sessions.fetch_sub(1, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl BrokerSession for InMemorySession {
    async fn declare_exchange(&self, name: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        self.shared.state.lock().exchanges.insert(name.to_string());
        Ok(())
    }

    async fn declare_queue(&self, name: &str, arguments: &QueueArguments) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        match state.queues.get(name) {
            Some(existing) if existing.arguments != *arguments => Err(BrokerError::declaration(
                name,
                "PRECONDITION_FAILED - inequivalent queue arguments",
            )),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        arguments: arguments.clone(),
                        ..QueueState::default()
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::declaration(queue, "NOT_FOUND - no queue"));
        }
        if !state.exchanges.contains(exchange) {
            return Err(BrokerError::declaration(exchange, "NOT_FOUND - no exchange"));
        }
        let bound = state.bindings.entry(exchange.to_string()).or_default();
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, message: OutgoingMessage) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        if state.fail_publish {
            return Err(BrokerError::publish(exchange, "publish rejected by broker"));
        }
        if !state.exchanges.contains(exchange) {
            return Err(BrokerError::publish(exchange, "NOT_FOUND - no exchange"));
        }

        let mut session = self.inner.lock();
        if let Some(buffer) = session.transaction.as_mut() {
            buffer.push((exchange.to_string(), message));
            return Ok(());
        }
        drop(session);

        self.publish_now(&mut state, exchange, message);
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> BrokerResult<()> {
        self.ensure_open()?;
        self.inner.lock().prefetch = count;
        Ok(())
    }

    async fn begin_transaction(&self) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut session = self.inner.lock();
        if session.transaction.is_none() {
            session.transaction = Some(Vec::new());
        }
        Ok(())
    }

    async fn commit_transaction(&self) -> BrokerResult<()> {
        self.ensure_open()?;
        let buffered = {
            let mut session = self.inner.lock();
            match session.transaction.as_mut() {
                Some(buffer) => std::mem::take(buffer),
                None => {
                    return Err(BrokerError::transaction(
                        "PRECONDITION_FAILED - channel is not transactional",
                    ))
                }
            }
        };

        {
            let mut state = self.shared.state.lock();
            if let Some((exchange, _)) = buffered
                .iter()
                .find(|(exchange, _)| !state.exchanges.contains(exchange))
            {
                return Err(BrokerError::transaction(format!(
                    "NOT_FOUND - no exchange '{}'",
                    exchange
                )));
            }
            let count = buffered.len();
            for (exchange, message) in buffered {
                self.publish_now(&mut state, &exchange, message);
            }
            debug!(messages = count, "In-memory transaction committed");
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn rollback_transaction(&self) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut session = self.inner.lock();
        match session.transaction.as_mut() {
            Some(buffer) => {
                buffer.clear();
                Ok(())
            }
            None => Err(BrokerError::transaction(
                "PRECONDITION_FAILED - channel is not transactional",
            )),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream> {
        self.ensure_open()?;
        if !self.shared.state.lock().queues.contains_key(queue) {
            return Err(BrokerError::consume(queue, "NOT_FOUND - no queue"));
        }
        debug!(queue_name = %queue, consumer_tag = %consumer_tag, "In-memory consumer registered");

        let consumer = InMemoryConsumer {
            shared: Arc::clone(&self.shared),
            session: Arc::clone(&self.inner),
            queue: queue.to_string(),
        };

        let stream = futures::stream::unfold(consumer, |consumer| async move {
            match consumer.next_delivery().await {
                Some(delivery) => Some((Ok(delivery), consumer)),
                None => None,
            }
        });
        Ok(Box::pin(stream))
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        let entry = self.inner.lock().unacked.remove(&delivery_tag);
        let Some((queue, _)) = entry else {
            return Err(BrokerError::ack(delivery_tag, "unknown delivery tag"));
        };
        self.shared.state.lock().release(&queue);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        let entry = self.inner.lock().unacked.remove(&delivery_tag);
        let Some((queue, message)) = entry else {
            return Err(BrokerError::reject(delivery_tag, "unknown delivery tag"));
        };

        {
            let mut state = self.shared.state.lock();
            if requeue {
                state.requeue(&queue, message);
            } else {
                state.release(&queue);
                state.dead_letter_or_drop(&queue, message, Instant::now());
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        self.shutdown();
        Ok(())
    }
}

enum Step {
    Deliver(Delivery),
    Closed,
    Wait(Option<Instant>),
}

struct InMemoryConsumer {
    shared: Arc<Shared>,
    session: Arc<Mutex<SessionState>>,
    queue: String,
}

impl InMemoryConsumer {
    /// Wait for the next delivery; `None` once the session is closed
    async fn next_delivery(&self) -> Option<Delivery> {
        loop {
            let notified = self.shared.notify.notified();

            match self.try_take() {
                Step::Deliver(delivery) => return Some(delivery),
                Step::Closed => return None,
                Step::Wait(Some(at)) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                Step::Wait(None) => notified.await,
            }
        }
    }

    fn try_take(&self) -> Step {
        let mut state = self.shared.state.lock();
        state.expire(Instant::now());

        let mut session = self.session.lock();
        if session.closed {
            return Step::Closed;
        }

        if session.has_capacity() {
            if let Some(queue) = state.queues.get_mut(&self.queue) {
                if let Some(message) = queue.ready.pop_front() {
                    queue.unacked += 1;
                    let tag = self.shared.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1;
                    let delivery = message.to_delivery(tag);
                    session
                        .unacked
                        .insert(tag, (self.queue.clone(), message));
                    return Step::Deliver(delivery);
                }
            }
        }

        Step::Wait(state.next_expiry())
    }
}
