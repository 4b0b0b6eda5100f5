//! Shared fixtures for integration tests: task targets, a paused-time clock
//! and a harness wiring a dispatcher and a consumer to one in-memory broker
//! and one side-store.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tasker_async::cache::{CacheProvider, CacheService};
use tasker_async::messaging::providers::{InMemoryBroker, InMemorySession};
use tasker_async::messaging::{ensure_main_route, BrokerSession, Delivery, DeliveryStream, MessageBroker};
use tasker_async::task::TaskCodec;
use tasker_async::worker::Clock;
use tasker_async::{Consumer, Dispatcher, Outcome, RetryController, TargetError, TargetRegistry, TaskTarget};

pub const QUEUE: &str = "async";

/// Unix time the test clock starts at
pub const BASE_TIME: i64 = 1_700_000_000;

/// Attempts per address seen by [`Mailer::send`]
fn attempts() -> &'static DashMap<String, u32> {
    static ATTEMPTS: OnceLock<DashMap<String, u32>> = OnceLock::new();
    ATTEMPTS.get_or_init(DashMap::new)
}

/// Successful sends per address, with the sender and attachment that were used
fn outbox() -> &'static DashMap<String, Vec<(String, Value)>> {
    static OUTBOX: OnceLock<DashMap<String, Vec<(String, Value)>>> = OnceLock::new();
    OUTBOX.get_or_init(DashMap::new)
}

pub fn attempts_for(address: &str) -> u32 {
    attempts().get(address).map(|n| *n).unwrap_or(0)
}

pub fn sent_to(address: &str) -> Vec<(String, Value)> {
    outbox().get(address).map(|v| v.clone()).unwrap_or_default()
}

/// Fails the first `send` to every address, succeeds afterwards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mailer {
    pub sender: String,
}

#[async_trait]
impl TaskTarget for Mailer {
    const TYPE_NAME: &'static str = "Mailer";
    const METHODS: &'static [&'static str] = &["send"];

    fn construct(instance_args: &[Value]) -> Result<Self, TargetError> {
        let sender = instance_args
            .first()
            .and_then(Value::as_str)
            .unwrap_or("noreply@example.com")
            .to_string();
        Ok(Self { sender })
    }

    async fn call(&mut self, method: &str, args: Vec<Value>) -> Result<(), TargetError> {
        if method != "send" {
            return Err(TargetError::known(format!("unsupported method {}", method)));
        }
        let address = args
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| TargetError::known("missing address"))?
            .to_string();

        let attempt = {
            let mut entry = attempts().entry(address.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        if attempt == 1 {
            return Err(TargetError::failed("smtp unavailable"));
        }

        let attachment = args.get(1).cloned().unwrap_or(Value::Null);
        outbox()
            .entry(address)
            .or_default()
            .push((self.sender.clone(), attachment));
        Ok(())
    }
}

/// Fails every invocation with a retryable error
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AlwaysFails;

#[async_trait]
impl TaskTarget for AlwaysFails {
    const TYPE_NAME: &'static str = "AlwaysFails";
    const METHODS: &'static [&'static str] = &["run", "refuse"];

    fn construct(_instance_args: &[Value]) -> Result<Self, TargetError> {
        Ok(Self)
    }

    async fn call(&mut self, method: &str, _args: Vec<Value>) -> Result<(), TargetError> {
        match method {
            "refuse" => Err(TargetError::known("refused")),
            _ => Err(TargetError::failed("still broken")),
        }
    }
}

static PONGS: AtomicU32 = AtomicU32::new(0);

pub fn pongs() -> u32 {
    PONGS.load(Ordering::SeqCst)
}

/// Fieldless target; its snapshot is `{}`
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Ping {}

#[async_trait]
impl TaskTarget for Ping {
    const TYPE_NAME: &'static str = "Ping";
    const METHODS: &'static [&'static str] = &["pong"];

    fn construct(_instance_args: &[Value]) -> Result<Self, TargetError> {
        Ok(Self {})
    }

    async fn call(&mut self, _method: &str, _args: Vec<Value>) -> Result<(), TargetError> {
        PONGS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Clock driven by tokio time, so paused tests control it with `advance`
pub fn tokio_clock() -> Clock {
    let origin = tokio::time::Instant::now();
    Arc::new(move || BASE_TIME + origin.elapsed().as_secs() as i64)
}

pub fn registry() -> TargetRegistry {
    let registry = TargetRegistry::new();
    registry
        .register::<Mailer>()
        .register::<AlwaysFails>()
        .register::<Ping>();
    registry
}

pub struct Harness {
    pub broker: InMemoryBroker,
    pub cache: Arc<CacheProvider>,
    pub dispatcher: Dispatcher<InMemoryBroker, CacheProvider>,
    pub consumer: Consumer<InMemoryBroker, CacheProvider>,
    pub clock: Clock,
}

impl Harness {
    pub fn new() -> Self {
        let broker = InMemoryBroker::new();
        let cache = Arc::new(CacheProvider::in_memory(1_000, Duration::from_secs(86_400)));
        let clock = tokio_clock();

        let dispatcher = Dispatcher::new(
            broker.clone(),
            TaskCodec::with_defaults(Arc::clone(&cache)).unwrap(),
        )
        .with_clock(Arc::clone(&clock));
        let consumer = Consumer::new(
            broker.clone(),
            TaskCodec::with_defaults(Arc::clone(&cache)).unwrap(),
            registry(),
            RetryController::default(),
        )
        .with_clock(Arc::clone(&clock));

        Self {
            broker,
            cache,
            dispatcher,
            consumer,
            clock,
        }
    }

    /// A worker session consuming the main queue with prefetch 1
    pub async fn worker(&self) -> Worker {
        let session = self.broker.connect().await.unwrap();
        ensure_main_route(&session, QUEUE).await.unwrap();
        session.set_prefetch(1).await.unwrap();
        let stream = session.consume(QUEUE, "test-worker").await.unwrap();
        Worker { session, stream }
    }

    pub async fn cached(&self, key: &str) -> Option<String> {
        self.cache.get(key).await.unwrap()
    }
}

pub struct Worker {
    pub session: InMemorySession,
    pub stream: DeliveryStream,
}

impl Worker {
    /// Next delivery, or `None` if nothing arrives within `wait`
    pub async fn next(&mut self, wait: Duration) -> Option<Delivery> {
        match tokio::time::timeout(wait, self.stream.next()).await {
            Ok(Some(delivery)) => Some(delivery.unwrap()),
            _ => None,
        }
    }

    /// Receive and handle deliveries until one is not rescheduled
    pub async fn drain(&mut self, harness: &Harness) -> Vec<(Delivery, Outcome)> {
        let mut handled = Vec::new();
        while let Some(delivery) = self.next(Duration::from_secs(60)).await {
            let outcome = harness
                .consumer
                .handle_delivery(&self.session, QUEUE, &delivery)
                .await
                .unwrap();
            handled.push((delivery, outcome));
            if !outcome.is_rescheduled() {
                break;
            }
        }
        handled
    }
}
