//! # Retry Controller
//!
//! Classifies a failed delivery and settles it with the broker.
//!
//! | failure              | mode   | bound reached | action                              |
//! |----------------------|--------|---------------|-------------------------------------|
//! | params/method/known  | any    | -             | ack, drop                           |
//! | anything else        | TTL    | no            | ack, republish to the delay route   |
//! | anything else        | TTL    | yes           | ack, drop                           |
//! | anything else        | REJECT | no            | pause, reject with requeue          |
//! | anything else        | REJECT | yes           | ack, drop                           |
//!
//! Deciding is pure ([`RetryController::decide`]); applying the decision is
//! the only part that touches the broker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::config::RetryConfig;
use crate::constants::{DEFAULT_REJECT_PAUSE_SECONDS, DEFAULT_RETRY_DELAY_SECONDS};
use crate::error::DispatchError;
use crate::messaging::{
    ensure_delay_route, BrokerResult, BrokerSession, Delivery, OutgoingMessage, RetryMetadata,
    RetryMode,
};

/// Source of the current unix time in seconds
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Wall clock
pub fn system_clock() -> Clock {
    Arc::new(|| Utc::now().timestamp())
}

/// How a delivery left the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    AckedSuccess,
    AckedTerminalFailure,
    Rescheduled,
    AckedExhausted,
}

impl Outcome {
    /// Whether the broker will deliver the task again
    pub fn is_rescheduled(self) -> bool {
        matches!(self, Self::Rescheduled)
    }
}

/// What to do with a failed delivery
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Terminal failure class
    Drop,
    /// Retry budget spent
    Exhausted,
    /// TTL mode: publish again through the delay route
    Republish {
        metadata: RetryMetadata,
        delay_seconds: u64,
    },
    /// REJECT mode: hand the delivery back after a pause
    Requeue { pause: Duration },
}

#[derive(Debug, Clone)]
pub struct RetryController {
    retry_delay_seconds: u64,
    reject_pause: Duration,
}

impl Default for RetryController {
    fn default() -> Self {
        Self::new(
            DEFAULT_RETRY_DELAY_SECONDS,
            Duration::from_secs(DEFAULT_REJECT_PAUSE_SECONDS),
        )
    }
}

impl RetryController {
    pub fn new(retry_delay_seconds: u64, reject_pause: Duration) -> Self {
        Self {
            retry_delay_seconds,
            reject_pause,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.retry_delay_seconds,
            Duration::from_secs(config.reject_pause_seconds),
        )
    }

    pub fn retry_delay_seconds(&self) -> u64 {
        self.retry_delay_seconds
    }

    pub fn reject_pause(&self) -> Duration {
        self.reject_pause
    }

    pub fn decide(&self, metadata: &RetryMetadata, error: &DispatchError, now: i64) -> RetryDecision {
        if error.is_terminal() {
            return RetryDecision::Drop;
        }

        match metadata.mode {
            RetryMode::Ttl if metadata.retries_exhausted() => RetryDecision::Exhausted,
            RetryMode::Ttl => RetryDecision::Republish {
                metadata: metadata.next_attempt(),
                delay_seconds: self.retry_delay_seconds,
            },
            RetryMode::Reject if metadata.duration_exhausted(now) => RetryDecision::Exhausted,
            RetryMode::Reject => RetryDecision::Requeue {
                pause: self.reject_pause,
            },
        }
    }

    /// Settle `delivery` according to `decision`
    ///
    /// TTL retries acknowledge before republishing so the failed delivery
    /// never blocks the main queue.
    pub async fn apply<S>(
        &self,
        session: &S,
        queue_name: &str,
        delivery: &Delivery,
        decision: RetryDecision,
    ) -> BrokerResult<Outcome>
    where
        S: BrokerSession + ?Sized,
    {
        match decision {
            RetryDecision::Drop => {
                session.ack(delivery.delivery_tag).await?;
                Ok(Outcome::AckedTerminalFailure)
            }
            RetryDecision::Exhausted => {
                session.ack(delivery.delivery_tag).await?;
                info!(
                    queue_name = %queue_name,
                    delivery_tag = delivery.delivery_tag,
                    retries = delivery.metadata.retries,
                    retry_mode = %delivery.metadata.mode,
                    "Retry budget exhausted, dropping task"
                );
                Ok(Outcome::AckedExhausted)
            }
            RetryDecision::Republish {
                metadata,
                delay_seconds,
            } => {
                session.ack(delivery.delivery_tag).await?;
                let route = ensure_delay_route(session, queue_name, delay_seconds).await?;
                session
                    .publish(
                        &route.exchange,
                        OutgoingMessage::new(delivery.body.clone(), metadata),
                    )
                    .await?;
                debug!(
                    queue_name = %queue_name,
                    delay_queue = %route.queue,
                    retries = metadata.retries,
                    "Task republished for delayed retry"
                );
                Ok(Outcome::Rescheduled)
            }
            RetryDecision::Requeue { pause } => {
                tokio::time::sleep(pause).await;
                session.reject(delivery.delivery_tag, true).await?;
                debug!(
                    queue_name = %queue_name,
                    delivery_tag = delivery.delivery_tag,
                    pause_ms = pause.as_millis() as u64,
                    "Task rejected for requeue"
                );
                Ok(Outcome::Rescheduled)
            }
        }
    }

    pub async fn handle<S>(
        &self,
        session: &S,
        queue_name: &str,
        delivery: &Delivery,
        error: &DispatchError,
        now: i64,
    ) -> BrokerResult<Outcome>
    where
        S: BrokerSession + ?Sized,
    {
        let decision = self.decide(&delivery.metadata, error, now);
        self.apply(session, queue_name, delivery, decision).await
    }
}
