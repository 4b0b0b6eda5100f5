//! # Broker Value Types
//!
//! Typed retry metadata and the message/delivery envelopes exchanged with a
//! [`BrokerSession`](super::BrokerSession). The `x-*` header names from
//! [`crate::constants::headers`] appear only in the conversions in this file.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{headers, UNLIMITED};

/// Integer message headers as they cross the broker boundary
pub type MessageHeaders = BTreeMap<String, i64>;

/// Retry strategy applied by the worker when a delivery fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryMode {
    /// Ack, then republish through a delay queue. Bounded by attempt count.
    #[default]
    Ttl,
    /// Pause, then reject with requeue. Bounded by elapsed time.
    Reject,
}

impl RetryMode {
    /// Wire value of the `x-retry-mode` header
    pub fn header_value(self) -> i64 {
        match self {
            Self::Ttl => 1,
            Self::Reject => 2,
        }
    }

    /// Anything other than `1` selects REJECT
    pub fn from_header_value(value: i64) -> Self {
        if value == 1 {
            Self::Ttl
        } else {
            Self::Reject
        }
    }
}

impl fmt::Display for RetryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ttl => write!(f, "ttl"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

/// Producer-side retry configuration
///
/// Exactly one limit is meaningful at a time: setting a limit switches the
/// mode to the one that enforces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    mode: RetryMode,
    max_retries: i64,
    max_duration: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryMode::Ttl, UNLIMITED, UNLIMITED)
    }
}

impl RetryPolicy {
    pub fn new(mode: RetryMode, max_retries: i64, max_duration: i64) -> Self {
        Self {
            mode,
            max_retries,
            max_duration,
        }
    }

    pub fn mode(&self) -> RetryMode {
        self.mode
    }

    pub fn max_retries(&self) -> i64 {
        self.max_retries
    }

    pub fn max_duration(&self) -> i64 {
        self.max_duration
    }

    /// Bound retries by count; forces TTL mode
    pub fn set_max_retries(&mut self, max_retries: i64) {
        self.mode = RetryMode::Ttl;
        self.max_retries = max_retries;
    }

    /// Bound retries by seconds since first publish; forces REJECT mode
    pub fn set_max_duration(&mut self, max_duration: i64) {
        self.mode = RetryMode::Reject;
        self.max_duration = max_duration;
    }

    /// Metadata for a task published at `now` (unix seconds)
    pub fn metadata_for_new_task(&self, now: i64) -> RetryMetadata {
        RetryMetadata {
            start: now,
            retries: 0,
            max_retries: self.max_retries,
            max_duration: self.max_duration,
            mode: self.mode,
        }
    }
}

/// Retry state carried alongside a task body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryMetadata {
    /// Unix seconds of the first publish; 0 when unknown
    pub start: i64,
    /// Redeliveries so far; 0 on the first delivery
    pub retries: i64,
    pub max_retries: i64,
    pub max_duration: i64,
    pub mode: RetryMode,
}

impl Default for RetryMetadata {
    fn default() -> Self {
        RetryPolicy::default().metadata_for_new_task(0)
    }
}

impl RetryMetadata {
    /// Copy with the retry counter advanced
    pub fn next_attempt(&self) -> Self {
        Self {
            retries: self.retries.saturating_add(1),
            ..*self
        }
    }

    /// TTL bound: non-positive limits never exhaust
    pub fn retries_exhausted(&self) -> bool {
        self.max_retries > 0 && self.retries >= self.max_retries
    }

    /// End of the REJECT-mode budget, if both ends are known and representable
    pub fn deadline(&self) -> Option<i64> {
        if self.start <= 0 || self.max_duration <= 0 {
            return None;
        }
        self.start.checked_add(self.max_duration)
    }

    /// REJECT bound at `now` (unix seconds)
    pub fn duration_exhausted(&self, now: i64) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    pub fn to_headers(&self) -> MessageHeaders {
        let mut map = MessageHeaders::new();
        map.insert(headers::START.to_string(), self.start);
        map.insert(headers::RETRIES.to_string(), self.retries);
        map.insert(headers::MAX_RETRIES.to_string(), self.max_retries);
        map.insert(headers::MAX_DURATION.to_string(), self.max_duration);
        map.insert(headers::RETRY_MODE.to_string(), self.mode.header_value());
        map
    }

    /// Missing headers fall back to a first TTL delivery with no limits
    pub fn from_headers(map: &MessageHeaders) -> Self {
        let get = |name: &str, default: i64| map.get(name).copied().unwrap_or(default);

        Self {
            start: get(headers::START, 0),
            retries: get(headers::RETRIES, 0),
            max_retries: get(headers::MAX_RETRIES, UNLIMITED),
            max_duration: get(headers::MAX_DURATION, UNLIMITED),
            mode: map
                .get(headers::RETRY_MODE)
                .copied()
                .map(RetryMode::from_header_value)
                .unwrap_or_default(),
        }
    }
}

/// A task body ready to publish
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub metadata: RetryMetadata,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<Vec<u8>>, metadata: RetryMetadata) -> Self {
        Self {
            body: body.into(),
            metadata,
        }
    }
}

/// A message handed to a consumer, owned by it until ack or reject
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub metadata: RetryMetadata,
    /// Set when the broker delivered this message before without an ack
    pub redelivered: bool,
    /// Times the message passed through a dead-letter exchange
    pub dead_letter_count: u32,
}

/// Optional queue arguments used by delay routes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    /// `x-message-ttl` in milliseconds
    pub message_ttl_ms: Option<u64>,
    /// `x-dead-letter-exchange`
    pub dead_letter_exchange: Option<String>,
}

impl QueueArguments {
    /// Plain durable queue
    pub fn durable() -> Self {
        Self::default()
    }

    /// Queue whose messages expire after `ttl_seconds` into `dead_letter_exchange`
    pub fn delayed(ttl_seconds: u64, dead_letter_exchange: impl Into<String>) -> Self {
        Self {
            message_ttl_ms: Some(ttl_seconds * 1000),
            dead_letter_exchange: Some(dead_letter_exchange.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setting_a_limit_switches_mode() {
        let mut policy = RetryPolicy::default();
        assert_eq!(policy.mode(), RetryMode::Ttl);

        policy.set_max_duration(600);
        assert_eq!(policy.mode(), RetryMode::Reject);
        assert_eq!(policy.max_duration(), 600);

        policy.set_max_retries(3);
        assert_eq!(policy.mode(), RetryMode::Ttl);
        assert_eq!(policy.max_retries(), 3);
        // The other limit is kept but ignored in this mode
        assert_eq!(policy.max_duration(), 600);
    }

    #[test]
    fn test_headers_roundtrip() {
        let mut policy = RetryPolicy::default();
        policy.set_max_duration(120);
        let metadata = policy.metadata_for_new_task(1_700_000_000).next_attempt();

        let headers = metadata.to_headers();
        assert_eq!(headers["x-retry-mode"], 2);
        assert_eq!(headers["x-retries"], 1);
        assert_eq!(RetryMetadata::from_headers(&headers), metadata);
    }

    #[test]
    fn test_missing_headers_default_to_first_ttl_delivery() {
        let metadata = RetryMetadata::from_headers(&MessageHeaders::new());
        assert_eq!(metadata.mode, RetryMode::Ttl);
        assert_eq!(metadata.retries, 0);
        assert_eq!(metadata.max_retries, UNLIMITED);
        assert!(!metadata.retries_exhausted());
        assert_eq!(metadata.deadline(), None);
    }

    #[test]
    fn test_unknown_mode_value_selects_reject() {
        assert_eq!(RetryMode::from_header_value(1), RetryMode::Ttl);
        assert_eq!(RetryMode::from_header_value(2), RetryMode::Reject);
        assert_eq!(RetryMode::from_header_value(7), RetryMode::Reject);
    }

    #[test]
    fn test_retry_bound() {
        let mut metadata = RetryPolicy::new(RetryMode::Ttl, 2, UNLIMITED).metadata_for_new_task(1);
        assert!(!metadata.retries_exhausted());
        metadata = metadata.next_attempt();
        assert!(!metadata.retries_exhausted());
        metadata = metadata.next_attempt();
        assert!(metadata.retries_exhausted());
    }

    #[test]
    fn test_zero_or_negative_limits_are_unlimited() {
        let metadata = RetryMetadata {
            retries: 1_000,
            max_retries: 0,
            ..RetryMetadata::default()
        };
        assert!(!metadata.retries_exhausted());

        let metadata = RetryMetadata {
            start: 100,
            max_duration: UNLIMITED,
            mode: RetryMode::Reject,
            ..RetryMetadata::default()
        };
        assert!(!metadata.duration_exhausted(i64::MAX));

        let metadata = RetryMetadata {
            start: 1_700_000_000,
            max_duration: i64::MAX,
            mode: RetryMode::Reject,
            ..RetryMetadata::default()
        };
        assert_eq!(metadata.deadline(), None);
        assert!(!metadata.duration_exhausted(1_700_000_001));
        assert!(!metadata.duration_exhausted(i64::MAX));
    }

    #[test]
    fn test_duration_bound_is_inclusive() {
        let metadata = RetryMetadata {
            start: 1_000,
            max_duration: 30,
            mode: RetryMode::Reject,
            ..RetryMetadata::default()
        };
        assert_eq!(metadata.deadline(), Some(1_030));
        assert!(!metadata.duration_exhausted(1_029));
        assert!(metadata.duration_exhausted(1_030));
    }

    #[test]
    fn test_delayed_queue_arguments() {
        let args = QueueArguments::delayed(3, "async.direct");
        assert_eq!(args.message_ttl_ms, Some(3_000));
        assert_eq!(args.dead_letter_exchange.as_deref(), Some("async.direct"));
        assert_eq!(QueueArguments::durable(), QueueArguments::default());
    }

    #[test]
    fn test_retry_mode_serde_is_lowercase() {
        assert_eq!(serde_json::to_string(&RetryMode::Reject).unwrap(), "\"reject\"");
        let mode: RetryMode = serde_json::from_str("\"ttl\"").unwrap();
        assert_eq!(mode, RetryMode::Ttl);
    }
}
