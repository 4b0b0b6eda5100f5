//! # System Constants
//!
//! Defaults and wire-level names shared by the dispatcher, the worker and the
//! broker providers. Header names are only referenced at the transport
//! boundary; everything above it works with [`crate::messaging::RetryMetadata`].

/// Default queue name when none is configured
pub const DEFAULT_QUEUE_NAME: &str = "async";

/// Suffix appended to a queue name to form its direct exchange
pub const DIRECT_EXCHANGE_SUFFIX: &str = ".direct";

/// Delay applied to TTL-mode retries before redelivery
pub const DEFAULT_RETRY_DELAY_SECONDS: u64 = 3;

/// Worker pause before a REJECT-mode requeue
pub const DEFAULT_REJECT_PAUSE_SECONDS: u64 = 3;

/// Lifetime of side-store references created at encode time (24 hours)
pub const DEFAULT_REFERENCE_TTL_SECONDS: u64 = 24 * 3600;

/// Namespace prefix of generated side-store reference keys
pub const DEFAULT_KEY_NAMESPACE: &str = "async.cache";

/// Prefetch used by consumers: one unacknowledged task per worker
pub const CONSUMER_PREFETCH: u16 = 1;

/// Content type of every published task body
pub const TASK_CONTENT_TYPE: &str = "application/json";

/// Sentinel for "no limit" on retry counts and durations
pub const UNLIMITED: i64 = -1;

/// Message header names
pub mod headers {
    pub const START: &str = "x-start";
    pub const RETRIES: &str = "x-retries";
    pub const MAX_RETRIES: &str = "x-max-retries";
    pub const MAX_DURATION: &str = "x-max-duration";
    pub const RETRY_MODE: &str = "x-retry-mode";
    /// Dead-letter bookkeeping added by the broker; never republished
    pub const DEATH: &str = "x-death";
}
