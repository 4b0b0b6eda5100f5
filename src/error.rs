//! # Dispatch Error Taxonomy
//!
//! Every failure the dispatcher or the worker can observe is folded into
//! [`DispatchError`]. Subsystem errors ([`BrokerError`], [`CacheError`],
//! [`ConfigurationError`]) convert into it with `?`.
//!
//! The worker never surfaces these errors to a caller; it classifies them with
//! [`DispatchError::is_terminal`] and lets the retry controller decide what
//! happens to the delivery.

use thiserror::Error;

use crate::cache::CacheError;
use crate::config::ConfigurationError;
use crate::messaging::BrokerError;

/// Errors raised while encoding, publishing, decoding or invoking a task
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Broker connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Broker error: {message}")]
    Broker { message: String },

    #[error("Invalid task parameters: {message}")]
    Params { message: String },

    #[error("Method does not exist: {target}::{method}")]
    MethodDoesNotExist { target: String, method: String },

    #[error("Side-store unavailable: {message}")]
    Cache { message: String },

    #[error("Instance error: {message}")]
    Instance { message: String },

    #[error("Known error: {message}")]
    Known { message: String },

    #[error("Invocation of {target}::{method} failed: {message}")]
    Invocation {
        target: String,
        method: String,
        message: String,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl DispatchError {
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
        }
    }

    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker {
            message: message.into(),
        }
    }

    pub fn params(message: impl Into<String>) -> Self {
        Self::Params {
            message: message.into(),
        }
    }

    pub fn method_does_not_exist(target: impl Into<String>, method: impl Into<String>) -> Self {
        Self::MethodDoesNotExist {
            target: target.into(),
            method: method.into(),
        }
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    pub fn instance(message: impl Into<String>) -> Self {
        Self::Instance {
            message: message.into(),
        }
    }

    pub fn known(message: impl Into<String>) -> Self {
        Self::Known {
            message: message.into(),
        }
    }

    pub fn invocation(
        target: impl Into<String>,
        method: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Invocation {
            target: target.into(),
            method: method.into(),
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Stable numeric code, shared with producers written in other languages
    pub fn code(&self) -> u16 {
        match self {
            Self::ConnectionFailed { .. } => 4000,
            Self::Broker { .. } => 4001,
            Self::Params { .. } => 4002,
            Self::MethodDoesNotExist { .. } => 4003,
            Self::Cache { .. } => 4005,
            Self::Instance { .. } => 4006,
            Self::Known { .. } => 4007,
            Self::Invocation { .. } => 4008,
            Self::Configuration { .. } => 4009,
        }
    }

    /// Failures that are acknowledged and dropped without any retry
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Params { .. } | Self::MethodDoesNotExist { .. } | Self::Known { .. }
        )
    }

    /// Short kind label for structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionFailed { .. } => "connection_failed",
            Self::Broker { .. } => "broker",
            Self::Params { .. } => "params",
            Self::MethodDoesNotExist { .. } => "method_does_not_exist",
            Self::Cache { .. } => "cache",
            Self::Instance { .. } => "instance",
            Self::Known { .. } => "known",
            Self::Invocation { .. } => "invocation",
            Self::Configuration { .. } => "configuration",
        }
    }
}

impl From<BrokerError> for DispatchError {
    fn from(e: BrokerError) -> Self {
        if e.is_connection_error() {
            Self::connection_failed(e.to_string())
        } else {
            Self::broker(e.to_string())
        }
    }
}

impl From<CacheError> for DispatchError {
    fn from(e: CacheError) -> Self {
        Self::cache(e.to_string())
    }
}

impl From<ConfigurationError> for DispatchError {
    fn from(e: ConfigurationError) -> Self {
        Self::configuration(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        assert!(DispatchError::params("missing class").is_terminal());
        assert!(DispatchError::method_does_not_exist("Mailer", "nope").is_terminal());
        assert!(DispatchError::known("duplicate order").is_terminal());

        assert!(!DispatchError::connection_failed("refused").is_terminal());
        assert!(!DispatchError::broker("channel closed").is_terminal());
        assert!(!DispatchError::cache("memcached down").is_terminal());
        assert!(!DispatchError::instance("empty").is_terminal());
        assert!(!DispatchError::invocation("Mailer", "send", "smtp timeout").is_terminal());
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(DispatchError::connection_failed("x").code(), 4000);
        assert_eq!(DispatchError::broker("x").code(), 4001);
        assert_eq!(DispatchError::params("x").code(), 4002);
        assert_eq!(DispatchError::method_does_not_exist("a", "b").code(), 4003);
        assert_eq!(DispatchError::cache("x").code(), 4005);
        assert_eq!(DispatchError::instance("x").code(), 4006);
        assert_eq!(DispatchError::known("x").code(), 4007);
    }

    #[test]
    fn test_broker_error_conversion() {
        let err: DispatchError = BrokerError::connection("refused").into();
        assert!(matches!(err, DispatchError::ConnectionFailed { .. }));

        let err: DispatchError = BrokerError::publish("async.direct", "nack").into();
        assert!(matches!(err, DispatchError::Broker { .. }));
    }

    #[test]
    fn test_cache_error_conversion() {
        let err: DispatchError = CacheError::BackendError("SET failed".into()).into();
        assert_eq!(err.code(), 4005);
        assert!(err.to_string().contains("SET failed"));
    }
}
