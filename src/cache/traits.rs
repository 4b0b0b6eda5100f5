//! Side-store service trait

use super::errors::CacheResult;
use std::time::Duration;

/// Key-value operations the dispatcher and the worker need from a side-store
///
/// Values are opaque strings; the task codec stores JSON snapshots of live
/// objects under generated reference keys.
pub trait CacheService: Send + Sync {
    /// Get a value by key
    ///
    /// Returns `Ok(Some(value))` on hit, `Ok(None)` on miss or expiry.
    fn get(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = CacheResult<Option<String>>> + Send;

    /// Store a value with a TTL
    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl std::future::Future<Output = CacheResult<()>> + Send;

    /// Delete a key. Deleting a missing key succeeds.
    fn delete(&self, key: &str) -> impl std::future::Future<Output = CacheResult<()>> + Send;

    /// Check if the backend is reachable
    fn health_check(&self) -> impl std::future::Future<Output = CacheResult<bool>> + Send;

    /// Provider name for logging
    fn provider_name(&self) -> &'static str;

    /// Whether state is shared across processes
    ///
    /// An in-process store only works when the producer and the worker live
    /// in the same process.
    fn is_distributed(&self) -> bool {
        false
    }
}
