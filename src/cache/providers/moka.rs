//! In-process side-store using Moka
//!
//! Useful for tests and single-process deployments where the producer and
//! the worker share memory. It is NOT distributed: a worker in another process
//! will never see references written here.

use crate::cache::errors::CacheResult;
use crate::cache::traits::CacheService;
use crate::config::MokaConfig;
use std::time::Duration;
use tracing::debug;

/// In-memory side-store service
///
/// All entries share the TTL configured at construction time, which is the
/// reference lifetime for the whole deployment.
#[derive(Clone)]
pub struct MokaCacheService {
    cache: moka::future::Cache<String, String>,
    default_ttl: Duration,
}

impl std::fmt::Debug for MokaCacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaCacheService")
            .field("max_capacity", &self.cache.policy().max_capacity())
            .field("entry_count", &self.cache.entry_count())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl MokaCacheService {
    pub fn from_config(config: &MokaConfig, default_ttl: Duration) -> Self {
        let cache = moka::future::Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(default_ttl)
            .build();

        debug!(
            max_capacity = config.max_capacity,
            ttl_seconds = default_ttl.as_secs(),
            "Moka side-store created"
        );

        Self { cache, default_ttl }
    }

    pub fn new(max_capacity: u64, default_ttl: Duration) -> Self {
        Self::from_config(&MokaConfig { max_capacity }, default_ttl)
    }

    /// Number of live entries (pending maintenance is run first)
    pub async fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }
}

impl CacheService for MokaCacheService {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let result = self.cache.get(key).await;

        if result.is_some() {
            debug!(key = key, "Side-store HIT (moka)");
        } else {
            debug!(key = key, "Side-store MISS (moka)");
        }

        Ok(result)
    }

    async fn set(&self, key: &str, value: &str, _ttl: Duration) -> CacheResult<()> {
        // Moka uses the cache-level TTL set at construction
        self.cache.insert(key.to_string(), value.to_string()).await;

        debug!(
            key = key,
            ttl_seconds = self.default_ttl.as_secs(),
            "Side-store SET (moka)"
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.cache.invalidate(key).await;
        debug!(key = key, "Side-store DEL (moka)");
        Ok(())
    }

    async fn health_check(&self) -> CacheResult<bool> {
        Ok(true)
    }

    fn provider_name(&self) -> &'static str {
        "moka"
    }
}
