//! Side-store provider selected from configuration
//!
//! Enum dispatch over the concrete backends, mirroring
//! [`crate::messaging::BrokerProvider`]. Unlike a read-through cache, the
//! side-store holds task arguments that exist nowhere else, so an unusable
//! backend is an error and never degrades to a no-op store.

use super::errors::{CacheError, CacheResult};
use super::providers::MokaCacheService;
use super::traits::CacheService;
use crate::config::CacheConfig;
use std::time::Duration;
use tracing::{info, warn};

#[cfg(feature = "cache-memcached")]
use super::providers::MemcachedCacheService;

/// Side-store backend chosen at startup
#[derive(Debug, Clone)]
pub enum CacheProvider {
    /// In-process store
    Moka(Box<MokaCacheService>),

    /// Shared memcached store
    #[cfg(feature = "cache-memcached")]
    Memcached(Box<MemcachedCacheService>),
}

impl CacheProvider {
    /// Build the provider named by `config.backend`
    pub async fn from_config(config: &CacheConfig) -> CacheResult<Self> {
        match config.backend.as_str() {
            "moka" | "memory" | "in-memory" => {
                let ttl = Duration::from_secs(config.reference_ttl_seconds);
                let service = MokaCacheService::from_config(&config.moka, ttl);
                info!(
                    backend = "moka",
                    max_capacity = config.moka.max_capacity,
                    ttl_seconds = config.reference_ttl_seconds,
                    "Side-store provider initialized"
                );
                Ok(Self::Moka(Box::new(service)))
            }
            "memcached" => Self::create_memcached(config).await,
            other => Err(CacheError::Configuration(format!(
                "unknown side-store backend '{}'",
                other
            ))),
        }
    }

    #[cfg(feature = "cache-memcached")]
    async fn create_memcached(config: &CacheConfig) -> CacheResult<Self> {
        let service = MemcachedCacheService::from_config(&config.memcached).await?;
        info!(backend = "memcached", "Side-store provider initialized");
        Ok(Self::Memcached(Box::new(service)))
    }

    #[cfg(not(feature = "cache-memcached"))]
    async fn create_memcached(_config: &CacheConfig) -> CacheResult<Self> {
        Err(CacheError::Configuration(
            "memcached side-store requested but the 'cache-memcached' feature is not enabled"
                .to_string(),
        ))
    }

    /// Warn when references cannot cross process boundaries
    ///
    /// Returns whether the store is shared across processes.
    pub fn warn_if_process_local(&self) -> bool {
        let distributed = self.is_distributed();
        if !distributed {
            warn!(
                side_store = self.provider_name(),
                "Side-store is process-local; references written by other processes will not resolve"
            );
        }
        distributed
    }

    /// In-process provider, mostly for tests
    pub fn in_memory(max_capacity: u64, ttl: Duration) -> Self {
        Self::Moka(Box::new(MokaCacheService::new(max_capacity, ttl)))
    }
}

impl CacheService for CacheProvider {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        match self {
            Self::Moka(s) => s.get(key).await,
            #[cfg(feature = "cache-memcached")]
            Self::Memcached(s) => s.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        match self {
            Self::Moka(s) => s.set(key, value, ttl).await,
            #[cfg(feature = "cache-memcached")]
            Self::Memcached(s) => s.set(key, value, ttl).await,
        }
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        match self {
            Self::Moka(s) => s.delete(key).await,
            #[cfg(feature = "cache-memcached")]
            Self::Memcached(s) => s.delete(key).await,
        }
    }

    async fn health_check(&self) -> CacheResult<bool> {
        match self {
            Self::Moka(s) => s.health_check().await,
            #[cfg(feature = "cache-memcached")]
            Self::Memcached(s) => s.health_check().await,
        }
    }

    fn provider_name(&self) -> &'static str {
        match self {
            Self::Moka(s) => s.provider_name(),
            #[cfg(feature = "cache-memcached")]
            Self::Memcached(s) => s.provider_name(),
        }
    }

    fn is_distributed(&self) -> bool {
        match self {
            Self::Moka(s) => s.is_distributed(),
            #[cfg(feature = "cache-memcached")]
            Self::Memcached(s) => s.is_distributed(),
        }
    }
}
