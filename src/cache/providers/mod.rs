//! Side-store provider implementations

pub mod moka;

#[cfg(feature = "cache-memcached")]
pub mod memcached;

pub use self::moka::MokaCacheService;

#[cfg(feature = "cache-memcached")]
pub use self::memcached::MemcachedCacheService;
