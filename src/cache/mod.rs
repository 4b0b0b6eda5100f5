//! # Side-Store Module
//!
//! Key-value store used to externalize task arguments that cannot travel
//! inline in a message body.
//!
//! ## Architecture
//!
//! ```text
//! CacheProvider (enum)              <- Zero-cost dispatch, no vtable
//!   ├── Moka(MokaCacheService)      <- In-process, single-node / tests
//!   └── Memcached(MemcachedCacheService)  <- Shared across producers and workers
//! ```
//!
//! ## Reference lifecycle
//!
//! References are written by the dispatcher at encode time with a bounded
//! lifetime, read by the worker when it rehydrates a task, and deleted only
//! after the task was invoked successfully. A failed delivery leaves them in
//! place so the retried delivery can still rehydrate.

pub mod errors;
pub mod provider;
pub mod providers;
pub mod traits;

pub use errors::{CacheError, CacheResult};
pub use provider::CacheProvider;
pub use providers::MokaCacheService;
pub use traits::CacheService;

#[cfg(feature = "cache-memcached")]
pub use providers::MemcachedCacheService;
