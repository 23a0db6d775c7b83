//! lcache - In-process read-through local cache.
//!
//! Serves repeated lookups for the same key from a bounded, time-windowed
//! in-memory store. On a miss the caller-supplied loader runs exactly once per
//! key, even under concurrent requests, and every waiting caller observes the
//! single result.
//!
//! ## Architecture
//!
//! - `store` - Sharded, time-windowed byte store with per-entry status
//! - `cache` - Coalescing group, cache controller and named registry
//! - `config` - Per-RPC cache definitions loaded from YAML / environment
//! - `plugin` - Request interception for RPC handlers
//! - `error` - Error types shared by all of the above
//!
//! ## Usage
//!
//! ```no_run
//! use lcache::{CacheConfig, CacheRegistry};
//!
//! # async fn fetch_user(id: u64) -> anyhow::Result<String> { Ok(format!("user-{id}")) }
//! # async fn run() -> Result<(), lcache::CacheError> {
//! let registry = CacheRegistry::new();
//! let users = registry.register("users", CacheConfig::default())?;
//!
//! let name: String = users.get_or_load("u:1", || fetch_user(1)).await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod plugin;
pub mod store;

pub use cache::{
    CacheConfig, CacheRegistry, Encoding, Group, LoadOutcome, Loaded, LocalCache, WorkPanicked,
};
pub use config::{PluginConfig, RpcCacheDef};
pub use error::{CacheError, CodecError, StoreError};
pub use plugin::{CacheFlag, CallContext, RpcCachePlugin};
pub use store::{BackingStore, EntryInfo, EntryStatus, Lookup, RemoveReason, ShardedStore, Stats};

// Entry timestamps follow tokio's clock in tests so freshness windows can be
// exercised with a paused runtime.
#[cfg(test)]
pub(crate) use tokio::time;

#[cfg(not(test))]
pub(crate) use std::time;
