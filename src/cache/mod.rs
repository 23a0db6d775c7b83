//! Cache module - Read-through caching with request coalescing.
//!
//! ## Architecture
//!
//! The cache system follows a registry pattern:
//! - `CacheRegistry` - Explicit registry holding named caches
//! - `LocalCache` - Controller deciding between hit, load, join and stale fallback
//! - `Group` - Deduplicates concurrent loads of the same key
//! - `CacheConfig` - Store sizing, timing windows and fallback policy
//!
//! ## Usage
//!
//! ```no_run
//! # use lcache::{CacheConfig, CacheRegistry};
//! # #[derive(Clone, serde::Serialize, serde::Deserialize)] struct User;
//! # async fn fetch_user(id: i64) -> anyhow::Result<User> { Ok(User) }
//! # async fn run(registry: CacheRegistry) -> Result<(), lcache::CacheError> {
//! let users = registry.register("users", CacheConfig::default().allow_use_expired_entry(true))?;
//!
//! // Concurrent callers for "user:42" share a single fetch
//! let user: User = users.get_or_load("user:42", || fetch_user(42)).await?;
//! # Ok(())
//! # }
//! ```

mod codec;
mod config;
mod group;
mod local;
mod registry;

pub use codec::Encoding;
pub use config::CacheConfig;
pub use group::{Group, WorkPanicked};
pub use local::{LoadOutcome, Loaded, LocalCache};
pub use registry::CacheRegistry;
