//! Cache registry - Explicit ownership of named caches.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::{CacheConfig, LocalCache};
use crate::error::CacheError;

/// Registry mapping logical names to configured caches.
///
/// The registry is an ordinary value owned by whatever needs named caches;
/// there is no process-wide instance. Clones share the same caches.
///
/// ## Example
///
/// ```no_run
/// # use lcache::{CacheConfig, CacheRegistry};
/// # fn run() -> Result<(), lcache::CacheError> {
/// let registry = CacheRegistry::new();
///
/// // Register a cache up front, so a bad config fails early
/// let users = registry.register("users", CacheConfig::default())?;
///
/// // Later, retrieve the same cache, or lazily create one with the defaults
/// let users = registry.get("users").unwrap();
/// let sessions = registry.get_or_create("sessions")?;
///
/// registry.shutdown();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CacheRegistry {
    caches: Arc<RwLock<HashMap<String, Arc<LocalCache>>>>,
    default_config: CacheConfig,
}

impl CacheRegistry {
    /// Create a new empty registry using [`CacheConfig::default`] for lazily
    /// created caches.
    pub fn new() -> Self {
        Self::with_default_config(CacheConfig::default())
    }

    /// Create a new empty registry with the config used by
    /// [`get_or_create`](Self::get_or_create).
    pub fn with_default_config(default_config: CacheConfig) -> Self {
        info!("Cache registry initialized");
        Self {
            caches: Arc::new(RwLock::new(HashMap::new())),
            default_config,
        }
    }

    /// Create a cache and register it under `name`.
    ///
    /// An existing cache of the same name is replaced and closed; handles to
    /// it stay usable but it no longer reclaims in the background.
    pub fn register(
        &self,
        name: &str,
        config: CacheConfig,
    ) -> Result<Arc<LocalCache>, CacheError> {
        let cache = Arc::new(LocalCache::new(name, config)?);

        let replaced = self
            .caches
            .write()
            .insert(name.to_owned(), Arc::clone(&cache));

        if let Some(replaced) = replaced {
            debug!("Replacing cache: {}", name);
            replaced.close();
        } else {
            debug!("Registered cache: {}", name);
        }

        Ok(cache)
    }

    /// Get an existing cache by name.
    pub fn get(&self, name: &str) -> Option<Arc<LocalCache>> {
        self.caches.read().get(name).cloned()
    }

    /// Get an existing cache or create one with the default config.
    pub fn get_or_create(&self, name: &str) -> Result<Arc<LocalCache>, CacheError> {
        if let Some(cache) = self.get(name) {
            return Ok(cache);
        }

        let mut caches = self.caches.write();
        // Another caller may have created it in between.
        if let Some(cache) = caches.get(name) {
            return Ok(Arc::clone(cache));
        }

        debug!("Creating cache with defaults: {}", name);
        let cache = Arc::new(LocalCache::new(name, self.default_config.clone())?);
        caches.insert(name.to_owned(), Arc::clone(&cache));
        Ok(cache)
    }

    /// Check if a cache with the given name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.caches.read().contains_key(name)
    }

    /// Remove and close a cache.
    ///
    /// Returns `true` if the cache was removed.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.caches.write().remove(name);
        match removed {
            Some(cache) => {
                cache.close();
                debug!("Removed cache: {}", name);
                true
            }
            None => false,
        }
    }

    /// Get the number of registered caches.
    pub fn len(&self) -> usize {
        self.caches.read().len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.caches.read().is_empty()
    }

    /// Get a list of all registered cache names.
    pub fn cache_names(&self) -> Vec<String> {
        self.caches.read().keys().cloned().collect()
    }

    /// Close and drop every cache.
    pub fn shutdown(&self) {
        let caches: Vec<_> = self.caches.write().drain().collect();
        for (_, cache) in &caches {
            cache.close();
        }
        info!(count = caches.len(), "Cache registry shut down");
    }
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let caches = self.caches.read();
        f.debug_struct("CacheRegistry")
            .field("cache_count", &caches.len())
            .field("cache_names", &caches.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn registry() -> CacheRegistry {
        CacheRegistry::with_default_config(CacheConfig::ephemeral(Duration::from_secs(60)))
    }

    #[test]
    fn test_get_or_create_returns_same_instance() {
        let registry = registry();
        let first = registry.get_or_create("users").unwrap();
        let second = registry.get_or_create("users").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("users"));
    }

    #[test]
    fn test_register_replaces_existing() {
        let registry = registry();
        let old = registry.get_or_create("users").unwrap();
        old.set("k", &1u32).unwrap();

        let new = registry
            .register("users", CacheConfig::ephemeral(Duration::from_secs(1)))
            .unwrap();

        assert!(!Arc::ptr_eq(&old, &new));
        assert!(new.is_empty());
        assert!(Arc::ptr_eq(&registry.get("users").unwrap(), &new));
    }

    #[test]
    fn test_register_rejects_invalid_config() {
        let registry = registry();
        let err = registry
            .register("bad", CacheConfig::ephemeral(Duration::from_secs(1)).shards(6))
            .unwrap_err();

        assert!(matches!(err, CacheError::InvalidConfig(_)));
        assert!(!registry.contains("bad"));
    }

    #[test]
    fn test_registries_are_isolated() {
        let a = registry();
        let b = registry();
        a.get_or_create("users").unwrap();

        assert!(b.get("users").is_none());
        assert!(a.clone().contains("users"));
    }

    #[test]
    fn test_replace_and_remove_close_janitor() {
        let registry = registry();
        let with_janitor =
            || CacheConfig::ephemeral(Duration::from_secs(1)).clean_window(Duration::from_millis(50));

        let old = registry.register("users", with_janitor()).unwrap();
        assert!(old.has_janitor());

        let new = registry.register("users", with_janitor()).unwrap();
        assert!(!old.has_janitor());
        assert!(new.has_janitor());

        assert!(registry.remove("users"));
        assert!(!new.has_janitor());

        let last = registry.register("sessions", with_janitor()).unwrap();
        registry.shutdown();
        assert!(!last.has_janitor());
    }

    #[test]
    fn test_remove_and_shutdown() {
        let registry = registry();
        registry.get_or_create("a").unwrap();
        registry.get_or_create("b").unwrap();

        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        assert_eq!(registry.cache_names(), ["b"]);

        registry.shutdown();
        assert!(registry.is_empty());
    }
}
