//! Cache configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::Encoding;
use crate::error::CacheError;
use crate::store::{OnRemove, RemoveReason};

/// Configuration for a cache instance.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of store shards. Must be a power of two.
    pub shards: usize,

    /// Time after which an entry is reported as expired.
    #[serde(with = "humantime_serde")]
    pub life_window: Duration,

    /// Interval between reclamation passes.
    /// A zero interval disables reclamation; expired entries then stay
    /// until overwritten or deleted.
    #[serde(with = "humantime_serde")]
    pub clean_window: Duration,

    /// Interval between stats log lines. Zero disables reporting.
    #[serde(with = "humantime_serde")]
    pub stats_interval: Duration,

    /// Expected number of entries in one life window.
    /// Only used to pre-size the shards.
    pub max_entries_in_window: usize,

    /// Expected size of an entry in bytes.
    /// Only used to pre-size the shards.
    pub max_entry_size: usize,

    /// Hard memory cap in MiB, `0` meaning unlimited.
    /// When reached, the oldest entries are overwritten.
    pub hard_max_cache_size: usize,

    /// Count hits per entry.
    pub stats_enabled: bool,

    /// Log store allocations and removals.
    pub verbose: bool,

    /// Serve an expired entry when reloading it fails.
    pub allow_use_expired_entry: bool,

    /// Encoding used by [`LocalCache::get_or_load`] and the typed accessors.
    ///
    /// [`LocalCache::get_or_load`]: super::LocalCache::get_or_load
    pub encoding: Encoding,

    /// Fired for every entry that is evicted, reclaimed or deleted.
    #[serde(skip)]
    pub on_remove: Option<OnRemove>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shards: 128,
            life_window: Duration::from_secs(60),
            clean_window: Duration::from_secs(30),
            stats_interval: Duration::from_secs(180), // 3 minutes
            max_entries_in_window: 1000 * 10 * 60,
            max_entry_size: 1024,
            hard_max_cache_size: 2046,
            stats_enabled: true,
            verbose: true,
            allow_use_expired_entry: false,
            encoding: Encoding::default(),
            on_remove: None,
        }
    }
}

impl CacheConfig {
    /// Checks the values the store cannot work with.
    pub fn validate(&self) -> Result<(), CacheError> {
        if !self.shards.is_power_of_two() {
            return Err(CacheError::InvalidConfig(format!(
                "shards must be a power of two, got {}",
                self.shards
            )));
        }
        Ok(())
    }

    /// Set the number of shards.
    #[must_use]
    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    /// Set the freshness window of entries.
    #[must_use]
    pub fn life_window(mut self, duration: Duration) -> Self {
        self.life_window = duration;
        self
    }

    /// Set the reclamation interval.
    #[must_use]
    pub fn clean_window(mut self, duration: Duration) -> Self {
        self.clean_window = duration;
        self
    }

    /// Set the stats reporting interval.
    #[must_use]
    pub fn stats_interval(mut self, duration: Duration) -> Self {
        self.stats_interval = duration;
        self
    }

    #[must_use]
    pub fn max_entries_in_window(mut self, entries: usize) -> Self {
        self.max_entries_in_window = entries;
        self
    }

    #[must_use]
    pub fn max_entry_size(mut self, bytes: usize) -> Self {
        self.max_entry_size = bytes;
        self
    }

    /// Set the hard memory cap in MiB.
    #[must_use]
    pub fn hard_max_cache_size(mut self, mb: usize) -> Self {
        self.hard_max_cache_size = mb;
        self
    }

    #[must_use]
    pub fn stats_enabled(mut self, enabled: bool) -> Self {
        self.stats_enabled = enabled;
        self
    }

    #[must_use]
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Allow serving expired entries when the loader fails.
    #[must_use]
    pub fn allow_use_expired_entry(mut self, allowed: bool) -> Self {
        self.allow_use_expired_entry = allowed;
        self
    }

    #[must_use]
    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Set the removal callback.
    #[must_use]
    pub fn on_remove<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &[u8], RemoveReason) + Send + Sync + 'static,
    {
        self.on_remove = Some(Arc::new(callback));
        self
    }

    /// Create config for tests and short-lived data: small store,
    /// no background thread.
    pub fn ephemeral(life_window: Duration) -> Self {
        Self {
            shards: 8,
            life_window,
            clean_window: Duration::ZERO,
            stats_interval: Duration::ZERO,
            max_entries_in_window: 1_000,
            hard_max_cache_size: 0,
            verbose: false,
            ..Default::default()
        }
    }
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("shards", &self.shards)
            .field("life_window", &self.life_window)
            .field("clean_window", &self.clean_window)
            .field("stats_interval", &self.stats_interval)
            .field("max_entries_in_window", &self.max_entries_in_window)
            .field("max_entry_size", &self.max_entry_size)
            .field("hard_max_cache_size", &self.hard_max_cache_size)
            .field("stats_enabled", &self.stats_enabled)
            .field("verbose", &self.verbose)
            .field("allow_use_expired_entry", &self.allow_use_expired_entry)
            .field("encoding", &self.encoding)
            .field("on_remove", &self.on_remove.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_with_defaults() {
        let config: CacheConfig = serde_yaml::from_str(
            "shards: 16\nlife_window: 5s\nclean_window: 1m\nallow_use_expired_entry: true\nencoding: yaml\n",
        )
        .unwrap();

        assert_eq!(config.shards, 16);
        assert_eq!(config.life_window, Duration::from_secs(5));
        assert_eq!(config.clean_window, Duration::from_secs(60));
        assert!(config.allow_use_expired_entry);
        assert_eq!(config.encoding, Encoding::Yaml);
        assert_eq!(config.max_entry_size, 1024);
        assert!(config.on_remove.is_none());
    }

    #[test]
    fn test_validate_shards() {
        assert!(CacheConfig::default().validate().is_ok());
        assert!(CacheConfig::default().shards(0).validate().is_err());
        assert!(CacheConfig::default().shards(100).validate().is_err());
    }
}
