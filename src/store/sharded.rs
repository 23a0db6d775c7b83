//! Sharded store implementation.

use std::hash::{BuildHasher, RandomState};
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use super::shard::{Removed, Shard};
use super::{BackingStore, EntryInfo, Lookup, OnRemove, Stats};
use crate::cache::CacheConfig;
use crate::error::{CacheError, StoreError};
use crate::time::Instant;

const MIB: usize = 1024 * 1024;

/// Fixed-capacity store partitioned into independently locked shards.
///
/// Unrelated keys rarely contend: every operation locks only the shard the
/// key hashes to.
pub struct ShardedStore {
    shards: Box<[Shard]>,
    mask: usize,
    hasher: RandomState,
    life_window: Duration,
    stats_enabled: bool,
    verbose: bool,
    on_remove: Option<OnRemove>,
}

impl ShardedStore {
    /// Builds a store from the storage-related parts of a cache config.
    pub fn new(config: &CacheConfig) -> Result<Self, CacheError> {
        config.validate()?;

        let shard_count = config.shards;
        let limit = config.hard_max_cache_size.saturating_mul(MIB) / shard_count;
        let mut initial_entries = config.max_entries_in_window / shard_count;
        if limit > 0 && config.max_entry_size > 0 {
            initial_entries = initial_entries.min(limit / config.max_entry_size);
        }

        let shards = (0..shard_count)
            .map(|_| Shard::new(initial_entries, limit))
            .collect();

        if config.verbose {
            debug!(
                shards = shard_count,
                initial_entries,
                shard_limit = limit,
                "Allocated sharded store"
            );
        }

        Ok(Self {
            shards,
            mask: shard_count - 1,
            hasher: RandomState::new(),
            life_window: config.life_window,
            stats_enabled: config.stats_enabled,
            verbose: config.verbose,
            on_remove: config.on_remove.clone(),
        })
    }

    fn shard(&self, key: &str) -> &Shard {
        let hash = self.hasher.hash_one(key) as usize;
        &self.shards[hash & self.mask]
    }

    fn notify(&self, removed: Vec<Removed>) {
        for entry in removed {
            if self.verbose {
                debug!(key = %entry.key, reason = %entry.reason, "Entry removed");
            }
            if let Some(on_remove) = &self.on_remove {
                on_remove(&entry.key, &entry.value, entry.reason);
            }
        }
    }

    /// Clears the lookup and delete counters.
    pub fn reset_stats(&self) {
        for shard in self.shards.iter() {
            shard.reset_stats();
        }
    }
}

impl BackingStore for ShardedStore {
    fn put(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        let mut removed = Vec::new();
        let result = self.shard(key).put(key, value, Instant::now(), &mut removed);
        self.notify(removed);
        result
    }

    fn get(&self, key: &str) -> Lookup {
        self.shard(key)
            .get(key, Instant::now(), self.life_window, self.stats_enabled)
    }

    fn delete(&self, key: &str) -> bool {
        match self.shard(key).delete(key) {
            Some(removed) => {
                self.notify(vec![removed]);
                true
            }
            None => false,
        }
    }

    fn reset(&self) {
        for shard in self.shards.iter() {
            shard.reset();
        }
    }

    fn len(&self) -> usize {
        self.shards.iter().map(Shard::len).sum()
    }

    fn capacity(&self) -> usize {
        self.shards.iter().map(Shard::used).sum()
    }

    fn stats(&self) -> Stats {
        let mut stats = Stats::default();
        for shard in self.shards.iter() {
            stats += shard.stats();
        }
        stats
    }

    fn entries(&self) -> Vec<EntryInfo> {
        let now = Instant::now();
        let mut entries = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            shard.snapshot(now, self.life_window, &mut entries);
        }
        entries
    }

    fn reclaim(&self) -> usize {
        let now = Instant::now();
        let mut total = 0;
        for shard in self.shards.iter() {
            let mut removed = Vec::new();
            shard.reclaim(now, self.life_window, &mut removed);
            total += removed.len();
            self.notify(removed);
        }
        total
    }
}

impl std::fmt::Debug for ShardedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedStore")
            .field("shards", &self.shards.len())
            .field("life_window", &self.life_window)
            .field("len", &self.len())
            .finish()
    }
}
