//! Backing store - bounded, sharded, time-windowed key → bytes storage.
//!
//! The cache controller only talks to the store through [`BackingStore`].
//! [`ShardedStore`] is the implementation used by [`LocalCache`]:
//!
//! - Keys are spread over a power-of-two number of shards, each with its own lock
//! - An entry is [`Fresh`] until its age reaches the life window, then
//!   [`Expired`] until the next reclamation pass physically removes it
//! - A hard memory cap overwrites the oldest entries of a shard when it is full
//!
//! [`LocalCache`]: crate::LocalCache
//! [`Fresh`]: EntryStatus::Fresh
//! [`Expired`]: EntryStatus::Expired

mod janitor;
mod shard;
mod sharded;

use std::fmt;
use std::ops::AddAssign;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StoreError;

pub(crate) use janitor::Janitor;
pub use sharded::ShardedStore;

/// Freshness of a stored entry as observed by a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryStatus {
    /// Present and within the life window.
    Fresh,
    /// Present, past the life window, not yet reclaimed.
    Expired,
    /// Never stored, deleted, or already reclaimed.
    Absent,
}

/// Result of a store lookup: the raw bytes together with their status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Fresh(Bytes),
    Expired(Bytes),
    Absent,
}

impl Lookup {
    /// The status this lookup observed.
    pub fn status(&self) -> EntryStatus {
        match self {
            Self::Fresh(_) => EntryStatus::Fresh,
            Self::Expired(_) => EntryStatus::Expired,
            Self::Absent => EntryStatus::Absent,
        }
    }

    /// The stored bytes, regardless of freshness.
    pub fn into_value(self) -> Option<Bytes> {
        match self {
            Self::Fresh(value) | Self::Expired(value) => Some(value),
            Self::Absent => None,
        }
    }
}

/// Why an entry left the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoveReason {
    /// Removed by reclamation after the life window elapsed.
    Expired,
    /// Overwritten to make room under the hard memory cap.
    NoSpace,
    /// Removed by an explicit delete.
    Deleted,
}

impl fmt::Display for RemoveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Expired => "expired",
            Self::NoSpace => "no_space",
            Self::Deleted => "deleted",
        };
        f.write_str(reason)
    }
}

/// Callback fired for every entry that leaves the store, except through
/// [`BackingStore::reset`].
pub type OnRemove = Arc<dyn Fn(&str, &[u8], RemoveReason) + Send + Sync>;

/// Lookup and delete counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Lookups that found the key (fresh or expired).
    pub hits: u64,
    /// Lookups that did not find the key.
    pub misses: u64,
    /// Deletes of a present key.
    pub delete_hits: u64,
    /// Deletes of a missing key.
    pub delete_misses: u64,
}

impl AddAssign for Stats {
    fn add_assign(&mut self, other: Self) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.delete_hits += other.delete_hits;
        self.delete_misses += other.delete_misses;
    }
}

/// A snapshot of one stored entry, as produced by [`BackingStore::entries`].
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub key: String,
    pub value: Bytes,
    pub status: EntryStatus,
    /// Wall-clock time of the write.
    pub inserted_at: DateTime<Utc>,
    /// Number of lookups that hit this entry. Only counted with stats enabled.
    pub hits: u64,
}

/// The storage capability consumed by the cache controller.
///
/// Implementations must be internally synchronized; every method may be
/// called concurrently from many threads.
pub trait BackingStore: Send + Sync {
    /// Stores `value` under `key`, replacing any previous entry.
    fn put(&self, key: &str, value: Bytes) -> Result<(), StoreError>;

    /// Looks up `key` without removing it, whatever its status.
    fn get(&self, key: &str) -> Lookup;

    /// Removes `key`. Returns `false` if it was not present.
    fn delete(&self, key: &str) -> bool;

    /// Drops every entry.
    fn reset(&self);

    /// Number of stored entries, expired ones included.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently occupied by keys and values.
    fn capacity(&self) -> usize;

    fn stats(&self) -> Stats;

    /// A point-in-time copy of all entries.
    fn entries(&self) -> Vec<EntryInfo>;

    /// Physically removes expired entries. Returns how many were removed.
    fn reclaim(&self) -> usize;
}
