//! A single store shard.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{EntryInfo, EntryStatus, Lookup, RemoveReason, Stats};
use crate::error::StoreError;
use crate::time::Instant;

/// Shards never pre-size below this many slots.
const MIN_ENTRIES_IN_SHARD: usize = 10;

/// An entry that left the shard. Reported to the removal callback once the
/// shard lock has been released.
#[derive(Debug)]
pub(super) struct Removed {
    pub key: String,
    pub value: Bytes,
    pub reason: RemoveReason,
}

#[derive(Debug)]
struct Slot {
    value: Bytes,
    inserted: Instant,
    inserted_at: DateTime<Utc>,
    seq: u64,
    hits: AtomicU64,
}

impl Slot {
    fn status(&self, now: Instant, life_window: Duration) -> EntryStatus {
        if now.saturating_duration_since(self.inserted) >= life_window {
            EntryStatus::Expired
        } else {
            EntryStatus::Fresh
        }
    }
}

/// Insertion-order record. A ticket whose `seq` no longer matches the live
/// slot belongs to an overwritten entry and is skipped.
#[derive(Debug)]
struct Ticket {
    key: String,
    seq: u64,
}

#[derive(Debug, Default)]
struct ShardInner {
    slots: HashMap<String, Slot>,
    queue: VecDeque<Ticket>,
    used: usize,
    next_seq: u64,
}

impl ShardInner {
    fn is_live(&self, ticket: &Ticket) -> bool {
        self.slots
            .get(&ticket.key)
            .is_some_and(|slot| slot.seq == ticket.seq)
    }

    fn take(&mut self, key: &str) -> Option<Slot> {
        let slot = self.slots.remove(key)?;
        self.used -= entry_size(key, &slot.value);
        Some(slot)
    }

    /// Removes the oldest live entry.
    fn pop_oldest(&mut self) -> Option<(String, Slot)> {
        while let Some(ticket) = self.queue.pop_front() {
            if self.is_live(&ticket) {
                let slot = self.take(&ticket.key)?;
                return Some((ticket.key, slot));
            }
        }
        None
    }

    /// Drops stale tickets once they dominate the queue, so repeated
    /// overwrites of hot keys don't grow it without bound.
    fn compact(&mut self) {
        if self.queue.len() <= self.slots.len() * 2 + MIN_ENTRIES_IN_SHARD {
            return;
        }
        let queue = std::mem::take(&mut self.queue);
        self.queue = queue
            .into_iter()
            .filter(|ticket| self.is_live(ticket))
            .collect();
    }
}

fn entry_size(key: &str, value: &Bytes) -> usize {
    key.len() + value.len()
}

pub(super) struct Shard {
    inner: RwLock<ShardInner>,
    /// Byte budget for this shard, `0` meaning unlimited.
    limit: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    delete_hits: AtomicU64,
    delete_misses: AtomicU64,
}

impl Shard {
    pub fn new(initial_entries: usize, limit: usize) -> Self {
        let initial_entries = initial_entries.max(MIN_ENTRIES_IN_SHARD);
        Self {
            inner: RwLock::new(ShardInner {
                slots: HashMap::with_capacity(initial_entries),
                queue: VecDeque::with_capacity(initial_entries),
                ..Default::default()
            }),
            limit,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            delete_hits: AtomicU64::new(0),
            delete_misses: AtomicU64::new(0),
        }
    }

    /// Writes an entry, evicting the oldest ones if the byte budget requires it.
    pub fn put(
        &self,
        key: &str,
        value: Bytes,
        now: Instant,
        removed: &mut Vec<Removed>,
    ) -> Result<(), StoreError> {
        let size = entry_size(key, &value);
        if self.limit > 0 && size > self.limit {
            return Err(StoreError::EntryTooLarge {
                size,
                limit: self.limit,
            });
        }

        let mut inner = self.inner.write();
        inner.take(key);

        while self.limit > 0 && inner.used + size > self.limit {
            let Some((key, slot)) = inner.pop_oldest() else {
                break;
            };
            removed.push(Removed {
                key,
                value: slot.value,
                reason: RemoveReason::NoSpace,
            });
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.used += size;
        inner.slots.insert(
            key.to_owned(),
            Slot {
                value,
                inserted: now,
                inserted_at: Utc::now(),
                seq,
                hits: AtomicU64::new(0),
            },
        );
        inner.queue.push_back(Ticket {
            key: key.to_owned(),
            seq,
        });
        inner.compact();

        Ok(())
    }

    pub fn get(&self, key: &str, now: Instant, life_window: Duration, count_hits: bool) -> Lookup {
        let inner = self.inner.read();
        let Some(slot) = inner.slots.get(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Lookup::Absent;
        };

        self.hits.fetch_add(1, Ordering::Relaxed);
        if count_hits {
            slot.hits.fetch_add(1, Ordering::Relaxed);
        }

        match slot.status(now, life_window) {
            EntryStatus::Fresh => Lookup::Fresh(slot.value.clone()),
            _ => Lookup::Expired(slot.value.clone()),
        }
    }

    pub fn delete(&self, key: &str) -> Option<Removed> {
        let slot = self.inner.write().take(key);
        match slot {
            Some(slot) => {
                self.delete_hits.fetch_add(1, Ordering::Relaxed);
                Some(Removed {
                    key: key.to_owned(),
                    value: slot.value,
                    reason: RemoveReason::Deleted,
                })
            }
            None => {
                self.delete_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Removes expired entries, oldest first, stopping at the first fresh one.
    pub fn reclaim(&self, now: Instant, life_window: Duration, removed: &mut Vec<Removed>) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        loop {
            let Some(ticket) = inner.queue.front() else {
                break;
            };
            let status = inner
                .slots
                .get(&ticket.key)
                .filter(|slot| slot.seq == ticket.seq)
                .map(|slot| slot.status(now, life_window));

            match status {
                Some(EntryStatus::Expired) => {}
                Some(_) => break,
                // Stale ticket of an overwritten or deleted entry.
                None => {
                    inner.queue.pop_front();
                    continue;
                }
            }
            if let Some((key, slot)) = inner.pop_oldest() {
                removed.push(Removed {
                    key,
                    value: slot.value,
                    reason: RemoveReason::Expired,
                });
            }
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.slots.clear();
        inner.queue.clear();
        inner.used = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.read().slots.len()
    }

    pub fn used(&self) -> usize {
        self.inner.read().used
    }

    pub fn stats(&self) -> Stats {
        Stats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            delete_hits: self.delete_hits.load(Ordering::Relaxed),
            delete_misses: self.delete_misses.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.delete_hits.store(0, Ordering::Relaxed);
        self.delete_misses.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self, now: Instant, life_window: Duration, out: &mut Vec<EntryInfo>) {
        let inner = self.inner.read();
        out.extend(inner.slots.iter().map(|(key, slot)| EntryInfo {
            key: key.clone(),
            value: slot.value.clone(),
            status: slot.status(now, life_window),
            inserted_at: slot.inserted_at,
            hits: slot.hits.load(Ordering::Relaxed),
        }));
    }
}
