//! Coalescing group - at most one in-flight execution per key.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use thiserror::Error;
use tracing::trace;

/// The shared work panicked. Published to every caller joined to it.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct WorkPanicked {
    message: String,
}

impl WorkPanicked {
    fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_owned()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "unknown panic payload".to_owned()
        };
        Self { message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

type Work<T> = BoxFuture<'static, Result<T, WorkPanicked>>;

struct InFlight<T> {
    id: u64,
    call: WeakShared<Work<T>>,
}

/// Deduplicates concurrent executions of equivalent work.
///
/// The first caller for a key becomes the leader and starts the work; every
/// caller arriving while it runs joins it and receives a clone of the same
/// output. Once the work finishes the key is released, so the next call runs
/// the work again. Nothing is cached here.
///
/// The work is driven by whichever caller is polling. A caller that gives up
/// (its future is dropped) leaves the others unaffected; the work is only
/// abandoned once every caller has gone.
pub struct Group<T> {
    calls: Arc<DashMap<String, InFlight<T>>>,
    next_id: AtomicU64,
}

impl<T> Group<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            calls: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Runs `work` for `key`, or joins the execution already in flight.
    ///
    /// Returns the output and whether it was shared, i.e. produced by
    /// another caller's execution.
    pub async fn work<F, Fut>(&self, key: &str, work: F) -> (Result<T, WorkPanicked>, bool)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (call, shared) = self.join_or_start(key, work);
        (call.await, shared)
    }

    /// Number of keys with work in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.len()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.calls.contains_key(key)
    }

    fn join_or_start<F, Fut>(&self, key: &str, work: F) -> (Shared<Work<T>>, bool)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        // Registration happens under the entry lock, so two callers can never
        // both become leader for the same key.
        match self.calls.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if let Some(call) = occupied.get().call.upgrade() {
                    trace!(key, "Joined in-flight work");
                    return (call, true);
                }
                // Every caller of the previous execution went away before
                // its guard could deregister it.
                let (id, call) = self.start(key, work);
                if let Some(weak) = call.downgrade() {
                    occupied.insert(InFlight { id, call: weak });
                }
                (call, false)
            }
            Entry::Vacant(vacant) => {
                let (id, call) = self.start(key, work);
                if let Some(weak) = call.downgrade() {
                    vacant.insert(InFlight { id, call: weak });
                }
                (call, false)
            }
        }
    }

    fn start<F, Fut>(&self, key: &str, work: F) -> (u64, Shared<Work<T>>)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = Deregister {
            calls: Arc::clone(&self.calls),
            key: key.to_owned(),
            id,
        };

        let call = async move {
            let output = AssertUnwindSafe(async move { work().await })
                .catch_unwind()
                .await
                .map_err(WorkPanicked::from_payload);
            // Release the key before publishing, so callers either join this
            // execution or start a new one.
            drop(guard);
            output
        };

        trace!(key, id, "Started work");
        (id, call.boxed().shared())
    }
}

impl<T> Default for Group<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Group<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("in_flight", &self.calls.len())
            .finish()
    }
}

/// Removes the in-flight registration of one execution on every exit path:
/// completion, panic, or abandonment.
struct Deregister<T> {
    calls: Arc<DashMap<String, InFlight<T>>>,
    key: String,
    id: u64,
}

impl<T> Drop for Deregister<T> {
    fn drop(&mut self) {
        self.calls
            .remove_if(&self.key, |_, in_flight| in_flight.id == self.id);
    }
}
