//! Background reclamation and stats reporting.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use super::BackingStore;

const MIB: usize = 1024 * 1024;

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

/// Owns the thread that periodically reclaims expired entries of one store
/// and logs its stats.
///
/// Stopping is explicit ([`Janitor::stop`]) and also happens on drop, so the
/// thread never outlives the cache that spawned it.
pub(crate) struct Janitor {
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl Janitor {
    /// Spawns a janitor for `store`.
    ///
    /// A zero `clean_window` disables reclamation and a zero `stats_interval`
    /// disables reporting. Returns `Ok(None)` when both are disabled.
    pub fn spawn(
        name: &str,
        store: Arc<dyn BackingStore>,
        clean_window: Duration,
        stats_interval: Duration,
    ) -> std::io::Result<Option<Self>> {
        if clean_window.is_zero() && stats_interval.is_zero() {
            return Ok(None);
        }

        let signal = Arc::new(StopSignal::default());
        let task = Task {
            name: name.to_owned(),
            store,
            clean_window,
            stats_interval,
            signal: Arc::clone(&signal),
        };

        let handle = thread::Builder::new()
            .name(format!("lcache-janitor-{name}"))
            .spawn(move || task.run())?;

        debug!(cache = name, ?clean_window, ?stats_interval, "Janitor started");

        Ok(Some(Self {
            signal,
            handle: Some(handle),
        }))
    }

    /// Signals the thread to exit and waits for it.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        *self.signal.stopped.lock() = true;
        self.signal.cond.notify_all();
        // A panicking janitor has nothing left to clean up.
        let _ = handle.join();
    }
}

impl Drop for Janitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Janitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Janitor")
            .field("running", &self.handle.is_some())
            .finish()
    }
}

struct Task {
    name: String,
    store: Arc<dyn BackingStore>,
    clean_window: Duration,
    stats_interval: Duration,
    signal: Arc<StopSignal>,
}

impl Task {
    fn run(self) {
        let start = Instant::now();
        let mut next_clean = schedule(start, self.clean_window);
        let mut next_stats = schedule(start, self.stats_interval);

        loop {
            let deadline = match (next_clean, next_stats) {
                (Some(a), Some(b)) => a.min(b),
                (Some(a), None) | (None, Some(a)) => a,
                (None, None) => return,
            };

            if self.wait_until(deadline) {
                debug!(cache = %self.name, "Janitor stopped");
                return;
            }

            let now = Instant::now();
            if next_clean.is_some_and(|at| now >= at) {
                let removed = self.store.reclaim();
                if removed > 0 {
                    debug!(cache = %self.name, removed, "Reclaimed expired entries");
                }
                next_clean = schedule(now, self.clean_window);
            }
            if next_stats.is_some_and(|at| now >= at) {
                let stats = serde_json::to_string(&self.store.stats()).unwrap_or_default();
                info!(
                    cache = %self.name,
                    length = self.store.len(),
                    capacity_mb = self.store.capacity() / MIB,
                    stats = %stats,
                    "Local cache stats"
                );
                next_stats = schedule(now, self.stats_interval);
            }
        }
    }

    /// Blocks until `deadline` or a stop request. Returns `true` when stopped.
    fn wait_until(&self, deadline: Instant) -> bool {
        let mut stopped = self.signal.stopped.lock();
        while !*stopped {
            if self.signal.cond.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }
}

/// The next run after `from`. `None` when disabled or too far out to represent.
fn schedule(from: Instant, every: Duration) -> Option<Instant> {
    if every.is_zero() {
        return None;
    }
    from.checked_add(every)
}
