//! The read-through cache controller.

use std::any::{Any, type_name};
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use super::{CacheConfig, Encoding, Group};
use crate::error::CacheError;
use crate::store::{BackingStore, EntryInfo, EntryStatus, Janitor, Lookup, ShardedStore, Stats};

const MIB: usize = 1024 * 1024;

/// Where the value returned by [`LocalCache::load`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadOutcome {
    /// Served from a fresh store entry.
    Hit,
    /// This caller ran the loader.
    Loaded,
    /// Another caller's in-flight load produced the value.
    Joined,
    /// The load failed and the expired entry was served instead.
    Stale,
}

/// A value together with its [`LoadOutcome`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loaded<T> {
    pub value: T,
    pub outcome: LoadOutcome,
}

/// A loaded value as published to every coalesced caller.
#[derive(Clone)]
struct Published {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Published {
    fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: type_name::<T>(),
        }
    }

    /// Clones the value out for one caller.
    fn get<T: Clone + 'static>(&self) -> Result<T, CacheError> {
        self.value
            .downcast_ref::<T>()
            .cloned()
            .ok_or(CacheError::TypeMismatch {
                expected: type_name::<T>(),
                found: self.type_name,
            })
    }
}

type LoadResult = Result<Published, CacheError>;

/// A named read-through cache in front of an expensive loader.
///
/// Lookups are served from the backing store. On a miss the loader runs once
/// per key, however many callers ask concurrently; its value is written to
/// the store and handed to every caller. With `allow_use_expired_entry` an
/// expired entry is served when the reload fails.
///
/// Dropping the cache (or calling [`close`](Self::close)) stops its
/// background janitor.
pub struct LocalCache {
    name: Arc<str>,
    store: Arc<dyn BackingStore>,
    group: Group<LoadResult>,
    encoding: Encoding,
    allow_use_expired_entry: bool,
    janitor: Mutex<Option<Janitor>>,
}

impl LocalCache {
    /// Create a new cache backed by a [`ShardedStore`].
    pub fn new(name: impl Into<Arc<str>>, config: CacheConfig) -> Result<Self, CacheError> {
        let store = Arc::new(ShardedStore::new(&config)?);
        Self::with_store(name, store, &config)
    }

    /// Create a new cache on top of an existing store.
    ///
    /// Only the controller and janitor settings of `config` are used.
    pub fn with_store(
        name: impl Into<Arc<str>>,
        store: Arc<dyn BackingStore>,
        config: &CacheConfig,
    ) -> Result<Self, CacheError> {
        let name = name.into();
        let janitor = Janitor::spawn(
            &name,
            Arc::clone(&store),
            config.clean_window,
            config.stats_interval,
        )
        .map_err(|err| CacheError::Spawn(Arc::new(err)))?;

        info!(
            cache = %name,
            length = store.len(),
            capacity_mb = store.capacity() / MIB,
            "New local cache"
        );

        Ok(Self {
            name,
            store,
            group: Group::new(),
            encoding: config.encoding,
            allow_use_expired_entry: config.allow_use_expired_entry,
            janitor: Mutex::new(janitor),
        })
    }

    /// Get the name of this cache.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The encoding used by the typed accessors.
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Get the value for `key`, loading it on a miss.
    ///
    /// Uses the configured encoding. See [`load`](Self::load).
    pub async fn get_or_load<T, F, Fut, E>(&self, key: &str, loader: F) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error>,
    {
        let loaded = self.load(key, self.encoding, loader).await?;
        Ok(loaded.value)
    }

    /// Get the value for `key`, loading it on a miss, and report where it
    /// came from.
    ///
    /// - A fresh entry is returned without touching the loader.
    /// - Otherwise the loader runs, unless a load for `key` is already in
    ///   flight, in which case that load's result is awaited instead. A
    ///   successful load is written to the store; a failed one writes nothing.
    /// - If the load fails, the entry was present but expired, and the cache
    ///   allows expired entries, the expired value is returned.
    ///
    /// Every caller receives its own clone of the value. A caller asking for a
    /// different `T` than the in-flight load produces gets
    /// [`CacheError::TypeMismatch`].
    pub async fn load<T, F, Fut, E>(
        &self,
        key: &str,
        encoding: Encoding,
        loader: F,
    ) -> Result<Loaded<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error>,
    {
        check_key(key)?;

        let stale = match self.store.get(key) {
            Lookup::Fresh(bytes) => match encoding.decode::<T>(&bytes) {
                Ok(value) => {
                    return Ok(Loaded {
                        value,
                        outcome: LoadOutcome::Hit,
                    });
                }
                Err(err) => {
                    warn!(cache = %self.name, key, error = %err, "Undecodable entry, reloading");
                    None
                }
            },
            Lookup::Expired(bytes) => encoding
                .decode::<T>(&bytes)
                .inspect_err(|err| {
                    warn!(cache = %self.name, key, error = %err, "Undecodable expired entry");
                })
                .ok(),
            Lookup::Absent => None,
        };

        let store = Arc::clone(&self.store);
        let name = Arc::clone(&self.name);
        let owned_key = key.to_owned();
        let work = move || async move {
            let value = match loader().await {
                Ok(value) => value,
                Err(err) => {
                    let err = CacheError::loader(err);
                    error!(cache = %name, key = %owned_key, error = %err, "Load through failed");
                    return Err(err);
                }
            };

            // The value is good even if it cannot be stored.
            match encoding.encode(&value) {
                Ok(bytes) => {
                    if let Err(err) = store.put(&owned_key, bytes) {
                        error!(cache = %name, key = %owned_key, error = %err, "Failed to store loaded entry");
                    }
                }
                Err(err) => {
                    error!(cache = %name, key = %owned_key, error = %err, "Failed to encode loaded entry");
                }
            }
            debug!(cache = %name, key = %owned_key, "Load through succeeded");

            Ok(Published::new(value))
        };

        let (result, shared) = self.group.work(key, work).await;
        let result = result
            .unwrap_or_else(|panicked| Err(CacheError::LoaderPanicked(panicked.message().to_owned())));

        match result {
            Ok(published) => Ok(Loaded {
                value: published.get()?,
                outcome: if shared {
                    LoadOutcome::Joined
                } else {
                    LoadOutcome::Loaded
                },
            }),
            Err(err) if err.is_load_failure() && self.allow_use_expired_entry => match stale {
                Some(value) => {
                    warn!(cache = %self.name, key, error = %err, "Serving expired entry");
                    Ok(Loaded {
                        value,
                        outcome: LoadOutcome::Stale,
                    })
                }
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    /// Get the value for `key`, whether fresh or expired.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, CacheError> {
        let bytes = self.get_bytes(key)?;
        Ok(self.encoding.decode(&bytes)?)
    }

    /// Get the value for `key` together with its status.
    pub fn get_with_status<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<(T, EntryStatus), CacheError> {
        let lookup = self.store.get(key);
        let status = lookup.status();
        let bytes = lookup.into_value().ok_or(CacheError::NotFound)?;
        Ok((self.encoding.decode(&bytes)?, status))
    }

    /// Get the raw stored bytes for `key`.
    pub fn get_bytes(&self, key: &str) -> Result<Bytes, CacheError> {
        self.store.get(key).into_value().ok_or(CacheError::NotFound)
    }

    /// Encode and store `value` under `key`.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        check_key(key)?;
        let bytes = self.encoding.encode(value)?;
        Ok(self.store.put(key, bytes)?)
    }

    /// Store raw bytes under `key`.
    pub fn set_bytes(&self, key: &str, value: impl Into<Bytes>) -> Result<(), CacheError> {
        check_key(key)?;
        Ok(self.store.put(key, value.into())?)
    }

    /// Remove `key`.
    pub fn delete(&self, key: &str) -> Result<(), CacheError> {
        if self.store.delete(key) {
            Ok(())
        } else {
            Err(CacheError::NotFound)
        }
    }

    /// Remove all entries.
    pub fn reset(&self) {
        self.store.reset();
    }

    /// Get the number of entries, expired ones included.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Get the number of bytes held by entries.
    pub fn capacity(&self) -> usize {
        self.store.capacity()
    }

    pub fn stats(&self) -> Stats {
        self.store.stats()
    }

    /// A snapshot of every stored entry.
    pub fn entries(&self) -> Vec<EntryInfo> {
        self.store.entries()
    }

    /// Remove expired entries now, without waiting for the janitor.
    pub fn reclaim(&self) -> usize {
        self.store.reclaim()
    }

    /// Whether a background janitor is reclaiming or reporting for this cache.
    pub fn has_janitor(&self) -> bool {
        self.janitor.lock().is_some()
    }

    /// Stop the background janitor. The cache stays usable.
    pub fn close(&self) {
        if let Some(mut janitor) = self.janitor.lock().take() {
            janitor.stop();
            debug!(cache = %self.name, "Local cache closed");
        }
    }
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("name", &self.name)
            .field("len", &self.store.len())
            .field("in_flight", &self.group.in_flight())
            .field("encoding", &self.encoding)
            .field("allow_use_expired_entry", &self.allow_use_expired_entry)
            .finish()
    }
}

fn check_key(key: &str) -> Result<(), CacheError> {
    if key.is_empty() {
        return Err(CacheError::InvalidKey(key.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::future::join_all;
    use serde::Deserialize;
    use tokio::time::{advance, sleep};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        n: String,
    }

    fn yan() -> User {
        User { n: "Yan".into() }
    }

    fn cache(allow_stale: bool) -> LocalCache {
        let config = CacheConfig::ephemeral(Duration::from_secs(1)).allow_use_expired_entry(allow_stale);
        LocalCache::new("test", config).unwrap()
    }

    fn counting_loader(
        calls: &Arc<AtomicUsize>,
        user: User,
    ) -> impl FnOnce() -> futures::future::Ready<anyhow::Result<User>> + Send + 'static {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(user))
        }
    }

    fn failing_loader() -> impl FnOnce() -> futures::future::Ready<anyhow::Result<User>> + Send + 'static
    {
        || futures::future::ready(Err(anyhow::anyhow!("downstream unavailable")))
    }

    #[tokio::test(start_paused = true)]
    async fn test_miss_loads_once_and_stores_fresh_entry() {
        let cache = cache(false);
        let calls = Arc::new(AtomicUsize::new(0));

        let loaded = cache
            .load("u:1", Encoding::Json, counting_loader(&calls, yan()))
            .await
            .unwrap();
        assert_eq!(loaded.value, yan());
        assert_eq!(loaded.outcome, LoadOutcome::Loaded);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let (user, status) = cache.get_with_status::<User>("u:1").unwrap();
        assert_eq!(user, yan());
        assert_eq!(status, EntryStatus::Fresh);

        let again = cache
            .load("u:1", Encoding::Json, counting_loader(&calls, yan()))
            .await
            .unwrap();
        assert_eq!(again.outcome, LoadOutcome::Hit);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_share_one_load() {
        let cache = cache(false);
        let calls = Arc::new(AtomicUsize::new(0));

        let callers = (0..16).map(|_| {
            let calls = Arc::clone(&calls);
            cache.load("u:1", Encoding::Json, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(20)).await;
                Ok::<_, anyhow::Error>(yan())
            })
        });
        let results = join_all(callers).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let outcomes: Vec<_> = results
            .into_iter()
            .map(|result| {
                let loaded = result.unwrap();
                assert_eq!(loaded.value, yan());
                loaded.outcome
            })
            .collect();
        assert_eq!(outcomes.iter().filter(|o| **o == LoadOutcome::Loaded).count(), 1);
        assert_eq!(outcomes.iter().filter(|o| **o == LoadOutcome::Joined).count(), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_failures_see_the_same_error() {
        let cache = cache(true);
        let calls = Arc::new(AtomicUsize::new(0));

        let callers = (0..4).map(|_| {
            let calls = Arc::clone(&calls);
            cache.get_or_load::<User, _, _, _>("u:1", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(20)).await;
                Err(anyhow::anyhow!("downstream unavailable"))
            })
        });
        let results = join_all(callers).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            let err = result.unwrap_err();
            assert_eq!(err.to_string(), "loader failed: downstream unavailable");
        }
        // A failed load writes nothing, and with no prior entry there is
        // nothing stale to serve.
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_then_read_within_window_is_a_hit() {
        let cache = cache(false);
        cache.set("u:1", &yan()).unwrap();

        let loaded = cache
            .load("u:1", Encoding::Json, failing_loader())
            .await
            .unwrap();
        assert_eq!(loaded.value, yan());
        assert_eq!(loaded.outcome, LoadOutcome::Hit);
        assert_eq!(&cache.get_bytes("u:1").unwrap()[..], br#"{"n":"Yan"}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_with_failing_loader() {
        // Fallback disabled: the loader's error is returned.
        let strict = cache(false);
        strict.set("u:1", &yan()).unwrap();
        advance(Duration::from_secs(3)).await;
        let err = strict
            .get_or_load("u:1", failing_loader())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::LoaderFailed(_)));

        // Fallback enabled: the expired value is served.
        let lenient = cache(true);
        lenient.set("u:1", &yan()).unwrap();
        advance(Duration::from_secs(3)).await;
        let loaded = lenient
            .load("u:1", Encoding::Json, failing_loader())
            .await
            .unwrap();
        assert_eq!(loaded.value, yan());
        assert_eq!(loaded.outcome, LoadOutcome::Stale);

        // The failure did not overwrite the expired entry.
        let (_, status) = lenient.get_with_status::<User>("u:1").unwrap();
        assert_eq!(status, EntryStatus::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaimed_entry_behaves_like_never_set() {
        let cache = cache(true);
        cache.set("u:1", &yan()).unwrap();
        advance(Duration::from_secs(3)).await;
        assert_eq!(cache.reclaim(), 1);

        let err = cache
            .get_or_load("u:1", failing_loader())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::LoaderFailed(_)));
        assert!(matches!(cache.get::<User>("u:1"), Err(CacheError::NotFound)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_refreshed() {
        let cache = cache(true);
        let calls = Arc::new(AtomicUsize::new(0));
        cache.set("u:1", &yan()).unwrap();
        advance(Duration::from_secs(3)).await;

        let fresh = User { n: "Lin".into() };
        let loaded = cache
            .load("u:1", Encoding::Json, counting_loader(&calls, fresh.clone()))
            .await
            .unwrap();
        assert_eq!(loaded.value, fresh);
        assert_eq!(loaded.outcome, LoadOutcome::Loaded);
        assert_eq!(cache.get_with_status::<User>("u:1").unwrap(), (fresh, EntryStatus::Fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_forces_a_load() {
        let cache = cache(true);
        let calls = Arc::new(AtomicUsize::new(0));
        cache.set("u:1", &yan()).unwrap();

        cache.delete("u:1").unwrap();
        assert!(matches!(cache.delete("u:1"), Err(CacheError::NotFound)));

        let loaded = cache
            .load("u:1", Encoding::Json, counting_loader(&calls, yan()))
            .await
            .unwrap();
        assert_eq!(loaded.outcome, LoadOutcome::Loaded);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_joiner_with_different_type_gets_type_mismatch() {
        let cache = cache(true);

        let leader = cache.get_or_load("k", || async {
            sleep(Duration::from_millis(20)).await;
            Ok::<_, anyhow::Error>(yan())
        });
        let joiner = cache.get_or_load("k", || async { Ok::<_, anyhow::Error>(42u32) });
        let (leader, joiner) = futures::join!(leader, joiner);

        assert_eq!(leader.unwrap(), yan());
        assert!(matches!(
            joiner,
            Err(CacheError::TypeMismatch { found, .. }) if found.ends_with("User")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loader_error_is_kept_verbatim() {
        #[derive(Debug, thiserror::Error)]
        #[error("rpc timed out")]
        struct RpcTimeout;

        let cache = cache(false);
        let err = cache
            .get_or_load::<User, _, _, _>("u:1", || async { Err(RpcTimeout) })
            .await
            .unwrap_err();

        let source = err.loader_error().unwrap();
        assert!(source.downcast_ref::<RpcTimeout>().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loader_panic_falls_back_to_stale() {
        async fn buggy_loader() -> anyhow::Result<User> {
            panic!("loader bug")
        }

        let cache = cache(true);
        cache.set("u:1", &yan()).unwrap();
        advance(Duration::from_secs(3)).await;

        let loaded = cache
            .load("u:1", Encoding::Json, buggy_loader)
            .await
            .unwrap();
        assert_eq!(loaded.outcome, LoadOutcome::Stale);

        let err = cache
            .get_or_load("u:2", buggy_loader)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::LoaderPanicked(message) if message == "loader bug"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_entry_is_reloaded() {
        let cache = cache(false);
        let calls = Arc::new(AtomicUsize::new(0));
        cache.set_bytes("u:1", "not json").unwrap();

        let loaded = cache
            .load("u:1", Encoding::Json, counting_loader(&calls, yan()))
            .await
            .unwrap();
        assert_eq!(loaded.outcome, LoadOutcome::Loaded);
        assert_eq!(cache.get::<User>("u:1").unwrap(), yan());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_key_is_rejected() {
        let cache = cache(false);
        let err = cache.get_or_load("", failing_loader()).await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey(_)));
        assert!(matches!(cache.set("", &yan()), Err(CacheError::InvalidKey(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_yaml_encoding() {
        let cache = cache(false);
        let loaded = cache
            .load("u:1", Encoding::Yaml, || async { Ok::<_, anyhow::Error>(yan()) })
            .await
            .unwrap();
        assert_eq!(loaded.value, yan());
        assert_eq!(&cache.get_bytes("u:1").unwrap()[..], b"n: Yan\n");
    }

    #[test]
    fn test_accessors_pass_through() {
        let cache = cache(false);
        cache.set("a", &1u32).unwrap();
        cache.set("b", &2u32).unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.capacity(), 4);
        assert_eq!(cache.get::<u32>("b").unwrap(), 2);
        assert_eq!(cache.stats().hits, 1);

        let mut keys: Vec<_> = cache.entries().into_iter().map(|entry| entry.key).collect();
        keys.sort();
        assert_eq!(keys, ["a", "b"]);

        cache.reset();
        assert!(cache.is_empty());
        cache.close();
    }

    #[test]
    fn test_close_stops_janitor() {
        let config = CacheConfig::ephemeral(Duration::from_secs(1))
            .clean_window(Duration::from_millis(50));
        let cache = LocalCache::new("janitor", config).unwrap();
        assert!(cache.has_janitor());

        cache.close();
        assert!(!cache.has_janitor());
        cache.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unstorable_value_still_returned() {
        let config = CacheConfig::ephemeral(Duration::from_secs(1))
            .shards(1)
            .hard_max_cache_size(1);
        let cache = LocalCache::new("tiny", config).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            let value: String = cache
                .get_or_load("big", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>("x".repeat(2 * MIB))
                })
                .await
                .unwrap();
            assert_eq!(value.len(), 2 * MIB);
        }

        // Nothing was stored, so the second call loaded again.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
        assert!(matches!(cache.get_bytes("big"), Err(CacheError::NotFound)));
    }
}
