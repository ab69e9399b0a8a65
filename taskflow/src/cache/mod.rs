//! Keyed query cache with coalesced loads and optimistic patches.
//!
//! Values are stored type-erased behind `Arc<dyn Any>` and recovered by the
//! caller's type parameter. At most one load per key runs at a time; it runs
//! in its own task so a caller that gives up waiting does not abort it.
//!
//! Every invalidation bumps the key's generation. A load remembers the
//! generation it started at; if the key was invalidated while it ran, the
//! result is stored but the entry stays stale and the next read (or an
//! active watcher) refetches.
//!
//! [`QueryCache::clear`] starts a new epoch. Loads spawned in an earlier
//! epoch finish without touching the cache, so nothing fetched for one
//! session survives into the next.

mod key;

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub use key::CacheKey;

use crate::http::ApiError;

/// How long fetched data counts as fresh by default.
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(30);

/// How long an entry nobody watches is kept after its last use.
pub const DEFAULT_GC_TIME: Duration = Duration::from_secs(300);

type Erased = Arc<dyn Any + Send + Sync>;
type Outcome = Result<Erased, ApiError>;
type Loader = Arc<dyn Fn() -> BoxFuture<'static, Outcome> + Send + Sync>;

/// A typed view of one cached value.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    /// Key the value is stored under.
    pub key: CacheKey,
    /// The value.
    pub data: Arc<T>,
    /// When the value was loaded or last patched.
    pub fetched_at: Instant,
    /// Whether the value must be refetched before it is trusted.
    pub is_stale: bool,
}

/// Value captured by [`QueryCache::set_optimistic`], used to undo the patch.
pub struct Snapshot {
    key: CacheKey,
    data: Erased,
    fetched_at: Instant,
}

impl Snapshot {
    /// Key the snapshot belongs to.
    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

struct Stored {
    data: Erased,
    fetched_at: Instant,
    generation: u64,
}

struct InFlight {
    generation: u64,
    rx: watch::Receiver<Option<Outcome>>,
}

struct Slot {
    value: Option<Stored>,
    stale: bool,
    generation: u64,
    in_flight: Option<InFlight>,
    last_error: Option<ApiError>,
    watchers: usize,
    refetch: Option<Loader>,
    version: watch::Sender<u64>,
    touched: Instant,
}

impl Slot {
    fn new() -> Self {
        Self {
            value: None,
            stale: false,
            generation: 0,
            in_flight: None,
            last_error: None,
            watchers: 0,
            refetch: None,
            version: watch::channel(0).0,
            touched: Instant::now(),
        }
    }

    fn is_fresh(&self, stale_time: Duration) -> bool {
        !self.stale
            && self
                .value
                .as_ref()
                .is_some_and(|v| v.fetched_at.elapsed() < stale_time)
    }

    /// In-flight load for the current generation whose task is still alive.
    fn joinable(&self) -> Option<watch::Receiver<Option<Outcome>>> {
        self.in_flight
            .as_ref()
            .filter(|f| f.generation == self.generation && f.rx.has_changed().is_ok())
            .map(|f| f.rx.clone())
    }

    /// Whether a load task of any generation is still running.
    fn loading(&self) -> bool {
        self.in_flight.as_ref().is_some_and(|f| f.rx.has_changed().is_ok())
    }

    fn collectable(&self, gc_time: Duration) -> bool {
        self.watchers == 0 && !self.loading() && self.touched.elapsed() >= gc_time
    }

    fn notify(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }
}

struct Inner {
    slots: Mutex<HashMap<CacheKey, Slot>>,
    /// Bumped by `clear`, only while `slots` is locked.
    epoch: AtomicU64,
    stale_time: Duration,
    gc_time: Duration,
}

impl Inner {
    /// Drop unwatched, idle entries older than `gc_time`.
    fn sweep(&self, slots: &mut HashMap<CacheKey, Slot>) {
        let before = slots.len();
        slots.retain(|_, slot| !slot.collectable(self.gc_time));
        let removed = before - slots.len();
        if removed > 0 {
            tracing::trace!(removed, "collected idle cache entries");
        }
    }
}

/// Shared query cache. Cheap to clone.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.inner.slots.lock().len())
            .field("stale_time", &self.inner.stale_time)
            .finish()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_TIME)
    }
}

fn erase_loader<T, F, Fut>(loader: F) -> BoxFuture<'static, Outcome>
where
    T: Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
{
    let fut = loader();
    async move { fut.await.map(|v| Arc::new(v) as Erased) }.boxed()
}

fn downcast<T: Send + Sync + 'static>(key: &CacheKey, data: &Erased) -> Result<Arc<T>, ApiError> {
    Arc::clone(data)
        .downcast::<T>()
        .map_err(|_| ApiError::Decode(format!("cache entry {key} holds a different type")))
}

impl QueryCache {
    /// Empty cache whose entries stay fresh for `stale_time`.
    #[must_use]
    pub fn new(stale_time: Duration) -> Self {
        Self::with_gc_time(stale_time, DEFAULT_GC_TIME)
    }

    /// Like [`new`](Self::new), keeping unwatched entries for `gc_time`
    /// after their last use.
    #[must_use]
    pub fn with_gc_time(stale_time: Duration, gc_time: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(HashMap::new()),
                epoch: AtomicU64::new(0),
                stale_time,
                gc_time,
            }),
        }
    }

    /// Number of entries currently held, watched or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.slots.lock().len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached value for `key`, fresh or not. `None` when absent or stored
    /// under a different type.
    #[must_use]
    pub fn get<T: Send + Sync + 'static>(&self, key: &CacheKey) -> Option<CacheEntry<T>> {
        let slots = self.inner.slots.lock();
        let slot = slots.get(key)?;
        let stored = slot.value.as_ref()?;
        let data = downcast::<T>(key, &stored.data).ok()?;
        Some(CacheEntry {
            key: key.clone(),
            data,
            fetched_at: stored.fetched_at,
            is_stale: !slot.is_fresh(self.inner.stale_time),
        })
    }

    /// Return fresh data for `key`, loading it with `loader` otherwise.
    ///
    /// Concurrent callers for the same key share one load; `loader` is only
    /// invoked by the caller that starts it.
    ///
    /// # Errors
    ///
    /// The loader's error, shared by every caller waiting on that load.
    pub async fn fetch<T, F, Fut>(&self, key: CacheKey, loader: F) -> Result<Arc<T>, ApiError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let mut rx = {
            let mut slots = self.inner.slots.lock();
            self.inner.sweep(&mut slots);
            let slot = slots.entry(key.clone()).or_insert_with(Slot::new);
            slot.touched = Instant::now();
            if slot.is_fresh(self.inner.stale_time)
                && let Some(stored) = &slot.value
            {
                return downcast(&key, &stored.data);
            }
            match slot.joinable() {
                Some(rx) => {
                    tracing::trace!(%key, "joining in-flight load");
                    rx
                }
                None => self.start_load(&key, slot, erase_loader(loader)),
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(done) => done.clone(),
            Err(_) => None,
        };
        match outcome {
            Some(Ok(data)) => downcast(&key, &data),
            Some(Err(e)) => Err(e),
            None => Err(ApiError::Cancelled),
        }
    }

    /// [`fetch`](Self::fetch) that stops waiting when `cancel` fires. The
    /// load itself keeps running and still populates the cache.
    ///
    /// # Errors
    ///
    /// [`ApiError::Cancelled`] if `cancel` fired first, otherwise as
    /// [`fetch`](Self::fetch).
    pub async fn fetch_cancellable<T, F, Fut>(
        &self,
        key: CacheKey,
        loader: F,
        cancel: &CancellationToken,
    ) -> Result<Arc<T>, ApiError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        tokio::select! {
            biased;
            res = self.fetch(key, loader) => res,
            () = cancel.cancelled() => Err(ApiError::Cancelled),
        }
    }

    /// Mark `key` stale. Watched keys refetch immediately. Unknown keys are
    /// ignored.
    pub fn invalidate(&self, key: &CacheKey) {
        let mut slots = self.inner.slots.lock();
        if let Some(slot) = slots.get_mut(key) {
            self.invalidate_slot(key, slot);
        }
    }

    /// Invalidate every key matching `pred`. Returns how many matched.
    pub fn invalidate_matching(&self, pred: impl Fn(&CacheKey) -> bool) -> usize {
        let mut slots = self.inner.slots.lock();
        let mut count = 0;
        for (key, slot) in slots.iter_mut().filter(|(k, _)| pred(k)) {
            self.invalidate_slot(key, slot);
            count += 1;
        }
        count
    }

    /// Patch the cached value in place, returning what it held before.
    /// `None` when nothing of type `T` is cached under `key`.
    pub fn set_optimistic<T>(&self, key: &CacheKey, updater: impl FnOnce(&mut T)) -> Option<Snapshot>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut slots = self.inner.slots.lock();
        let slot = slots.get_mut(key)?;
        let stored = slot.value.as_mut()?;
        let current = downcast::<T>(key, &stored.data).ok()?;
        let snapshot = Snapshot {
            key: key.clone(),
            data: Arc::clone(&stored.data),
            fetched_at: stored.fetched_at,
        };
        let mut patched = (*current).clone();
        updater(&mut patched);
        stored.data = Arc::new(patched);
        slot.touched = Instant::now();
        slot.notify();
        Some(snapshot)
    }

    /// Put a snapshot's value back. A no-op if the key was cleared since.
    pub fn restore(&self, snapshot: Snapshot) {
        let mut slots = self.inner.slots.lock();
        let Some(slot) = slots.get_mut(&snapshot.key) else {
            return;
        };
        if let Some(stored) = slot.value.as_mut() {
            stored.data = snapshot.data;
            stored.fetched_at = snapshot.fetched_at;
            slot.notify();
            tracing::debug!(key = %snapshot.key, "optimistic patch reverted");
        }
    }

    /// Drop every cached value. Watched keys survive empty so their handles
    /// keep working after a new login. Loads still running are disowned.
    pub fn clear(&self) {
        let mut slots = self.inner.slots.lock();
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        slots.retain(|_, slot| slot.watchers > 0);
        for slot in slots.values_mut() {
            slot.value = None;
            slot.last_error = None;
            slot.stale = true;
            slot.generation += 1;
            slot.in_flight = None;
            slot.notify();
        }
        tracing::debug!("query cache cleared");
    }

    /// Subscribe to `key`, loading it now if needed and again after every
    /// invalidation until the last handle for the key drops.
    #[must_use]
    pub fn watch<T, F, Fut>(&self, key: CacheKey, loader: F) -> QueryHandle<T>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let loader: Loader = Arc::new(move || erase_loader(&loader));
        let mut slots = self.inner.slots.lock();
        self.inner.sweep(&mut slots);
        let slot = slots.entry(key.clone()).or_insert_with(Slot::new);
        slot.touched = Instant::now();
        slot.watchers += 1;
        slot.refetch = Some(Arc::clone(&loader));
        let rx = slot.version.subscribe();
        if !slot.is_fresh(self.inner.stale_time) && slot.joinable().is_none() {
            self.start_load(&key, slot, loader());
        }
        QueryHandle {
            cache: self.clone(),
            key,
            rx,
            _marker: PhantomData,
        }
    }

    fn invalidate_slot(&self, key: &CacheKey, slot: &mut Slot) {
        slot.generation += 1;
        slot.stale = true;
        tracing::debug!(%key, generation = slot.generation, "invalidated");
        if slot.watchers > 0
            && let Some(loader) = slot.refetch.clone()
        {
            self.start_load(key, slot, loader());
        }
    }

    /// Spawn a load for the slot's current generation. Called with the
    /// slot lock held; the load itself never takes it until it finishes.
    fn start_load(
        &self,
        key: &CacheKey,
        slot: &mut Slot,
        fut: BoxFuture<'static, Outcome>,
    ) -> watch::Receiver<Option<Outcome>> {
        let (tx, rx) = watch::channel(None);
        let generation = slot.generation;
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::debug!(%key, "no runtime, load skipped");
            return rx;
        }
        slot.in_flight = Some(InFlight {
            generation,
            rx: rx.clone(),
        });
        tracing::debug!(%key, generation, "loading");

        let inner = Arc::clone(&self.inner);
        let key = key.clone();
        tokio::spawn(async move {
            let mut outcome = fut.await;
            let follow_up = {
                let mut slots = inner.slots.lock();
                match slots.get_mut(&key) {
                    Some(slot) if inner.epoch.load(Ordering::SeqCst) == epoch => {
                        store_outcome(&key, slot, generation, &outcome)
                    }
                    _ => {
                        tracing::debug!(%key, generation, "cache cleared during load, result dropped");
                        outcome = Err(ApiError::Cancelled);
                        None
                    }
                }
            };
            // Waiters wake only after the slot is updated.
            let _ = tx.send(Some(outcome));
            if let Some(loader) = follow_up {
                let cache = QueryCache { inner };
                let mut slots = cache.inner.slots.lock();
                if let Some(slot) = slots.get_mut(&key)
                    && slot.joinable().is_none()
                {
                    cache.start_load(&key, slot, loader());
                }
            }
        });
        rx
    }
}

/// Apply a finished load to its slot. Returns a loader when a watched entry
/// is still stale and needs another round.
fn store_outcome(key: &CacheKey, slot: &mut Slot, generation: u64, outcome: &Outcome) -> Option<Loader> {
    if slot.in_flight.as_ref().is_some_and(|f| f.generation == generation) {
        slot.in_flight = None;
    }
    match outcome {
        Ok(data) => {
            let newer_stored = slot.value.as_ref().is_some_and(|v| v.generation > generation);
            if newer_stored {
                tracing::debug!(%key, generation, "discarding result older than cached data");
            } else {
                slot.value = Some(Stored {
                    data: Arc::clone(data),
                    fetched_at: Instant::now(),
                    generation,
                });
                slot.stale = generation != slot.generation;
                slot.last_error = None;
                if slot.stale {
                    tracing::debug!(%key, generation, current = slot.generation, "stored result invalidated mid-flight");
                }
            }
        }
        Err(e) => {
            tracing::debug!(%key, err = %e, "load failed");
            slot.last_error = Some(e.clone());
        }
    }
    slot.notify();

    let retry = slot.stale && slot.watchers > 0 && outcome.is_ok();
    if retry { slot.refetch.clone() } else { None }
}

/// Live subscription to one key, returned by [`QueryCache::watch`].
pub struct QueryHandle<T> {
    cache: QueryCache,
    key: CacheKey,
    rx: watch::Receiver<u64>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for QueryHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle").field("key", &self.key).finish()
    }
}

impl<T: Send + Sync + 'static> QueryHandle<T> {
    /// Watched key.
    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Current value, if any has been loaded.
    #[must_use]
    pub fn current(&self) -> Option<Arc<T>> {
        self.cache.get::<T>(&self.key).map(|e| e.data)
    }

    /// Error of the most recent failed load, cleared by the next success.
    #[must_use]
    pub fn error(&self) -> Option<ApiError> {
        self.cache
            .inner
            .slots
            .lock()
            .get(&self.key)
            .and_then(|s| s.last_error.clone())
    }

    /// Wait until the entry changes, then return its value.
    pub async fn changed(&mut self) -> Option<Arc<T>> {
        self.rx.changed().await.ok()?;
        self.current()
    }

    /// Current value, waiting for the first load if there is none yet.
    /// `None` if the load fails.
    pub async fn ready(&mut self) -> Option<Arc<T>> {
        loop {
            self.rx.borrow_and_update();
            if let Some(v) = self.current() {
                return Some(v);
            }
            if self.error().is_some() {
                return None;
            }
            self.rx.changed().await.ok()?;
        }
    }
}

impl<T> Drop for QueryHandle<T> {
    fn drop(&mut self) {
        let mut slots = self.cache.inner.slots.lock();
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.watchers = slot.watchers.saturating_sub(1);
            if slot.watchers == 0 {
                slot.refetch = None;
                if slot.loading() {
                    // Left for the sweep once the load lands.
                    slot.touched = Instant::now();
                } else {
                    slots.remove(&self.key);
                    tracing::trace!(key = %self.key, "last watcher released entry");
                }
            }
        }
    }
}
