use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use url::Url;

/// An object saved in the in-memory moka cache, together with its cost.
struct CachedObject<T> {
    object: Arc<T>,
    cost: u32,
}

// https://github.com/rust-lang/rust/issues/26925
impl<T> Clone for CachedObject<T> {
    fn clone(&self) -> Self {
        Self {
            object: Arc::clone(&self.object),
            cost: self.cost,
        }
    }
}

type InMemoryCache<T> = moka::sync::Cache<Url, CachedObject<T>>;

fn build_cache<T: Send + Sync + 'static>(capacity: u64) -> InMemoryCache<T> {
    InMemoryCache::builder()
        .name("objects")
        .max_capacity(capacity)
        .eviction_policy(EvictionPolicy::lru())
        .weigher(|_url, v: &CachedObject<T>| v.cost)
        .eviction_listener(|url, v, cause| {
            if cause == RemovalCause::Size {
                tracing::trace!(%url, cost = v.cost, "Evicted object from memory cache");
            }
        })
        .build()
}

/// A bounded, cost-accounted in-memory store of decoded objects.
///
/// All operations take `&self` and are safe to call concurrently.
pub struct ObjectCache<T> {
    cache: RwLock<InMemoryCache<T>>,
    capacity: AtomicU64,
}

impl<T> fmt::Debug for ObjectCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .cache
            .try_read()
            .map(|c| c.entry_count())
            .unwrap_or_default();
        f.debug_struct("ObjectCache")
            .field("capacity", &self.capacity.load(Ordering::Relaxed))
            .field("entries", &entries)
            .finish()
    }
}

impl<T: Send + Sync + 'static> ObjectCache<T> {
    /// Creates an empty cache that holds objects with a total cost of at most `capacity`.
    pub fn new(capacity: u64) -> Self {
        Self {
            cache: RwLock::new(build_cache(capacity)),
            capacity: AtomicU64::new(capacity),
        }
    }

    /// Runs `f` on the current moka cache, holding off a concurrent [`set_capacity`](Self::set_capacity)
    /// until it returns.
    fn with_cache<R>(&self, f: impl FnOnce(&InMemoryCache<T>) -> R) -> R {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        f(&cache)
    }

    /// The configured capacity, in cost units.
    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Looks up the object cached for `url`.
    pub fn get(&self, url: &Url) -> Option<Arc<T>> {
        self.with_cache(|cache| cache.get(url).map(|cached| cached.object))
    }

    /// Returns `true` if an object is currently cached for `url`.
    pub fn contains(&self, url: &Url) -> bool {
        self.with_cache(|cache| cache.contains_key(url))
    }

    /// Caches `object` for `url` with the given `cost`.
    ///
    /// Least recently used entries are evicted until the total cost fits into the capacity again.
    /// If the object alone costs more than the whole capacity it is dropped instead, together with
    /// any older object cached for the same `url`. Returns whether the object was cached.
    pub fn put(&self, url: Url, object: Arc<T>, cost: u32) -> bool {
        self.with_cache(|cache| {
            if u64::from(cost) > self.capacity() {
                tracing::debug!(%url, cost, "Object exceeds memory cache capacity");
                cache.invalidate(&url);
                return false;
            }

            cache.insert(url, CachedObject { object, cost });
            // apply the size bound right away instead of waiting for moka's housekeeping
            cache.run_pending_tasks();
            metric!(gauge("cache.weighted_size") = cache.weighted_size());
            true
        })
    }

    /// Removes every cached object.
    pub fn clear(&self) {
        self.with_cache(|cache| {
            cache.invalidate_all();
            cache.run_pending_tasks();
        });
        tracing::debug!("Cleared memory cache");
    }

    /// Changes the capacity and immediately re-applies it to the cached objects.
    ///
    /// When shrinking, entries are evicted until the remaining ones fit.
    pub fn set_capacity(&self, capacity: u64) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let resized = build_cache(capacity);
        for (url, cached) in cache.iter() {
            if u64::from(cached.cost) <= capacity {
                resized.insert((*url).clone(), cached);
            }
        }
        resized.run_pending_tasks();
        *cache = resized;
        self.capacity.store(capacity, Ordering::Relaxed);
    }

    /// The total cost of all cached objects.
    pub fn weighted_size(&self) -> u64 {
        self.with_cache(|cache| {
            cache.run_pending_tasks();
            cache.weighted_size()
        })
    }

    /// The number of cached objects.
    pub fn entry_count(&self) -> u64 {
        self.with_cache(|cache| {
            cache.run_pending_tasks();
            cache.entry_count()
        })
    }
}
