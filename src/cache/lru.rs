//! Fixed-capacity concurrent cache with least-recently-used eviction.

use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

/// A capacity-bounded associative cache, safe for concurrent use.
///
/// Both reads and writes count as "use" for eviction purposes. Every
/// operation locks the whole map, so each call is atomic with respect to
/// the others; the cache never grows past its capacity.
pub struct ConcurrentCache<K, V> {
    inner: Mutex<LruCache<K, V>>,
}

impl<K: Eq + Hash, V: Clone> ConcurrentCache<K, V> {
    /// Creates a cache holding at most `capacity` entries.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Looks up `key`, marking the entry as most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    /// Inserts an entry, returning the previous value for `key` if there
    /// was one. Inserting into a full cache evicts the least-recently-used
    /// entry.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        self.inner.lock().put(key, value)
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Current number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
