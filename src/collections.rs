//! Collection types used by the in-memory engines
//!
//! `HashMap`/`HashSet` switch between gxhash and std collections based on
//! the `gxhash` feature flag, so the crate builds on systems without the
//! CPU intrinsics (AES-NI, SSE2) gxhash needs.
//!
//! [`BoundedCache`] is the single cache type every engine uses for
//! transient state (decompressed content, compiled keyword patterns,
//! navigation history). It has a fixed capacity and evicts the oldest
//! written entry first. Eviction only ever drops rebuildable data.

#[cfg(feature = "gxhash")]
pub use gxhash::{HashMap as GxHashMap, HashMapExt, HashSet as GxHashSet, HashSetExt};

#[cfg(not(feature = "gxhash"))]
use std::collections::{HashMap as StdHashMap, HashSet as StdHashSet};

use std::collections::VecDeque;
use std::hash::Hash;

/// Type alias for HashMap that uses gxhash when available, std otherwise
#[cfg(feature = "gxhash")]
pub type HashMap<K, V> = GxHashMap<K, V>;

/// Type alias for HashMap that uses gxhash when available, std otherwise
#[cfg(not(feature = "gxhash"))]
pub type HashMap<K, V> = StdHashMap<K, V>;

/// Type alias for HashSet that uses gxhash when available, std otherwise
#[cfg(feature = "gxhash")]
pub type HashSet<T> = GxHashSet<T>;

/// Type alias for HashSet that uses gxhash when available, std otherwise
#[cfg(not(feature = "gxhash"))]
pub type HashSet<T> = StdHashSet<T>;

/// Extension trait for creating HashMap instances
#[cfg(not(feature = "gxhash"))]
pub trait HashMapExt {
    /// Creates a new HashMap with default capacity
    fn new() -> Self;

    /// Creates a new HashMap with specified capacity
    fn with_capacity(capacity: usize) -> Self;
}

#[cfg(not(feature = "gxhash"))]
impl<K, V> HashMapExt for StdHashMap<K, V> {
    fn new() -> Self {
        StdHashMap::new()
    }

    fn with_capacity(capacity: usize) -> Self {
        StdHashMap::with_capacity(capacity)
    }
}

/// Extension trait for creating HashSet instances
#[cfg(not(feature = "gxhash"))]
pub trait HashSetExt {
    /// Creates a new HashSet with default capacity
    fn new() -> Self;

    /// Creates a new HashSet with specified capacity
    fn with_capacity(capacity: usize) -> Self;
}

#[cfg(not(feature = "gxhash"))]
impl<T> HashSetExt for StdHashSet<T> {
    fn new() -> Self {
        StdHashSet::new()
    }

    fn with_capacity(capacity: usize) -> Self {
        StdHashSet::with_capacity(capacity)
    }
}

/// Fixed-capacity map with oldest-first eviction
///
/// Writing an existing key replaces its value and makes it the newest
/// entry. Reads never change eviction order.
///
/// # Examples
///
/// ```rust
/// use palimpsest::collections::BoundedCache;
///
/// let mut cache = BoundedCache::new(2);
/// cache.insert("a", 1);
/// cache.insert("b", 2);
/// cache.insert("c", 3); // evicts "a"
///
/// assert!(cache.get(&"a").is_none());
/// assert_eq!(cache.get(&"c"), Some(&3));
/// ```
#[derive(Debug, Clone)]
pub struct BoundedCache<K, V> {
    capacity: usize,
    entries: HashMap<K, V>,
    order: VecDeque<K>,
    evictions: u64,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a cache holding at most `capacity` entries
    ///
    /// A capacity of zero is bumped to one so the most recent write is
    /// always readable.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            evictions: 0,
        }
    }

    /// Insert or replace an entry, returning whatever was evicted
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if self.entries.insert(key.clone(), value).is_some() {
            self.order.retain(|k| k != &key);
        }
        self.order.push_back(key);

        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.evictions += 1;
                return self.entries.remove(&oldest).map(|v| (oldest, v));
            }
        }
        None
    }

    /// Look up an entry
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Look up an entry mutably
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    /// Check whether a key is cached
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove an entry
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.order.retain(|k| k != key);
        }
        removed
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of entries evicted since creation
    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eviction_is_oldest_first() {
        let mut cache = BoundedCache::new(3);
        cache.insert(1, "one");
        cache.insert(2, "two");
        cache.insert(3, "three");

        let evicted = cache.insert(4, "four");
        assert_eq!(evicted, Some((1, "one")));
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.evictions(), 1);
    }

    #[test]
    fn test_rewrite_refreshes_position() {
        let mut cache = BoundedCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("a", 10);

        // "b" is now the oldest write
        cache.insert("c", 3);
        assert!(!cache.contains_key(&"b"));
        assert_eq!(cache.get(&"a"), Some(&10));
    }

    #[test]
    fn test_zero_capacity_keeps_latest() {
        let mut cache = BoundedCache::new(0);
        cache.insert("x", 1);
        assert_eq!(cache.capacity(), 1);
        assert_eq!(cache.get(&"x"), Some(&1));
    }

    #[test]
    fn test_remove_and_clear() {
        let mut cache = BoundedCache::new(4);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.remove(&"a"), Some(1));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
