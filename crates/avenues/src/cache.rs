//! Storage for produced values.
//!
//! The avenue writes a value into its [`Cache`] once production succeeds and serves later
//! registrations from it. Eviction is entirely up to the cache implementation.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use crate::sync::Synchronized;

/// Stores completed values by key.
///
/// Implementations are internally synchronized and may be shared between threads.
pub trait Cache<K, V>: Send + Sync {
    /// Returns the value stored for `key`.
    fn get(&self, key: &K) -> Option<V>;

    /// Stores `value` for `key`, overwriting any previous value.
    fn set(&self, value: V, key: K);

    /// Removes the value for `key`, returning it.
    fn remove(&self, key: &K) -> Option<V>;

    /// Removes all values.
    fn clear(&self);
}

impl<K, V, C> Cache<K, V> for Arc<C>
where
    C: Cache<K, V> + ?Sized,
{
    fn get(&self, key: &K) -> Option<V> {
        (**self).get(key)
    }

    fn set(&self, value: V, key: K) {
        (**self).set(value, key)
    }

    fn remove(&self, key: &K) -> Option<V> {
        (**self).remove(key)
    }

    fn clear(&self) {
        (**self).clear()
    }
}

/// An unbounded in-memory cache.
///
/// Values are kept until they are removed explicitly.
pub struct MemoryCache<K, V> {
    values: Synchronized<HashMap<K, V>>,
}

impl<K, V> MemoryCache<K, V> {
    pub fn new() -> Self {
        Self {
            values: Synchronized::new(HashMap::new()),
        }
    }
}

impl<K, V> Default for MemoryCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> MemoryCache<K, V>
where
    K: Eq + Hash,
{
    /// The number of cached values.
    pub fn len(&self) -> usize {
        self.values.read_with(HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.values.read_with(HashMap::is_empty)
    }
}

impl<K, V> Cache<K, V> for MemoryCache<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K) -> Option<V> {
        self.values.read_with(|values| values.get(key).cloned())
    }

    fn set(&self, value: V, key: K) {
        self.values.mutate(|values| values.insert(key, value));
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.values.mutate(|values| values.remove(key))
    }

    fn clear(&self) {
        self.values.mutate(HashMap::clear)
    }
}

impl<K, V> fmt::Debug for MemoryCache<K, V>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCache")
            .field("len", &self.len())
            .finish()
    }
}

/// A size-bounded in-memory cache.
///
/// Once the capacity is reached, entries are evicted by [`moka`]'s policy. By default every entry
/// weighs one unit, so the capacity is the maximum number of entries.
pub struct BoundedCache<K, V> {
    values: moka::sync::Cache<K, V>,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache holding at most `capacity` entries.
    pub fn new(capacity: u64) -> Self {
        Self {
            values: moka::sync::Cache::new(capacity),
        }
    }

    /// Creates a cache bounded by the total weight of its entries.
    pub fn weighted<W>(capacity: u64, weigher: W) -> Self
    where
        W: Fn(&K, &V) -> u32 + Send + Sync + 'static,
    {
        let values = moka::sync::Cache::builder()
            .max_capacity(capacity)
            .weigher(weigher)
            .build();
        Self { values }
    }

    /// Runs pending maintenance, such as evictions, right away.
    pub fn run_pending_tasks(&self) {
        self.values.run_pending_tasks();
    }

    /// The approximate number of cached entries.
    pub fn entry_count(&self) -> u64 {
        self.values.entry_count()
    }
}

impl<K, V> Cache<K, V> for BoundedCache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Option<V> {
        self.values.get(key)
    }

    fn set(&self, value: V, key: K) {
        self.values.insert(key, value);
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.values.remove(key)
    }

    fn clear(&self) {
        self.values.invalidate_all();
    }
}

impl<K, V> fmt::Debug for BoundedCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedCache")
            .field("entry_count", &self.values.entry_count())
            .finish()
    }
}
