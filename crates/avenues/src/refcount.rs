//! Reference counting of outstanding interest per key.
//!
//! The [`RefcountTracker`] decides when production for a key has to be started (the first unit
//! of interest arrives) and when it may be cancelled (the last unit of interest goes away).

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use crate::sync::Synchronized;

/// A multiset over keys.
///
/// Keys with a count of zero are never stored, so the set only ever contains keys somebody is
/// interested in.
#[derive(Clone)]
pub struct CountedSet<K> {
    counts: HashMap<K, usize>,
}

impl<K> Default for CountedSet<K> {
    fn default() -> Self {
        Self {
            counts: HashMap::new(),
        }
    }
}

impl<K> CountedSet<K> {
    /// Removes all keys.
    pub fn clear_all(&mut self) {
        self.counts.clear();
    }

    /// The number of distinct keys with a non-zero count.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

impl<K: Eq + Hash> CountedSet<K> {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one unit for `key`, returning `true` if the count went from zero to one.
    pub fn increment(&mut self, key: K) -> bool {
        let count = self.counts.entry(key).or_default();
        *count += 1;
        *count == 1
    }

    /// Removes one unit for `key`, returning `true` if the count dropped to zero.
    ///
    /// Decrementing an absent key does nothing and returns `false`.
    pub fn decrement(&mut self, key: &K) -> bool {
        match self.counts.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.counts.remove(key);
                true
            }
            None => false,
        }
    }

    /// Removes `key` regardless of its count, returning whether it was present.
    pub fn clear(&mut self, key: &K) -> bool {
        self.counts.remove(key).is_some()
    }

    /// Returns the current count for `key`.
    pub fn count(&self, key: &K) -> usize {
        self.counts.get(key).copied().unwrap_or_default()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.counts.contains_key(key)
    }

}

impl<K: Eq + Hash> FromIterator<K> for CountedSet<K> {
    fn from_iter<I: IntoIterator<Item = K>>(iter: I) -> Self {
        let mut set = Self::new();
        for key in iter {
            set.increment(key);
        }
        set
    }
}

impl<K: fmt::Debug> fmt::Debug for CountedSet<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.counts.iter()).finish()
    }
}

/// A [`CountedSet`] that can be shared between threads.
///
/// Every operation is atomic with respect to all other operations on the same tracker.
#[derive(Debug)]
pub struct RefcountTracker<K> {
    set: Synchronized<CountedSet<K>>,
}

impl<K> Default for RefcountTracker<K> {
    fn default() -> Self {
        Self {
            set: Synchronized::new(CountedSet::default()),
        }
    }
}

impl<K> RefcountTracker<K> {
    pub fn clear_all(&self) {
        self.set.mutate(CountedSet::clear_all)
    }

    pub fn len(&self) -> usize {
        self.set.read_with(CountedSet::len)
    }

    pub fn is_empty(&self) -> bool {
        self.set.read_with(CountedSet::is_empty)
    }
}

impl<K: Eq + Hash> RefcountTracker<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one unit of interest for `key`.
    ///
    /// Returns `true` if this is the first interest in `key`, meaning that production has to be
    /// started.
    pub fn increment(&self, key: K) -> bool {
        self.set.mutate(|set| set.increment(key))
    }

    /// Removes one unit of interest for `key`.
    ///
    /// Returns `true` if nobody is interested in `key` anymore, meaning that production may be
    /// cancelled.
    pub fn decrement(&self, key: &K) -> bool {
        self.set.mutate(|set| set.decrement(key))
    }

    /// Drops all interest in `key` at once.
    ///
    /// A single completion satisfies everybody interested in the key, which is why completions
    /// clear instead of decrement.
    pub fn clear(&self, key: &K) -> bool {
        self.set.mutate(|set| set.clear(key))
    }

    pub fn count(&self, key: &K) -> usize {
        self.set.read_with(|set| set.count(key))
    }

    pub fn contains(&self, key: &K) -> bool {
        self.set.read_with(|set| set.contains(key))
    }

}
