//! Registry of claims: which claimer waits for which key, and whom to call once it arrives.
//!
//! Every claimer holds at most one claim. The registry keeps a forward map from claimer to claim
//! and a reverse index from key to claimers, and updates both inside the same critical section.
//!
//! Callbacks are never invoked by the registry itself. [`ClaimRegistry::claims_for_key`] takes a
//! snapshot under the lock and hands it out, so that the callbacks can be invoked after the lock
//! has been released and are free to call back into the avenue.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use crate::sync::Synchronized;
use crate::types::ResourceState;

/// The callback of a claim.
pub type ClaimCallback<V> = Arc<dyn Fn(ResourceState<V>) + Send + Sync>;

/// Tells whether the owner of a claim is still around.
///
/// Claims whose liveness check fails are dropped instead of being notified.
pub type Liveness = Arc<dyn Fn() -> bool + Send + Sync>;

struct Claim<K, V> {
    key: K,
    callback: ClaimCallback<V>,
    liveness: Option<Liveness>,
    /// Distinguishes this claim from later claims of the same claimer.
    generation: u64,
    /// Set once the claim was handed out for notification.
    notified: bool,
}

struct Claims<C, K, V> {
    by_claimer: HashMap<C, Claim<K, V>>,
    by_key: HashMap<K, HashSet<C>>,
    next_generation: u64,
}

impl<C, K, V> Default for Claims<C, K, V> {
    fn default() -> Self {
        Self {
            by_claimer: HashMap::new(),
            by_key: HashMap::new(),
            next_generation: 0,
        }
    }
}

impl<C: Eq + Hash + Clone, K: Eq + Hash + Clone, V> Claims<C, K, V> {
    fn unindex(&mut self, claimer: &C, key: &K) {
        if let Some(claimers) = self.by_key.get_mut(key) {
            claimers.remove(claimer);
            if claimers.is_empty() {
                self.by_key.remove(key);
            }
        }
    }

    fn remove(&mut self, claimer: &C) -> Option<Claim<K, V>> {
        let claim = self.by_claimer.remove(claimer)?;
        self.unindex(claimer, &claim.key);
        Some(claim)
    }
}

/// A claim that is about to be notified.
///
/// Handed out by [`ClaimRegistry::claims_for_key`].
pub struct ClaimNotice<C, V> {
    claimer: C,
    generation: u64,
    callback: ClaimCallback<V>,
    liveness: Option<Liveness>,
}

impl<C, V> ClaimNotice<C, V> {
    pub fn claimer(&self) -> &C {
        &self.claimer
    }

    /// Runs the liveness check of the claim, if it has one.
    pub fn is_alive(&self) -> bool {
        self.liveness.as_ref().is_none_or(|alive| alive())
    }

    /// Gives up the notice, returning the callback to invoke.
    pub fn into_callback(self) -> ClaimCallback<V> {
        self.callback
    }
}

impl<C: fmt::Debug, V> fmt::Debug for ClaimNotice<C, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimNotice")
            .field("claimer", &self.claimer)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Maps claimers to the key they wait for, and keys to their waiting claimers.
pub struct ClaimRegistry<C, K, V> {
    claims: Synchronized<Claims<C, K, V>>,
}

impl<C, K, V> Default for ClaimRegistry<C, K, V> {
    fn default() -> Self {
        Self {
            claims: Synchronized::new(Claims::default()),
        }
    }
}

impl<C, K, V> ClaimRegistry<C, K, V> {
    /// The number of registered claims.
    pub fn len(&self) -> usize {
        self.claims.read_with(|claims| claims.by_claimer.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every claim.
    pub fn clear(&self) {
        self.claims.mutate(|claims| {
            claims.by_claimer.clear();
            claims.by_key.clear();
        })
    }
}

impl<C, K, V> ClaimRegistry<C, K, V>
where
    C: Eq + Hash + Clone,
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a claim of `claimer` on `key`.
    ///
    /// Any previous claim of the same claimer is replaced, and its key is returned.
    pub fn set_claim(&self, claimer: C, key: K, callback: ClaimCallback<V>) -> Option<K> {
        self.set_claim_with(claimer, key, None, callback)
    }

    /// Registers a claim with an optional liveness check.
    ///
    /// See [`set_claim`](Self::set_claim).
    pub fn set_claim_with(
        &self,
        claimer: C,
        key: K,
        liveness: Option<Liveness>,
        callback: ClaimCallback<V>,
    ) -> Option<K> {
        self.claims.mutate(|claims| {
            let previous = claims.remove(&claimer).map(|claim| claim.key);

            let generation = claims.next_generation;
            claims.next_generation += 1;

            claims
                .by_key
                .entry(key.clone())
                .or_default()
                .insert(claimer.clone());
            claims.by_claimer.insert(
                claimer,
                Claim {
                    key,
                    callback,
                    liveness,
                    generation,
                    notified: false,
                },
            );

            previous
        })
    }

    /// Removes the claim of `claimer`, returning whether there was one.
    pub fn remove_claim(&self, claimer: &C) -> bool {
        self.claims.mutate(|claims| claims.remove(claimer).is_some())
    }

    /// Removes the claim a notice was taken from, unless the claimer registered again since.
    pub fn remove_notified(&self, notice: &ClaimNotice<C, V>) -> bool {
        self.claims.mutate(|claims| {
            let current = claims.by_claimer.get(&notice.claimer);
            if current.is_some_and(|claim| claim.generation == notice.generation) {
                claims.remove(&notice.claimer);
                true
            } else {
                false
            }
        })
    }

    /// Returns a snapshot of all claims on `key` that were not notified yet.
    ///
    /// The returned claims are marked as notified, so every registration is handed out at most
    /// once, no matter how often a key completes.
    pub fn claims_for_key(&self, key: &K) -> Vec<ClaimNotice<C, V>> {
        self.claims.mutate(|claims| {
            let Claims {
                by_claimer, by_key, ..
            } = claims;
            let Some(claimers) = by_key.get(key) else {
                return Vec::new();
            };

            claimers
                .iter()
                .filter_map(|claimer| {
                    let claim = by_claimer.get_mut(claimer)?;
                    if claim.notified {
                        return None;
                    }
                    claim.notified = true;
                    Some(ClaimNotice {
                        claimer: claimer.clone(),
                        generation: claim.generation,
                        callback: Arc::clone(&claim.callback),
                        liveness: claim.liveness.clone(),
                    })
                })
                .collect()
        })
    }

    /// Returns the key `claimer` currently waits for.
    pub fn key_for(&self, claimer: &C) -> Option<K> {
        self.claims
            .read_with(|claims| claims.by_claimer.get(claimer).map(|claim| claim.key.clone()))
    }

    /// Returns all claimers with a claim on `key`, notified or not.
    pub fn claimers_for(&self, key: &K) -> Vec<C> {
        self.claims.read_with(|claims| {
            claims
                .by_key
                .get(key)
                .map(|claimers| claimers.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

}

impl<C, K, V> fmt::Debug for ClaimRegistry<C, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (claims, keys) = self
            .claims
            .read_with(|claims| (claims.by_claimer.len(), claims.by_key.len()));
        f.debug_struct("ClaimRegistry")
            .field("claims", &claims)
            .field("keys", &keys)
            .finish()
    }
}
