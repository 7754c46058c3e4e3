//! The avenue: coalesces requests for keyed resources into single productions.
//!
//! An [`Avenue`] accepts claims on keys. A claim on a cached key is answered right away. For any
//! other key, the claim waits, and the avenue makes sure exactly one production of the key is in
//! flight, no matter how many claims are waiting for it. Once the production completes, the value
//! is written to the cache and handed to every waiting claim.
//!
//! # Interest
//!
//! Every pending registration (and every [`force_load`](Avenue::force_load) or
//! [`preload`](Avenue::preload)) adds one unit of interest in its key. Production starts when the
//! first unit arrives and is cancelled when [`cancel`](Avenue::cancel) removes the last one. A
//! completion satisfies all interest in its key at once.
//!
//! # Consistency
//!
//! Checking the cache and registering interest happens inside the same critical section as
//! writing the cache and taking the snapshot of claims to notify. Therefore every registration
//! either observes the cached value, or is part of the snapshot of the completion that writes it.
//! Callbacks always run outside of that critical section, through the configured [`Delivery`].

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::cache::{BoundedCache, Cache, MemoryCache};
use crate::claims::{ClaimCallback, ClaimNotice, ClaimRegistry, Liveness};
use crate::config::{Config, DeliveryMode};
use crate::delivery::{Delivery, Dispatcher};
use crate::error::ProduceError;
use crate::observer::{AvenueObserver, TracingObserver};
use crate::producer::{Completion, ProduceResult, Producer};
use crate::refcount::RefcountTracker;
use crate::sync::Synchronized;
use crate::types::{ProcessingState, ResourceState};

/// Receives every failed production, along with its key.
pub type ErrorSink<K> = Arc<dyn Fn(&K, &ProduceError) + Send + Sync>;

struct Inner<C, K, V> {
    name: &'static str,
    producer: Arc<dyn Producer<K, V>>,
    cache: Arc<dyn Cache<K, V>>,
    claims: ClaimRegistry<C, K, V>,
    interest: RefcountTracker<K>,
    /// Serializes cache checks with registering interest, and cache writes with taking snapshots
    /// of claims.
    ///
    /// Lock order: gate, claims, interest.
    gate: Synchronized<()>,
    dispatcher: Dispatcher,
    observer: Arc<dyn AvenueObserver<K>>,
    on_error: Option<ErrorSink<K>>,
}

enum Registration<V> {
    Cached(V),
    Pending { first: bool },
}

impl<C, K, V> Inner<C, K, V>
where
    C: Eq + Hash + Clone + Send + Sync + 'static,
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn deliver(&self, callback: ClaimCallback<V>, state: ResourceState<V>) {
        self.dispatcher.dispatch(Box::new(move || callback(state)));
    }

    /// Starts production of `key`, unless the producer is already working on it.
    fn start(self: &Arc<Self>, key: K) {
        if self.producer.status(&key) == ProcessingState::Running {
            tracing::trace!(avenue = self.name, ?key, "production already running");
            return;
        }

        self.observer.started(&key);
        let completion = self.completion(key.clone());
        self.producer.start(key, completion);
    }

    /// Creates the completion handle for a production of `key`.
    ///
    /// The handle only holds on to the avenue weakly, a production outliving the avenue completes
    /// into the void.
    fn completion(self: &Arc<Self>, key: K) -> Completion<V> {
        let inner = Arc::downgrade(self);
        let started = Instant::now();
        Completion::new(move |result| {
            if let Some(inner) = Weak::upgrade(&inner) {
                inner.complete(key, result, started.elapsed());
            }
        })
    }

    fn complete(&self, key: K, result: ProduceResult<V>, elapsed: Duration) {
        match result {
            Ok(value) => {
                let notices = self.gate.mutate(|()| {
                    if !self.interest.clear(&key) {
                        return None;
                    }
                    self.cache.set(value.clone(), key.clone());
                    Some(self.claims.claims_for_key(&key))
                });
                let Some(notices) = notices else {
                    self.observer.stale_completion(&key);
                    return;
                };

                let delivered = self.fan_out(notices, ResourceState::Arrived(value));
                self.observer.arrived(&key, delivered, elapsed);
            }
            Err(error) => {
                let notices = self.gate.mutate(|()| {
                    if !self.interest.clear(&key) {
                        return None;
                    }
                    // Under the gate, so this never hits a production of a later registration.
                    self.producer.cancel(&key);
                    Some(self.claims.claims_for_key(&key))
                });
                let Some(notices) = notices else {
                    self.observer.stale_completion(&key);
                    return;
                };

                self.observer.failed(&key, &error, elapsed);

                if let Some(on_error) = &self.on_error {
                    let on_error = Arc::clone(on_error);
                    let key = key.clone();
                    let error = error.clone();
                    self.dispatcher
                        .dispatch(Box::new(move || on_error(&key, &error)));
                }

                self.fan_out(notices, ResourceState::Failed(error));
            }
        }
    }

    /// Delivers `state` to all claims still alive, returning how many there were.
    fn fan_out(&self, notices: Vec<ClaimNotice<C, V>>, state: ResourceState<V>) -> usize {
        let mut delivered = 0;
        for notice in notices {
            if !notice.is_alive() {
                self.claims.remove_notified(&notice);
                continue;
            }
            self.deliver(notice.into_callback(), state.clone());
            delivered += 1;
        }
        delivered
    }
}

impl<C, K, V> Drop for Inner<C, K, V> {
    fn drop(&mut self) {
        tracing::trace!(avenue = self.name, "tearing down avenue");
        self.claims.clear();
        self.interest.clear_all();
        self.producer.cancel_all();
    }
}

/// Coalesces requests for resources of type `V`, identified by keys of type `K`.
///
/// Claims are made by claimers of type `C`. Every claimer has at most one claim; registering a
/// claimer again replaces its previous claim.
///
/// The avenue is cheap to clone, all clones share the same state. Dropping the last clone drops
/// all claims and cancels all productions in flight.
pub struct Avenue<C, K, V> {
    inner: Arc<Inner<C, K, V>>,
}

impl<C, K, V> Clone for Avenue<C, K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C, K, V> Avenue<C, K, V>
where
    C: Eq + Hash + Clone + Send + Sync + 'static,
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates an avenue with inline delivery and the default observer.
    pub fn new<P, S>(producer: P, cache: S) -> Self
    where
        P: Producer<K, V> + 'static,
        S: Cache<K, V> + 'static,
    {
        Self::builder(producer).cache(cache).build()
    }

    /// Starts building an avenue around `producer`.
    pub fn builder<P>(producer: P) -> AvenueBuilder<C, K, V>
    where
        P: Producer<K, V> + 'static,
    {
        AvenueBuilder::new(Arc::new(producer))
    }

    /// Claims the resource at `key` for `claimer`.
    ///
    /// If the resource is cached, `callback` receives [`ResourceState::Existing`] right away.
    /// Otherwise it receives [`ResourceState::Processing`], followed by either
    /// [`ResourceState::Arrived`] or [`ResourceState::Failed`] once production completes.
    ///
    /// A pending claim keeps production of `key` alive until it is balanced by a call to
    /// [`cancel`](Self::cancel) or the production completes. Replacing or unregistering a claim
    /// does not cancel anything.
    pub fn register<F>(&self, claimer: C, key: K, callback: F)
    where
        F: Fn(ResourceState<V>) + Send + Sync + 'static,
    {
        self.register_claim(claimer, key, None, Arc::new(callback))
    }

    /// Claims the resource at `key`, as long as `liveness` returns `true`.
    ///
    /// Once `liveness` returns `false` at delivery time, the claim is dropped without notifying
    /// `callback`.
    pub fn register_with<L, F>(&self, claimer: C, key: K, liveness: L, callback: F)
    where
        L: Fn() -> bool + Send + Sync + 'static,
        F: Fn(ResourceState<V>) + Send + Sync + 'static,
    {
        self.register_claim(claimer, key, Some(Arc::new(liveness)), Arc::new(callback))
    }

    /// Claims the resource at `key` on behalf of `owner`.
    ///
    /// The avenue only holds on to `owner` weakly. Once the owner is gone, the claim is dropped
    /// at the next delivery.
    pub fn register_weak<O, F>(&self, claimer: C, key: K, owner: &Arc<O>, callback: F)
    where
        O: Send + Sync + 'static,
        F: Fn(&O, ResourceState<V>) + Send + Sync + 'static,
    {
        let owner = Arc::downgrade(owner);

        let alive = owner.clone();
        let liveness: Liveness = Arc::new(move || alive.strong_count() > 0);
        let callback: ClaimCallback<V> = Arc::new(move |state| {
            if let Some(owner) = owner.upgrade() {
                callback(&owner, state);
            }
        });

        self.register_claim(claimer, key, Some(liveness), callback)
    }

    fn register_claim(
        &self,
        claimer: C,
        key: K,
        liveness: Option<Liveness>,
        callback: ClaimCallback<V>,
    ) {
        let inner = &self.inner;

        if let Some(value) = inner.cache.get(&key) {
            inner
                .claims
                .set_claim_with(claimer, key.clone(), liveness, Arc::clone(&callback));
            inner.observer.cache_hit(&key);
            inner.deliver(callback, ResourceState::Existing(value));
            return;
        }

        // Goes out before the claim exists, so that no arrival can overtake it.
        inner.deliver(Arc::clone(&callback), ResourceState::Processing);

        let registration = inner.gate.mutate(|()| {
            let cached = inner.cache.get(&key);
            inner.claims.set_claim_with(
                claimer,
                key.clone(),
                liveness,
                Arc::clone(&callback),
            );
            match cached {
                Some(value) => Registration::Cached(value),
                None => Registration::Pending {
                    first: inner.interest.increment(key.clone()),
                },
            }
        });

        match registration {
            Registration::Cached(value) => {
                inner.observer.cache_hit(&key);
                inner.deliver(callback, ResourceState::Existing(value));
            }
            Registration::Pending { first: true } => inner.start(key),
            Registration::Pending { first: false } => inner.observer.coalesced(&key),
        }
    }

    /// Drops the claim of `claimer`, returning whether it had one.
    pub fn unregister(&self, claimer: &C) -> bool {
        self.inner.claims.remove_claim(claimer)
    }

    /// Produces `key` again, even if it is cached.
    ///
    /// The cached value stays available until the new one arrives. Claims on `key` that have not
    /// been notified of an arrival yet receive the new value.
    pub fn force_load(&self, key: K) {
        let inner = &self.inner;
        if inner.interest.increment(key.clone()) {
            inner.start(key);
        } else {
            inner.observer.coalesced(&key);
        }
    }

    /// Makes sure `key` ends up in the cache, without claiming it.
    pub fn preload(&self, key: K) {
        let inner = &self.inner;
        let first = inner.gate.mutate(|()| {
            if inner.cache.get(&key).is_some() {
                return None;
            }
            Some(inner.interest.increment(key.clone()))
        });

        match first {
            None => inner.observer.cache_hit(&key),
            Some(true) => inner.start(key),
            Some(false) => inner.observer.coalesced(&key),
        }
    }

    /// Gives up one unit of interest in `key`.
    ///
    /// Production is cancelled once nobody is interested in `key` anymore.
    pub fn cancel(&self, key: &K) {
        let inner = &self.inner;
        let released = inner.gate.mutate(|()| {
            let released = inner.interest.decrement(key);
            if released {
                inner.producer.cancel(key);
            }
            released
        });
        if released {
            inner.observer.cancelled(key);
        }
    }

    /// Gives up all interest in all keys, and cancels all productions.
    pub fn cancel_all(&self) {
        let inner = &self.inner;
        inner.gate.mutate(|()| {
            inner.interest.clear_all();
            inner.producer.cancel_all();
        });
    }

    /// Returns the processing state of `key`, as reported by the producer.
    pub fn status(&self, key: &K) -> ProcessingState {
        self.inner.producer.status(key)
    }

    /// Returns the cached value of `key`, without claiming or producing it.
    pub fn value(&self, key: &K) -> Option<V> {
        self.inner.cache.get(key)
    }

    /// Removes `key` from the cache, returning the removed value.
    ///
    /// The next registration produces the value again.
    pub fn invalidate(&self, key: &K) -> Option<V> {
        self.inner.cache.remove(key)
    }

    /// Whether production of `key` is pending.
    pub fn is_pending(&self, key: &K) -> bool {
        self.inner.interest.contains(key)
    }

    /// The units of interest in `key`.
    pub fn interest(&self, key: &K) -> usize {
        self.inner.interest.count(key)
    }

    /// The key `claimer` currently claims.
    pub fn claimed_key(&self, claimer: &C) -> Option<K> {
        self.inner.claims.key_for(claimer)
    }

    /// All claimers of `key`.
    pub fn claimers(&self, key: &K) -> Vec<C> {
        self.inner.claims.claimers_for(key)
    }

    pub fn cache(&self) -> &Arc<dyn Cache<K, V>> {
        &self.inner.cache
    }

    pub fn producer(&self) -> &Arc<dyn Producer<K, V>> {
        &self.inner.producer
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }
}

impl<C, K, V> fmt::Debug for Avenue<C, K, V>
where
    C: Eq + Hash + Clone,
    K: Eq + Hash + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Avenue")
            .field("name", &self.inner.name)
            .field("claims", &self.inner.claims.len())
            .field("pending", &self.inner.interest.len())
            .field("delivery", &self.inner.dispatcher)
            .finish_non_exhaustive()
    }
}

/// Builds an [`Avenue`].
///
/// Created by [`Avenue::builder`].
pub struct AvenueBuilder<C, K, V> {
    name: &'static str,
    producer: Arc<dyn Producer<K, V>>,
    cache: Option<Arc<dyn Cache<K, V>>>,
    delivery: Delivery,
    observer: Option<Arc<dyn AvenueObserver<K>>>,
    on_error: Option<ErrorSink<K>>,
    _claimer: PhantomData<fn() -> C>,
}

impl<C, K, V> AvenueBuilder<C, K, V>
where
    C: Eq + Hash + Clone + Send + Sync + 'static,
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn new(producer: Arc<dyn Producer<K, V>>) -> Self {
        Self {
            name: "default",
            producer,
            cache: None,
            delivery: Delivery::Inline,
            observer: None,
            on_error: None,
            _claimer: PhantomData,
        }
    }

    /// Names the avenue in logs and metrics.
    pub fn name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Stores values in `cache`.
    ///
    /// Defaults to an unbounded [`MemoryCache`].
    pub fn cache<S>(mut self, cache: S) -> Self
    where
        S: Cache<K, V> + 'static,
    {
        self.cache = Some(Arc::new(cache));
        self
    }

    /// Runs callbacks in the given context.
    ///
    /// Defaults to [`Delivery::Inline`].
    pub fn delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    /// Reports decisions of the avenue to `observer`.
    ///
    /// Defaults to a [`TracingObserver`] with the name of the avenue.
    pub fn observer<O>(mut self, observer: O) -> Self
    where
        O: AvenueObserver<K> + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Reports every failed production to `on_error`.
    ///
    /// The sink runs in the delivery context, just like claim callbacks.
    pub fn on_error<F>(mut self, on_error: F) -> Self
    where
        F: Fn(&K, &ProduceError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    /// Applies the cache and delivery settings of `config`.
    ///
    /// Runtime delivery uses the runtime the caller is running on.
    pub fn with_config(mut self, config: &Config) -> Self {
        self.cache = Some(match config.cache.capacity {
            Some(capacity) => Arc::new(BoundedCache::new(capacity)),
            None => Arc::new(MemoryCache::new()),
        });
        self.delivery = match config.delivery {
            DeliveryMode::Inline => Delivery::Inline,
            DeliveryMode::Runtime => Delivery::current_runtime(),
        };
        self
    }

    pub fn build(self) -> Avenue<C, K, V> {
        let name = self.name;
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryCache::new()));
        let observer = self
            .observer
            .unwrap_or_else(|| Arc::new(TracingObserver::new(name)));

        let inner = Inner {
            name,
            producer: self.producer,
            cache,
            claims: ClaimRegistry::new(),
            interest: RefcountTracker::new(),
            gate: Synchronized::new(()),
            dispatcher: Dispatcher::new(self.delivery),
            observer,
            on_error: self.on_error,
        };

        Avenue {
            inner: Arc::new(inner),
        }
    }
}
