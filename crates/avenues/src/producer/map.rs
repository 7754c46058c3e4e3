use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Completion, ProduceResult, Producer};
use crate::error::ProduceError;
use crate::types::ProcessingState;

/// The outer keys waiting for one production of the inner producer.
struct Waiters<J, V> {
    run_id: u64,
    completions: Vec<(J, Completion<V>)>,
}

struct Productions<J, K, V> {
    waiting: HashMap<K, Waiters<J, V>>,
    next_run: u64,
}

/// Completions are `Send` but not `Sync`, so they live behind a mutex.
struct Shared<J, K, V> {
    productions: Mutex<Productions<J, K, V>>,
}

impl<J, K: Eq + Hash, V> Shared<J, K, V> {
    fn lock(&self) -> MutexGuard<'_, Productions<J, K, V>> {
        self.productions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the completions waiting for `key`, unless they belong to a later run.
    fn take(&self, key: &K, run_id: u64) -> Vec<(J, Completion<V>)> {
        let mut productions = self.lock();
        match productions.waiting.get(key) {
            Some(waiters) if waiters.run_id == run_id => productions
                .waiting
                .remove(key)
                .map(|waiters| waiters.completions)
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

/// A [`Producer`] that resolves its keys before handing them to an inner producer.
///
/// Several outer keys may resolve to the same inner key. They share a single production of the
/// inner producer, and every outer key waiting for it receives the result. The status of an
/// outer key is [`Running`](ProcessingState::Running) only while that very key waits for a
/// production.
///
/// Created by [`ProducerExt::map_key`](super::ProducerExt::map_key).
pub struct MapKey<P, F, J, K, V> {
    inner: P,
    map: F,
    shared: Arc<Shared<J, K, V>>,
}

impl<P, F, J, K, V> MapKey<P, F, J, K, V> {
    pub fn new(inner: P, map: F) -> Self {
        Self {
            inner,
            map,
            shared: Arc::new(Shared {
                productions: Mutex::new(Productions {
                    waiting: HashMap::new(),
                    next_run: 0,
                }),
            }),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

impl<J, K, V, P, F> Producer<J, V> for MapKey<P, F, J, K, V>
where
    J: Eq + fmt::Debug + Send + 'static,
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
    P: Producer<K, V>,
    F: Fn(&J) -> Option<K> + Send + Sync,
{
    fn start(&self, key: J, completion: Completion<V>) {
        let Some(mapped) = (self.map)(&key) else {
            tracing::warn!(key = ?key, "could not resolve key, not producing it");
            completion.fail(ProduceError::UnresolvedKey(format!("{key:?}")));
            return;
        };

        let run_id = {
            let mut productions = self.shared.lock();
            let next_run = productions.next_run;
            let waiters = productions
                .waiting
                .entry(mapped.clone())
                .or_insert_with(|| Waiters {
                    run_id: next_run,
                    completions: Vec::new(),
                });
            let first = waiters.completions.is_empty();
            waiters.completions.push((key, completion));
            if !first {
                tracing::trace!("joining a running production of a shared key");
                return;
            }
            productions.next_run += 1;
            next_run
        };

        let shared = Arc::clone(&self.shared);
        let inner_key = mapped.clone();
        self.inner.start(
            mapped,
            Completion::new(move |result: ProduceResult<V>| {
                for (_, completion) in shared.take(&inner_key, run_id) {
                    completion.complete(result.clone());
                }
            }),
        );
    }

    fn cancel(&self, key: &J) {
        let Some(mapped) = (self.map)(key) else {
            return;
        };

        let abandoned = {
            let mut productions = self.shared.lock();
            match productions.waiting.get_mut(&mapped) {
                Some(waiters) => {
                    waiters.completions.retain(|(waiting, _)| waiting != key);
                    let abandoned = waiters.completions.is_empty();
                    if abandoned {
                        productions.waiting.remove(&mapped);
                    }
                    abandoned
                }
                None => true,
            }
        };

        if abandoned {
            self.inner.cancel(&mapped);
        }
    }

    fn cancel_all(&self) {
        self.shared.lock().waiting.clear();
        self.inner.cancel_all()
    }

    fn status(&self, key: &J) -> ProcessingState {
        let Some(mapped) = (self.map)(key) else {
            return ProcessingState::Undefined;
        };

        let waiting = self.shared.lock().waiting.get(&mapped).map(|waiters| {
            waiters
                .completions
                .iter()
                .any(|(waiting, _)| waiting == key)
        });

        match waiting {
            Some(true) => ProcessingState::Running,
            Some(false) => ProcessingState::None,
            // Nobody completes this key for a production not started through the adapter.
            None => match self.inner.status(&mapped) {
                ProcessingState::Running => ProcessingState::None,
                status => status,
            },
        }
    }
}

impl<P: fmt::Debug, F, J, K, V> fmt::Debug for MapKey<P, F, J, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapKey")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

/// A [`Producer`] that transforms the values of an inner producer.
///
/// Created by [`ProducerExt::map_value`](super::ProducerExt::map_value).
pub struct MapValue<P, F, V> {
    inner: P,
    map: Arc<F>,
    _value: PhantomData<fn(V)>,
}

impl<P, F, V> MapValue<P, F, V> {
    pub fn new(inner: P, map: F) -> Self {
        Self {
            inner,
            map: Arc::new(map),
            _value: PhantomData,
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

impl<K, U, V, E, P, F> Producer<K, U> for MapValue<P, F, V>
where
    U: 'static,
    V: 'static,
    E: fmt::Display,
    P: Producer<K, V>,
    F: Fn(V) -> Result<U, E> + Send + Sync + 'static,
{
    fn start(&self, key: K, completion: Completion<U>) {
        let map = Arc::clone(&self.map);
        let completion = completion.adapt(move |result: ProduceResult<V>| {
            result.and_then(|value| {
                map(value).map_err(|err| ProduceError::Malformed(err.to_string()))
            })
        });
        self.inner.start(key, completion)
    }

    fn cancel(&self, key: &K) {
        self.inner.cancel(key)
    }

    fn cancel_all(&self) {
        self.inner.cancel_all()
    }

    fn status(&self, key: &K) -> ProcessingState {
        self.inner.status(key)
    }
}

impl<P: fmt::Debug, F, V> fmt::Debug for MapValue<P, F, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapValue")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}
