//! Producers perform the actual work of turning a key into a value.
//!
//! The avenue decides *when* to produce, a [`Producer`] decides *how*. Once production is done,
//! the producer reports the result through the [`Completion`] it was handed in
//! [`Producer::start`].

use std::fmt;
use std::sync::Arc;

use crate::error::ProduceError;
use crate::types::ProcessingState;

mod http;
mod map;
mod task;

pub use http::{HttpProducer, create_client};
pub use map::{MapKey, MapValue};
pub use task::TaskProducer;

/// The result of a production.
pub type ProduceResult<V> = Result<V, ProduceError>;

/// Handle through which a producer reports the result of a production.
///
/// Completing consumes the handle, so every started production completes at most once. Dropping
/// the handle without completing it is allowed and reports nothing, which is what happens to
/// cancelled productions.
#[must_use = "dropping a completion discards the result of the production"]
pub struct Completion<V> {
    complete: Box<dyn FnOnce(ProduceResult<V>) + Send>,
}

impl<V> Completion<V> {
    /// Creates a completion that invokes `f` with the result.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(ProduceResult<V>) + Send + 'static,
    {
        Self {
            complete: Box::new(f),
        }
    }

    /// Reports the result of the production.
    pub fn complete(self, result: ProduceResult<V>) {
        (self.complete)(result)
    }

    pub fn succeed(self, value: V) {
        self.complete(Ok(value))
    }

    pub fn fail(self, error: ProduceError) {
        self.complete(Err(error))
    }

    /// Creates a completion for a different result type, converting its results with `f`.
    pub fn adapt<S, F>(self, f: F) -> Completion<S>
    where
        V: 'static,
        F: FnOnce(ProduceResult<S>) -> ProduceResult<V> + Send + 'static,
    {
        Completion::new(move |result| self.complete(f(result)))
    }
}

impl<V> fmt::Debug for Completion<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

/// Produces values for keys on behalf of an [`Avenue`](crate::Avenue).
///
/// The avenue calls [`start`](Self::start) at most once per key until the production completes or
/// is cancelled, and never for a key whose [`status`](Self::status) is
/// [`Running`](ProcessingState::Running). `Running` therefore promises a completion for exactly
/// that key; a production completing another key does not count. No avenue lock is held while calling `start`, so
/// implementations are free to complete synchronously from within it.
///
/// [`cancel`](Self::cancel) and [`cancel_all`](Self::cancel_all) are called while the avenue holds
/// its lock, and must never complete a production synchronously.
pub trait Producer<K, V>: Send + Sync {
    /// Starts producing the value for `key`, reporting the result to `completion`.
    fn start(&self, key: K, completion: Completion<V>);

    /// Stops producing `key`.
    ///
    /// A cancelled production should drop its completion. Completing it later is harmless, the
    /// avenue discards the result.
    fn cancel(&self, key: &K);

    /// Stops all productions.
    fn cancel_all(&self);

    /// Returns the processing state of `key`.
    fn status(&self, key: &K) -> ProcessingState;
}

impl<K, V, P> Producer<K, V> for Arc<P>
where
    P: Producer<K, V> + ?Sized,
{
    fn start(&self, key: K, completion: Completion<V>) {
        (**self).start(key, completion)
    }

    fn cancel(&self, key: &K) {
        (**self).cancel(key)
    }

    fn cancel_all(&self) {
        (**self).cancel_all()
    }

    fn status(&self, key: &K) -> ProcessingState {
        (**self).status(key)
    }
}

/// Combinators for [`Producer`]s.
pub trait ProducerExt<K, V>: Producer<K, V> + Sized {
    /// Makes this producer accept keys of another type.
    ///
    /// `map` resolves an outer key into a key of this producer. Keys that cannot be resolved are
    /// reported as [`Undefined`](ProcessingState::Undefined) and fail with
    /// [`ProduceError::UnresolvedKey`] without ever reaching this producer. Outer keys resolving
    /// to the same key share one production.
    fn map_key<J, F>(self, map: F) -> MapKey<Self, F, J, K, V>
    where
        F: Fn(&J) -> Option<K> + Send + Sync,
    {
        MapKey::new(self, map)
    }

    /// Transforms every value produced by this producer.
    ///
    /// Values that cannot be transformed fail with [`ProduceError::Malformed`].
    fn map_value<U, E, F>(self, map: F) -> MapValue<Self, F, V>
    where
        F: Fn(V) -> Result<U, E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        MapValue::new(self, map)
    }
}

impl<K, V, P: Producer<K, V>> ProducerExt<K, V> for P {}
