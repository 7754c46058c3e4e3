//! Hooks into the lifecycle of an avenue, used for logging and metrics.

use std::fmt;
use std::time::Duration;

use crate::error::ProduceError;

/// Observes the decisions an [`Avenue`](crate::Avenue) takes.
///
/// All methods default to doing nothing. Observers are called outside of the avenue's locks,
/// but synchronously on the thread that took the decision, so they should be quick.
pub trait AvenueObserver<K>: Send + Sync {
    /// Production of `key` was started.
    fn started(&self, _key: &K) {}

    /// A registration joined a production that is already in flight.
    fn coalesced(&self, _key: &K) {}

    /// A registration or preload was served from the cache.
    fn cache_hit(&self, _key: &K) {}

    /// The last interest in `key` went away and its production was cancelled.
    fn cancelled(&self, _key: &K) {}

    /// Production of `key` succeeded and the value went out to `claims` claims.
    fn arrived(&self, _key: &K, _claims: usize, _elapsed: Duration) {}

    /// Production of `key` failed.
    fn failed(&self, _key: &K, _error: &ProduceError, _elapsed: Duration) {}

    /// A completion arrived for a key nobody is waiting for anymore, and was discarded.
    fn stale_completion(&self, _key: &K) {}
}

/// An observer that does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl<K> AvenueObserver<K> for NoopObserver {}

/// The default observer, emitting `tracing` events and metrics.
///
/// Metrics are tagged with the name of the avenue.
#[derive(Clone, Debug)]
pub struct TracingObserver {
    name: &'static str,
}

impl TracingObserver {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl Default for TracingObserver {
    fn default() -> Self {
        Self::new("default")
    }
}

impl<K: fmt::Debug> AvenueObserver<K> for TracingObserver {
    fn started(&self, key: &K) {
        tracing::trace!(avenue = self.name, ?key, "starting production");
        metric!(counter("avenues.start") += 1, "avenue" => self.name);
    }

    fn coalesced(&self, key: &K) {
        tracing::trace!(avenue = self.name, ?key, "joining production in flight");
        metric!(counter("avenues.coalesced") += 1, "avenue" => self.name);
    }

    fn cache_hit(&self, key: &K) {
        tracing::trace!(avenue = self.name, ?key, "serving from cache");
        metric!(counter("avenues.cache.hit") += 1, "avenue" => self.name);
    }

    fn cancelled(&self, key: &K) {
        tracing::debug!(avenue = self.name, ?key, "cancelling production");
        metric!(counter("avenues.cancel") += 1, "avenue" => self.name);
    }

    fn arrived(&self, key: &K, claims: usize, elapsed: Duration) {
        tracing::debug!(avenue = self.name, ?key, claims, "production arrived");
        metric!(counter("avenues.arrived") += 1, "avenue" => self.name);
        metric!(timer("avenues.production") = elapsed, "avenue" => self.name, "status" => "ok");
    }

    fn failed(&self, key: &K, error: &ProduceError, elapsed: Duration) {
        let dynerr: &dyn std::error::Error = error;
        tracing::debug!(avenue = self.name, ?key, error = dynerr, "production failed");
        metric!(
            counter("avenues.failed") += 1,
            "avenue" => self.name,
            "reason" => error.kind(),
        );
        metric!(timer("avenues.production") = elapsed, "avenue" => self.name, "status" => "failed");
    }

    fn stale_completion(&self, key: &K) {
        tracing::trace!(avenue = self.name, ?key, "discarding stale completion");
        metric!(counter("avenues.stale_completion") += 1, "avenue" => self.name);
    }
}
