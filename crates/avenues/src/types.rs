//! Types shared between the avenue, its claims and its producers.

use crate::error::ProduceError;

/// The state of a resource as delivered to a claim callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceState<V> {
    /// The value was already cached when the claim was registered.
    Existing(V),
    /// The value was just produced.
    Arrived(V),
    /// Production is in flight, the value will be delivered once it arrives.
    Processing,
    /// Production failed.
    ///
    /// Failures are never cached, registering again starts a new production.
    Failed(ProduceError),
}

impl<V> ResourceState<V> {
    /// Returns the value, if there is one.
    pub fn value(&self) -> Option<&V> {
        match self {
            Self::Existing(value) | Self::Arrived(value) => Some(value),
            Self::Processing | Self::Failed(_) => None,
        }
    }

    pub fn into_value(self) -> Option<V> {
        match self {
            Self::Existing(value) | Self::Arrived(value) => Some(value),
            Self::Processing | Self::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ProduceError> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }

    /// Whether this is the final state a claim will observe.
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Processing)
    }
}

/// The processing state of a key as reported by a [`Producer`](crate::producer::Producer).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcessingState {
    /// The producer is not working on the key.
    None,
    /// Production of the key is in flight.
    Running,
    /// The producer finished producing the key.
    Completed,
    /// The key cannot be mapped to anything the producer knows about.
    Undefined,
}
