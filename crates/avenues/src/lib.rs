//! Request coalescing for keyed, asynchronously produced resources.
//!
//! An [`Avenue`] sits between code that needs resources and a [`Producer`] that knows how to make
//! them. However many claims are made on a key, the producer is asked for it at most once at a
//! time, and every waiting claim is notified exactly once when the resource arrives.
//!
//! ```
//! use avenues::{Avenue, Completion, MemoryCache, ProcessingState, Producer, ResourceState};
//!
//! struct Squares;
//!
//! impl Producer<u64, u64> for Squares {
//!     fn start(&self, key: u64, completion: Completion<u64>) {
//!         completion.succeed(key * key);
//!     }
//!     fn cancel(&self, _key: &u64) {}
//!     fn cancel_all(&self) {}
//!     fn status(&self, _key: &u64) -> ProcessingState {
//!         ProcessingState::None
//!     }
//! }
//!
//! let avenue: Avenue<&str, u64, u64> = Avenue::new(Squares, MemoryCache::new());
//! avenue.register("claimer", 7, |state| {
//!     if let ResourceState::Arrived(value) = state {
//!         assert_eq!(value, 49);
//!     }
//! });
//! assert_eq!(avenue.value(&7), Some(49));
//! ```

#[macro_use]
pub mod metrics;

pub mod avenue;
pub mod cache;
pub mod claims;
pub mod config;
pub mod delivery;
pub mod error;
pub mod logging;
pub mod observer;
pub mod producer;
pub mod refcount;
pub mod sync;
pub mod types;
pub mod utils;


pub use avenue::{Avenue, AvenueBuilder, ErrorSink};
pub use cache::{BoundedCache, Cache, MemoryCache};
pub use delivery::{Delivery, DeliveryQueue};
pub use error::ProduceError;
pub use observer::{AvenueObserver, NoopObserver, TracingObserver};
pub use producer::{
    Completion, HttpProducer, MapKey, MapValue, ProduceResult, Producer, ProducerExt,
    TaskProducer,
};
pub use types::{ProcessingState, ResourceState};
