//! rekon store: the informer's indexed local cache and the delta queue feeding it.

#![forbid(unsafe_code)]

pub mod cache;
pub mod delta_queue;

pub use cache::{label_index, namespace_index, IndexFn, Store, StoreError, Writer, NAMESPACE_INDEX};
pub use delta_queue::{DeltaQueue, Deltas, PopError};
