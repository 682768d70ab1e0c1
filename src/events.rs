//! Event normalization: raw queue-message bodies in, `SyncEvent`s out.

pub mod adapter;
pub mod envelope;

pub use adapter::{EventAdapter, EventKind, SyncEvent};
