//! External-collaborator contracts consumed by the core: the durable queue,
//! the source and target object stores, and the compute launcher, plus their
//! AWS-backed implementations.

pub mod aws;
pub mod launcher;
pub mod queue;
pub mod store;

pub use launcher::{CapacityWeighting, ComputeLauncher, WorkerCensus};
pub use queue::{MessageReceipt, QueueClient, QueueDepth, QueueError, QueueMessage};
pub use store::{
    ByteRange, CompletedPartTag, ObjectHead, PartCopy, SourceStore, StoreError, TargetStore,
};
