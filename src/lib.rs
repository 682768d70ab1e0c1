pub mod clients;
pub mod dispatcher;
pub mod events;
pub mod runtime;
pub mod sync;
pub mod worker;

pub use clients::launcher::{CapacityWeighting, ComputeLauncher, WorkerCensus};
pub use clients::queue::{MessageReceipt, QueueClient, QueueDepth, QueueError, QueueMessage};
pub use clients::store::{
    ByteRange, CompletedPartTag, ObjectHead, PartCopy, SourceStore, StoreError, TargetStore,
};
pub use dispatcher::policy::ScalePolicy;
pub use dispatcher::tick::{DispatchOutcome, Dispatcher};
pub use events::adapter::{EventAdapter, EventKind, SyncEvent};
pub use runtime::config::{MirrorConfig, MirrorConfigBuilder, MirrorConfigParams};
pub use runtime::error::MirrorError;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use sync::copier::{CopyEngine, CopyOutcome};
pub use sync::deleter::{DeleteEngine, DeleteOutcome};
pub use sync::plan::CopyPlan;
pub use worker::process::{Worker, WorkerParams};
pub use worker::types::{WorkerState, WorkerSummary};
