//! Compute-launcher contract used by the dispatcher. The dispatcher never
//! cares what a "worker" physically is; it only counts them and asks for more.

use anyhow::Result;
use futures::future::BoxFuture;

/// Counts of live workers as seen by the compute platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerCensus {
    pub running: u64,
    pub pending: u64,
}

impl WorkerCensus {
    pub fn new(running: u64, pending: u64) -> Self {
        Self { running, pending }
    }

    pub fn total(&self) -> u64 {
        self.running.saturating_add(self.pending)
    }
}

/// Relative weighting between preemptible and on-demand capacity when
/// launching workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityWeighting {
    pub preemptible: u32,
    pub on_demand: u32,
}

impl Default for CapacityWeighting {
    fn default() -> Self {
        // Preemptible capacity is preferred 4:1; the worker's drain path makes
        // interruptions safe.
        Self {
            preemptible: 4,
            on_demand: 1,
        }
    }
}

/// Contract the dispatcher consumes from the compute platform.
pub trait ComputeLauncher: Send + Sync {
    /// Counts running and pending workers.
    fn list_workers(&self) -> BoxFuture<'_, Result<WorkerCensus>>;

    /// Requests `count` new workers under `weighting`; returns how many the
    /// platform accepted. Accepting fewer than `count` is not an error.
    fn launch(&self, weighting: CapacityWeighting, count: u32) -> BoxFuture<'_, Result<u32>>;
}
