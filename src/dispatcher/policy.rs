//! Pure scaling arithmetic. A dispatcher invocation is a function of the
//! observed queue depth and worker census only; nothing carries over between
//! ticks, so a duplicated trigger firing cannot compound.

use crate::clients::launcher::WorkerCensus;
use crate::clients::queue::QueueDepth;
use crate::runtime::config::MirrorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalePolicy {
    pub target_backlog_per_worker: u32,
    pub max_workers: u32,
    pub burst_start_limit: u32,
}

impl ScalePolicy {
    pub fn from_config(config: &MirrorConfig) -> Self {
        Self {
            target_backlog_per_worker: config.target_backlog_per_worker(),
            max_workers: config.max_workers(),
            burst_start_limit: config.burst_start_limit(),
        }
    }

    /// Workers the backlog warrants, capped at `max_workers`. In-flight
    /// messages count as backlog: they represent work already claimed, and
    /// ignoring them would overshoot on a brief lull followed by a burst.
    pub fn desired_workers(&self, depth: QueueDepth) -> u32 {
        let backlog = depth.total();
        if backlog == 0 {
            return 0;
        }
        let per_worker = u64::from(self.target_backlog_per_worker.max(1));
        let desired = backlog.div_ceil(per_worker);
        desired.min(u64::from(self.max_workers)) as u32
    }

    /// Net launches for this tick: the shortfall against the census, clamped
    /// by the burst limit so a backlog spike cannot throw a wall of new
    /// connections at the target store.
    pub fn workers_to_start(&self, depth: QueueDepth, census: WorkerCensus) -> u32 {
        let desired = u64::from(self.desired_workers(depth));
        let live = census.total();
        let shortfall = desired.saturating_sub(live);
        shortfall.min(u64::from(self.burst_start_limit)) as u32
    }
}
