//! One dispatcher invocation. An external clock fires this periodically; each
//! tick observes, decides, launches, and forgets. From the dispatcher's view a
//! worker moves launch-requested → pending → running → stopped, and the
//! dispatcher only ever pushes workers into the first state.

use crate::clients::launcher::{CapacityWeighting, ComputeLauncher, WorkerCensus};
use crate::clients::queue::{QueueClient, QueueDepth};
use crate::dispatcher::policy::ScalePolicy;
use crate::runtime::config::MirrorConfig;
use crate::runtime::error::MirrorError;
use crate::runtime::telemetry::Telemetry;
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// What one tick observed and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub depth: QueueDepth,
    pub census: WorkerCensus,
    pub requested: u32,
    pub launched: u32,
}

pub struct Dispatcher {
    queue: Arc<dyn QueueClient>,
    launcher: Arc<dyn ComputeLauncher>,
    policy: ScalePolicy,
    weighting: CapacityWeighting,
    launch_retries: usize,
    request_timeout: Duration,
    telemetry: Arc<Telemetry>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        launcher: Arc<dyn ComputeLauncher>,
        config: &MirrorConfig,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            queue,
            launcher,
            policy: ScalePolicy::from_config(config),
            weighting: CapacityWeighting::default(),
            launch_retries: config.launch_retries(),
            request_timeout: config.request_timeout(),
            telemetry,
        }
    }

    /// Overrides the default preemptible/on-demand weighting.
    pub fn with_weighting(mut self, weighting: CapacityWeighting) -> Self {
        self.weighting = weighting;
        self
    }

    /// Runs one scaling decision. Launch shortfalls are reported, never
    /// escalated: the next tick re-observes and compensates.
    pub async fn run_once(&self) -> Result<DispatchOutcome> {
        let depth = timeout(self.request_timeout, self.queue.depth())
            .await
            .map_err(|_| anyhow!(MirrorError::QueueUnavailable))?
            .context("reading queue depth")?;

        let census = timeout(self.request_timeout, self.launcher.list_workers())
            .await
            .map_err(|_| anyhow!("worker census timed out"))?
            .context("listing workers")?;

        let requested = self.policy.workers_to_start(depth, census);
        tracing::info!(
            visible = depth.visible,
            in_flight = depth.in_flight,
            running = census.running,
            pending = census.pending,
            requested,
            "dispatch tick"
        );

        if requested == 0 {
            return Ok(DispatchOutcome {
                depth,
                census,
                requested,
                launched: 0,
            });
        }

        let launched = self.launch_with_retries(requested).await;
        self.telemetry.record_workers_launched(u64::from(launched));

        if launched < requested {
            tracing::error!(
                error = %MirrorError::LaunchFailed { requested, launched },
                "launches fell short; the next tick will retry the remainder"
            );
        } else {
            tracing::info!(launched, "workers launched");
        }

        Ok(DispatchOutcome {
            depth,
            census,
            requested,
            launched,
        })
    }

    async fn launch_with_retries(&self, requested: u32) -> u32 {
        let mut launched = 0u32;
        let mut failures = 0usize;

        while launched < requested {
            let remaining = requested - launched;
            let result = match timeout(
                self.request_timeout,
                self.launcher.launch(self.weighting, remaining),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(anyhow!("launch request timed out")),
            };

            match result {
                Ok(count) if count > 0 => {
                    launched += count.min(remaining);
                }
                Ok(_) => {
                    failures += 1;
                    tracing::warn!(remaining, "launcher accepted no workers");
                    if failures >= self.launch_retries {
                        break;
                    }
                }
                Err(err) => {
                    failures += 1;
                    tracing::warn!(
                        remaining,
                        attempt = failures,
                        error = %err,
                        "launch attempt failed"
                    );
                    if failures >= self.launch_retries {
                        break;
                    }
                }
            }
        }

        launched
    }
}
