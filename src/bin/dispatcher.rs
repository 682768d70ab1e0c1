//! Dispatcher entry point: one scaling decision per invocation, driven by an
//! external periodic trigger. Each run is independent; a failed tick is
//! compensated by the next one.
//!
//! Exit codes: 0 on a completed tick, 2 on configuration errors, 3 when the
//! tick could not observe the queue or launcher.

use anyhow::Result;
use bucketsync::clients::aws::{load_aws_config, EcsLauncher, EcsLauncherConfig, SqsQueue};
use bucketsync::dispatcher::tick::Dispatcher;
use bucketsync::runtime::telemetry::{init_tracing, Telemetry};
use bucketsync::MirrorConfig;
use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let config = match MirrorConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = format!("{err:#}"), "invalid configuration");
            return ExitCode::from(2);
        }
    };

    let launcher_config = match EcsLauncherConfig::from_env() {
        Ok(launcher_config) => launcher_config,
        Err(err) => {
            tracing::error!(error = format!("{err:#}"), "invalid launcher configuration");
            return ExitCode::from(2);
        }
    };

    match run(config, launcher_config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = format!("{err:#}"), "dispatch tick failed");
            ExitCode::from(3)
        }
    }
}

async fn run(config: MirrorConfig, launcher_config: EcsLauncherConfig) -> Result<()> {
    let aws = load_aws_config().await;
    let queue = Arc::new(SqsQueue::new(
        aws_sdk_sqs::Client::new(&aws),
        config.queue_url(),
        config.visibility_timeout(),
    ));
    let launcher = Arc::new(EcsLauncher::new(
        aws_sdk_ecs::Client::new(&aws),
        launcher_config,
    ));

    let telemetry = Arc::new(Telemetry::default());
    let dispatcher = Dispatcher::new(queue, launcher, &config, telemetry);

    let outcome = dispatcher.run_once().await?;
    tracing::info!(
        visible = outcome.depth.visible,
        in_flight = outcome.depth.in_flight,
        running = outcome.census.running,
        pending = outcome.census.pending,
        requested = outcome.requested,
        launched = outcome.launched,
        "dispatch tick complete"
    );
    Ok(())
}
