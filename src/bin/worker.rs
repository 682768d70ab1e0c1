//! Worker entry point: loads configuration from the environment, wires the
//! AWS-backed collaborators, and drains the queue until it goes idle or a
//! preemption signal arrives.
//!
//! Exit codes: 0 on clean idle or clean drain, 2 on configuration errors,
//! 3 on unrecoverable runtime failures.

use anyhow::Result;
use bucketsync::clients::aws::{load_aws_config, S3SourceStore, S3TargetStore, SqsQueue};
use bucketsync::runtime::telemetry::{self, init_tracing, Telemetry};
use bucketsync::worker::process::{Worker, WorkerParams};
use bucketsync::MirrorConfig;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio_util::sync::CancellationToken;

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

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = format!("{err:#}"), "worker failed");
            ExitCode::from(3)
        }
    }
}

async fn run(config: MirrorConfig) -> Result<()> {
    let aws = load_aws_config().await;
    let queue = Arc::new(SqsQueue::new(
        aws_sdk_sqs::Client::new(&aws),
        config.queue_url(),
        config.visibility_timeout(),
    ));
    let s3 = aws_sdk_s3::Client::new(&aws);
    let source = Arc::new(S3SourceStore::new(s3.clone(), config.source_bucket()));
    let target = Arc::new(S3TargetStore::new(s3, config.target_bucket()));

    let telemetry = Arc::new(Telemetry::default());
    let shutdown = CancellationToken::new();
    spawn_signal_watcher(shutdown.clone());

    let reporter = telemetry::spawn_metrics_reporter(
        Arc::clone(&telemetry),
        shutdown.clone(),
        telemetry::DEFAULT_METRICS_INTERVAL,
    );

    let worker = Worker::new(WorkerParams {
        config,
        queue,
        source,
        target,
        telemetry,
        shutdown: shutdown.clone(),
    });

    let summary = worker.run().await?;
    tracing::info!(
        messages_processed = summary.messages_processed,
        drained = summary.drained,
        "worker finished"
    );

    shutdown.cancel();
    let _ = reporter.await;
    Ok(())
}

/// Cancels the root token on SIGTERM (preemption notice) or Ctrl-C.
fn spawn_signal_watcher(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = match unix_signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::warn!("SIGTERM received; draining current work");
            }
            result = signal::ctrl_c() => {
                if let Err(err) = result {
                    tracing::error!(error = %err, "failed to wait for Ctrl-C");
                    return;
                }
                tracing::warn!("interrupt received; draining current work");
            }
        }

        shutdown.cancel();
    });
}
