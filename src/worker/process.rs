//! Worker loop: long-polls the queue, fans each message out through the event
//! adapter into the copy or delete engine, acks on full success, exits on
//! sustained idleness, and drains gracefully on preemption.

use crate::clients::queue::{QueueClient, QueueMessage};
use crate::clients::store::{SourceStore, TargetStore};
use crate::events::adapter::{EventAdapter, EventKind};
use crate::runtime::config::MirrorConfig;
use crate::runtime::error::MirrorError;
use crate::runtime::telemetry::Telemetry;
use crate::sync::copier::CopyEngine;
use crate::sync::deleter::DeleteEngine;
use crate::worker::lease::VisibilityKeeper;
use crate::worker::types::{ExitReason, MessageOutcome, WorkerState, WorkerSummary};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Consecutive receive failures tolerated before the worker exits non-zero so
/// the launcher can replace it.
const MAX_CONSECUTIVE_QUEUE_FAILURES: u32 = 5;
/// Pause between failed receive calls.
const QUEUE_FAILURE_PAUSE: Duration = Duration::from_secs(5);

pub struct WorkerParams {
    pub config: MirrorConfig,
    pub queue: Arc<dyn QueueClient>,
    pub source: Arc<dyn SourceStore>,
    pub target: Arc<dyn TargetStore>,
    pub telemetry: Arc<Telemetry>,
    pub shutdown: CancellationToken,
}

pub struct Worker {
    config: MirrorConfig,
    queue: Arc<dyn QueueClient>,
    adapter: EventAdapter,
    copier: CopyEngine,
    deleter: DeleteEngine,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    state: WorkerState,
    messages_processed: u64,
}

impl Worker {
    pub fn new(params: WorkerParams) -> Self {
        let WorkerParams {
            config,
            queue,
            source,
            target,
            telemetry,
            shutdown,
        } = params;

        let adapter = EventAdapter::new(config.source_bucket());
        let copier = CopyEngine::new(
            source,
            Arc::clone(&target),
            &config,
            Arc::clone(&telemetry),
            shutdown.clone(),
        );
        let deleter = DeleteEngine::new(
            target,
            &config,
            Arc::clone(&telemetry),
            shutdown.clone(),
        );

        Self {
            config,
            queue,
            adapter,
            copier,
            deleter,
            telemetry,
            shutdown,
            state: WorkerState::Starting,
            messages_processed: 0,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Drives the worker until the queue goes idle or a preemption signal
    /// lands. After the signal the current event is completed, nothing new is
    /// started, and `drain_deadline` is the hard ceiling on the wind-down.
    #[tracing::instrument(name = "worker", skip_all)]
    pub async fn run(mut self) -> Result<WorkerSummary> {
        tracing::info!(
            source_bucket = self.config.source_bucket(),
            target_bucket = self.config.target_bucket(),
            queue_url = self.config.queue_url(),
            prefix_filter = self.config.prefix_filter(),
            wait_secs = self.config.wait_time().as_secs(),
            empty_polls_before_exit = self.config.empty_polls_before_exit(),
            visibility_secs = self.config.visibility_timeout().as_secs(),
            extend_secs = self.config.extend_interval().as_secs(),
            copy_parallelism = self.config.copy_parallelism(),
            "worker starting"
        );

        let shutdown = self.shutdown.clone();
        let drain_deadline = self.config.drain_deadline();
        let deadline_guard = async move {
            shutdown.cancelled().await;
            sleep(drain_deadline).await;
        };

        let outcome = tokio::select! {
            reason = self.run_loop() => Some(reason),
            _ = deadline_guard => None,
        };

        self.state = WorkerState::Exited;
        match outcome {
            Some(Ok(reason)) => {
                tracing::info!(
                    ?reason,
                    messages_processed = self.messages_processed,
                    "worker exiting cleanly"
                );
                Ok(WorkerSummary {
                    messages_processed: self.messages_processed,
                    drained: reason == ExitReason::Drained,
                })
            }
            Some(Err(err)) => {
                tracing::error!(
                    error = format!("{err:#}"),
                    messages_processed = self.messages_processed,
                    "worker exiting on unrecoverable error"
                );
                Err(err)
            }
            None => {
                tracing::warn!(
                    deadline_secs = drain_deadline.as_secs(),
                    messages_processed = self.messages_processed,
                    "drain deadline reached; abandoning in-flight work to the redrive"
                );
                Ok(WorkerSummary {
                    messages_processed: self.messages_processed,
                    drained: true,
                })
            }
        }
    }

    async fn run_loop(&mut self) -> Result<ExitReason> {
        self.state = WorkerState::Polling;
        let mut empty_polls = 0u32;
        let mut queue_failures = 0u32;
        // Long polls legitimately hold the connection for the full wait.
        let receive_ceiling = self.config.wait_time() + self.config.request_timeout();

        loop {
            if self.shutdown.is_cancelled() {
                self.state = WorkerState::Draining;
                return Ok(ExitReason::Drained);
            }

            let poll = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                result = timeout(
                    receive_ceiling,
                    self.queue.receive(self.config.wait_time(), self.config.receive_batch()),
                ) => Some(match result {
                    Ok(inner) => inner,
                    Err(_) => Err(anyhow!("queue receive timed out")),
                }),
            };
            let Some(received) = poll else {
                self.state = WorkerState::Draining;
                return Ok(ExitReason::Drained);
            };

            match received {
                Err(err) => {
                    queue_failures += 1;
                    tracing::warn!(
                        error = %err,
                        consecutive = queue_failures,
                        "queue receive failed"
                    );
                    if queue_failures >= MAX_CONSECUTIVE_QUEUE_FAILURES {
                        return Err(anyhow!(MirrorError::QueueUnavailable));
                    }
                    let interrupted = tokio::select! {
                        _ = self.shutdown.cancelled() => true,
                        _ = sleep(QUEUE_FAILURE_PAUSE) => false,
                    };
                    if interrupted {
                        self.state = WorkerState::Draining;
                        return Ok(ExitReason::Drained);
                    }
                }
                Ok(messages) if messages.is_empty() => {
                    queue_failures = 0;
                    empty_polls += 1;
                    self.telemetry.record_empty_poll();
                    tracing::info!(
                        empty_polls,
                        threshold = self.config.empty_polls_before_exit(),
                        "no messages"
                    );
                    if empty_polls >= self.config.empty_polls_before_exit() {
                        tracing::info!("queue idle; worker scaling itself down");
                        return Ok(ExitReason::Idle);
                    }
                }
                Ok(messages) => {
                    queue_failures = 0;
                    empty_polls = 0;
                    for message in messages {
                        if self.shutdown.is_cancelled() {
                            self.state = WorkerState::Draining;
                            return Ok(ExitReason::Drained);
                        }
                        self.state = WorkerState::Processing;
                        let outcome = self.process_message(&message).await;
                        self.state = WorkerState::Polling;
                        if outcome == MessageOutcome::Drained {
                            return Ok(ExitReason::Drained);
                        }
                    }
                }
            }
        }
    }

    /// Processes every record of one message serially, under a single
    /// visibility keeper. The first failing record stops the message; partial
    /// progress is safe to replay because both engines are idempotent.
    async fn process_message(&mut self, message: &QueueMessage) -> MessageOutcome {
        tracing::info!(
            message_id = %message.id,
            attempts = message.attempts,
            "processing message"
        );

        let events = match self.adapter.parse(message) {
            Ok(events) => events,
            Err(err) => {
                tracing::error!(
                    message_id = %message.id,
                    error = format!("{err:#}"),
                    "failed to normalize message; leaving it for the redrive"
                );
                self.telemetry.record_redriven();
                return MessageOutcome::Failed;
            }
        };

        let keeper = VisibilityKeeper::spawn(
            Arc::clone(&self.queue),
            message.receipt.clone(),
            self.config.extend_interval(),
            self.config.visibility_timeout(),
            self.config.request_timeout(),
        );

        let mut failed = false;
        let mut drained = false;
        for event in &events {
            if self.shutdown.is_cancelled() {
                drained = true;
                break;
            }

            if !self.key_in_scope(&event.key) {
                tracing::info!(key = %event.key, "key outside prefix filter; skipping");
                self.telemetry.record_skipped();
                continue;
            }

            let result = match event.kind {
                EventKind::Create => self.copier.copy(&event.key).await.map(|_| ()),
                EventKind::Delete => self.deleter.delete(&event.key).await.map(|_| ()),
            };

            if let Err(err) = result {
                tracing::error!(
                    key = %event.key,
                    kind = ?event.kind,
                    error = format!("{err:#}"),
                    "record failed; stopping this message"
                );
                failed = true;
                break;
            }
        }

        let lease_lost = keeper.stop().await;
        if lease_lost {
            self.telemetry.record_lease_lost();
            tracing::warn!(
                message_id = %message.id,
                error = %MirrorError::LeaseLost,
                "finished the in-flight work without a lease; redrive will reconcile"
            );
        }

        if drained {
            tracing::info!(
                message_id = %message.id,
                "shutdown during message; leaving remaining records for the redrive"
            );
            return MessageOutcome::Drained;
        }

        if failed {
            self.telemetry.record_redriven();
            return MessageOutcome::Failed;
        }

        match timeout(
            self.config.request_timeout(),
            self.queue.ack(&message.receipt),
        )
        .await
        {
            Ok(Ok(())) => {
                self.telemetry.record_acked();
                self.messages_processed += 1;
                tracing::info!(message_id = %message.id, "message acked");
            }
            Ok(Err(err)) => {
                self.telemetry.record_redriven();
                tracing::warn!(
                    message_id = %message.id,
                    error = %err,
                    "ack failed; the redrive will replay an already-mirrored message"
                );
            }
            Err(_) => {
                self.telemetry.record_redriven();
                tracing::warn!(
                    message_id = %message.id,
                    "ack timed out; the redrive will replay an already-mirrored message"
                );
            }
        }

        MessageOutcome::Completed
    }

    fn key_in_scope(&self, key: &str) -> bool {
        let prefix = self.config.prefix_filter();
        prefix.is_empty() || key.starts_with(prefix)
    }
}
