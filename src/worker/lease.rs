//! Background visibility keeper: while a message is being processed, a single
//! companion task periodically pushes its visibility deadline out so the queue
//! does not redeliver work that is still in flight.

use crate::clients::queue::{MessageReceipt, QueueClient, QueueError};
use anyhow::anyhow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Scoped handle over the keeper task.
///
/// The worker must call [`VisibilityKeeper::stop`] when the message settles;
/// dropping the handle also cancels the task, so a panic on the processing
/// path cannot leak a keeper that extends a dead message forever.
pub(crate) struct VisibilityKeeper {
    stop: CancellationToken,
    lease_lost: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl VisibilityKeeper {
    /// Spawns the keeper for one message. The first extension fires one
    /// `extend_interval` after spawn; the initial visibility granted at
    /// receive time covers the gap.
    pub(crate) fn spawn(
        queue: Arc<dyn QueueClient>,
        receipt: MessageReceipt,
        extend_interval: Duration,
        visibility_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        let stop = CancellationToken::new();
        let lease_lost = Arc::new(AtomicBool::new(false));

        let task_stop = stop.clone();
        let task_flag = Arc::clone(&lease_lost);
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + extend_interval, extend_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = task_stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let extension = match timeout(
                            request_timeout,
                            queue.extend(&receipt, visibility_timeout),
                        )
                        .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(anyhow!("visibility extension timed out")),
                        };

                        match extension {
                            Ok(()) => {
                                tracing::debug!(
                                    receipt = %receipt,
                                    extend_secs = visibility_timeout.as_secs(),
                                    "extended message visibility"
                                );
                            }
                            Err(err) if QueueError::is_message_gone(&err) => {
                                task_flag.store(true, Ordering::SeqCst);
                                tracing::warn!(
                                    receipt = %receipt,
                                    "message lease lost; keeper stopping"
                                );
                                break;
                            }
                            Err(err) => {
                                tracing::warn!(
                                    receipt = %receipt,
                                    error = %err,
                                    "visibility extension failed; retrying next tick"
                                );
                            }
                        }
                    }
                }
            }
        });

        Self {
            stop,
            lease_lost,
            handle: Some(handle),
        }
    }

    pub(crate) fn lease_lost(&self) -> bool {
        self.lease_lost.load(Ordering::SeqCst)
    }

    /// Stops the keeper and waits for the task to settle. Returns whether the
    /// lease was lost while the keeper ran.
    pub(crate) async fn stop(mut self) -> bool {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        self.lease_lost.load(Ordering::SeqCst)
    }
}

impl Drop for VisibilityKeeper {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
