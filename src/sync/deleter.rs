//! Idempotent target-side deletion.

use crate::clients::store::{StoreError, TargetStore};
use crate::runtime::config::MirrorConfig;
use crate::runtime::error::MirrorError;
use crate::runtime::telemetry::Telemetry;
use crate::sync::backoff::{retry_with_backoff, RetryBackoff, RetryDisposition};
use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const DELETE_BACKOFF_INITIAL: Duration = Duration::from_millis(200);
const DELETE_BACKOFF_MAX: Duration = Duration::from_secs(5);
const DELETE_BACKOFF_JITTER: f64 = 0.2;

/// What a successful [`DeleteEngine::delete`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The target never held the object; deleting nothing is success.
    AlreadyAbsent,
}

pub struct DeleteEngine {
    target: Arc<dyn TargetStore>,
    delete_retries: usize,
    request_timeout: Duration,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
}

impl DeleteEngine {
    pub fn new(
        target: Arc<dyn TargetStore>,
        config: &MirrorConfig,
        telemetry: Arc<Telemetry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            target,
            delete_retries: config.delete_retries(),
            request_timeout: config.request_timeout(),
            telemetry,
            shutdown,
        }
    }

    /// Deletes `key` from the target, treating "not found" as success.
    pub async fn delete(&self, key: &str) -> Result<DeleteOutcome> {
        let backoff = RetryBackoff::new(DELETE_BACKOFF_INITIAL, DELETE_BACKOFF_MAX)
            .with_max_attempts(self.delete_retries)
            .with_jitter(DELETE_BACKOFF_JITTER)
            .with_cancellation(&self.shutdown);

        let outcome = retry_with_backoff(
            backoff,
            |_| async {
                let result = match timeout(self.request_timeout, self.target.delete(key)).await {
                    Ok(result) => result,
                    Err(_) => bail!("delete timed out"),
                };
                match result {
                    Ok(()) => Ok(DeleteOutcome::Deleted),
                    Err(err) if StoreError::is_not_found(&err) => Ok(DeleteOutcome::AlreadyAbsent),
                    Err(err) => Err(err),
                }
            },
            |attempt, delay, err, will_retry| {
                tracing::warn!(
                    key,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    will_retry,
                    "target delete failed"
                );
            },
            |_, _| RetryDisposition::Retry,
        )
        .await
        .map_err(|err| {
            self.telemetry.record_delete_failure();
            err.context(MirrorError::DeleteFailed {
                key: key.to_owned(),
            })
        })?;

        self.telemetry.record_deleted();
        tracing::info!(key, ?outcome, "target delete complete");
        Ok(outcome)
    }
}
