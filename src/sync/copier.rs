//! Size-aware copy engine: existence probe, plan selection, single-call
//! copies with multipart escalation, and the semaphore-bounded part-copy pool.

use crate::clients::store::{
    CompletedPartTag, ObjectHead, PartCopy, SourceStore, StoreError, TargetStore,
};
use crate::runtime::config::MirrorConfig;
use crate::runtime::error::MirrorError;
use crate::runtime::telemetry::Telemetry;
use crate::sync::backoff::{retry_with_backoff, RetryBackoff, RetryDisposition};
use crate::sync::plan::{CopyPlan, PlannedPart};
use anyhow::{anyhow, bail, Context, Result};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const PART_BACKOFF_INITIAL: Duration = Duration::from_millis(200);
const PART_BACKOFF_MAX: Duration = Duration::from_secs(5);
const PART_BACKOFF_JITTER: f64 = 0.2;

/// What a successful [`CopyEngine::copy`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// The object was copied to the target.
    Copied { bytes: u64, multipart: bool },
    /// The source no longer holds the object; the creation lost a race with a
    /// later deletion and there is nothing to mirror.
    SourceMissing,
    /// The target already holds an identical object (same size and ETag).
    AlreadyCurrent,
}

pub struct CopyEngine {
    source: Arc<dyn SourceStore>,
    target: Arc<dyn TargetStore>,
    source_bucket: String,
    part_size: u64,
    single_copy_ceiling: u64,
    copy_parallelism: usize,
    part_retries: usize,
    request_timeout: Duration,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
}

impl CopyEngine {
    pub fn new(
        source: Arc<dyn SourceStore>,
        target: Arc<dyn TargetStore>,
        config: &MirrorConfig,
        telemetry: Arc<Telemetry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            target,
            source_bucket: config.source_bucket().to_owned(),
            part_size: config.part_size(),
            single_copy_ceiling: config.single_copy_ceiling(),
            copy_parallelism: config.copy_parallelism(),
            part_retries: config.part_retries(),
            request_timeout: config.request_timeout(),
            telemetry,
            shutdown,
        }
    }

    /// Mirrors `key` from the source bucket onto the target.
    ///
    /// A missing source object is success: the creation event lost a race
    /// with a later deletion and the redelivered message must still be acked.
    pub async fn copy(&self, key: &str) -> Result<CopyOutcome> {
        let head = self.head_source(key).await?;
        let Some(head) = head else {
            tracing::info!(key, "source object gone; treating copy as complete");
            return Ok(CopyOutcome::SourceMissing);
        };

        if self.target_is_current(key, &head).await {
            tracing::info!(key, size = head.size, "target already holds an identical object");
            return Ok(CopyOutcome::AlreadyCurrent);
        }

        let plan = CopyPlan::select(key, head.size, self.part_size, self.single_copy_ceiling)?;
        let multipart = match plan {
            CopyPlan::Single => match self.copy_single(key).await {
                Ok(()) => false,
                Err(err) if StoreError::is_single_copy_too_large(&err) => {
                    tracing::info!(
                        key,
                        size = head.size,
                        "single copy refused for size; escalating to multipart"
                    );
                    let CopyPlan::Multipart { parts, .. } =
                        CopyPlan::multipart(key, head.size, self.part_size)?
                    else {
                        unreachable!("multipart planner only returns multipart plans");
                    };
                    self.copy_multipart(key, parts).await.map_err(|err| {
                        self.telemetry.record_copy_failure();
                        err.context(MirrorError::CopyFailed {
                            key: key.to_owned(),
                        })
                    })?;
                    true
                }
                Err(err) => {
                    self.telemetry.record_copy_failure();
                    return Err(err.context(MirrorError::CopyFailed {
                        key: key.to_owned(),
                    }));
                }
            },
            CopyPlan::Multipart { parts, .. } => {
                self.copy_multipart(key, parts).await.map_err(|err| {
                    self.telemetry.record_copy_failure();
                    err.context(MirrorError::CopyFailed {
                        key: key.to_owned(),
                    })
                })?;
                true
            }
        };

        self.telemetry.record_copied(head.size);
        if multipart {
            self.telemetry.record_multipart_copy();
        }
        Ok(CopyOutcome::Copied {
            bytes: head.size,
            multipart,
        })
    }

    async fn head_source(&self, key: &str) -> Result<Option<ObjectHead>> {
        let backoff = RetryBackoff::new(PART_BACKOFF_INITIAL, PART_BACKOFF_MAX)
            .with_max_attempts(self.part_retries)
            .with_jitter(PART_BACKOFF_JITTER)
            .with_cancellation(&self.shutdown);

        retry_with_backoff(
            backoff,
            |_| self.with_timeout("source head", self.source.head(key)),
            |attempt, delay, err, will_retry| {
                tracing::warn!(
                    key,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    will_retry,
                    "source metadata probe failed"
                );
            },
            |_, _| RetryDisposition::Retry,
        )
        .await
        .map_err(|err| {
            err.context(MirrorError::SourceHeadFailed {
                key: key.to_owned(),
            })
        })
    }

    /// Best-effort probe of the target: a redelivered message whose copy
    /// already landed should not move the bytes again. Probe failures fall
    /// through to the copy.
    async fn target_is_current(&self, key: &str, source_head: &ObjectHead) -> bool {
        match self.with_timeout("target head", self.target.head(key)).await {
            Ok(Some(existing)) => {
                existing.size == source_head.size
                    && existing.etag.is_some()
                    && existing.etag == source_head.etag
            }
            Ok(None) => false,
            Err(err) => {
                tracing::debug!(key, error = %err, "target probe failed; copying anyway");
                false
            }
        }
    }

    async fn copy_single(&self, key: &str) -> Result<()> {
        let backoff = RetryBackoff::new(PART_BACKOFF_INITIAL, PART_BACKOFF_MAX)
            .with_max_attempts(self.part_retries)
            .with_jitter(PART_BACKOFF_JITTER)
            .with_cancellation(&self.shutdown);

        retry_with_backoff(
            backoff,
            |_| {
                self.with_timeout(
                    "single copy",
                    self.target.copy_single(&self.source_bucket, key, key),
                )
            },
            |attempt, delay, err, will_retry| {
                tracing::warn!(
                    key,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    will_retry,
                    "single copy failed"
                );
            },
            |_, err| {
                if StoreError::is_single_copy_too_large(err) {
                    RetryDisposition::Abort
                } else {
                    RetryDisposition::Retry
                }
            },
        )
        .await
    }

    async fn copy_multipart(&self, key: &str, parts: Vec<PlannedPart>) -> Result<()> {
        let upload_id = self
            .with_timeout("initiate multipart", self.target.initiate_multipart(key))
            .await
            .context("initiating multipart upload")?;

        tracing::info!(
            key,
            upload_id = %upload_id,
            parts = parts.len(),
            parallelism = self.copy_parallelism,
            "starting multipart copy"
        );

        match self.run_part_pool(key, &upload_id, parts).await {
            Ok(collected) => {
                let mut collected = collected;
                collected.sort_by_key(|part| part.number);
                let completion = self
                    .with_timeout(
                        "complete multipart",
                        self.target.complete_multipart(key, &upload_id, &collected),
                    )
                    .await;
                if let Err(err) = completion {
                    self.abort_upload(key, &upload_id).await;
                    return Err(err.context("completing multipart upload"));
                }
                Ok(())
            }
            Err(err) => {
                self.abort_upload(key, &upload_id).await;
                Err(err)
            }
        }
    }

    /// Runs every part through a pool capped at `copy_parallelism` concurrent
    /// copies. The first part failure cancels the rest; collected ETags come
    /// back unsorted.
    async fn run_part_pool(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<PlannedPart>,
    ) -> Result<Vec<CompletedPartTag>> {
        let semaphore = Arc::new(Semaphore::new(self.copy_parallelism));
        let collected = Arc::new(Mutex::new(Vec::with_capacity(parts.len())));
        let cancel = self.shutdown.child_token();
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        for part in parts {
            let semaphore = Arc::clone(&semaphore);
            let collected = Arc::clone(&collected);
            let cancel = cancel.clone();
            let target = Arc::clone(&self.target);
            let telemetry = Arc::clone(&self.telemetry);
            let src_bucket = self.source_bucket.clone();
            let key = key.to_owned();
            let upload_id = upload_id.to_owned();
            let part_retries = self.part_retries;
            let request_timeout = self.request_timeout;

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| anyhow!("part pool semaphore closed"))?;

                if cancel.is_cancelled() {
                    bail!("part copy cancelled before start");
                }

                let backoff = RetryBackoff::new(PART_BACKOFF_INITIAL, PART_BACKOFF_MAX)
                    .with_max_attempts(part_retries)
                    .with_jitter(PART_BACKOFF_JITTER)
                    .with_cancellation(&cancel);

                let etag = retry_with_backoff(
                    backoff,
                    |_| {
                        let request = PartCopy {
                            upload_id: &upload_id,
                            part_number: part.number,
                            src_bucket: &src_bucket,
                            src_key: &key,
                            dst_key: &key,
                            range: part.range,
                        };
                        let copy = target.copy_part(request);
                        let cancel = &cancel;
                        async move {
                            tokio::select! {
                                _ = cancel.cancelled() => bail!("part copy cancelled"),
                                result = timeout(request_timeout, copy) => match result {
                                    Ok(value) => value,
                                    Err(_) => bail!("part copy timed out"),
                                },
                            }
                        }
                    },
                    |attempt, delay, err, will_retry| {
                        telemetry.record_part_retry();
                        tracing::warn!(
                            key = %key,
                            part = part.number,
                            attempt,
                            backoff_ms = delay.as_millis() as u64,
                            error = %err,
                            will_retry,
                            "part copy failed"
                        );
                    },
                    |_, _| {
                        if cancel.is_cancelled() {
                            RetryDisposition::Abort
                        } else {
                            RetryDisposition::Retry
                        }
                    },
                )
                .await
                .with_context(|| format!("part {} exhausted retries", part.number))?;

                collected
                    .lock()
                    .unwrap()
                    .push(CompletedPartTag {
                        number: part.number,
                        etag,
                    });
                Ok(())
            });
        }

        let mut failure: Option<anyhow::Error> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if failure.is_none() {
                        failure = Some(err);
                        cancel.cancel();
                        tasks.abort_all();
                    }
                }
                Err(join_err) if join_err.is_cancelled() => {}
                Err(join_err) => {
                    if failure.is_none() {
                        failure = Some(anyhow!(join_err).context("part copy task panicked"));
                        cancel.cancel();
                        tasks.abort_all();
                    }
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => {
                let collected = Arc::try_unwrap(collected)
                    .map_err(|_| anyhow!("part collection still shared after pool drain"))?
                    .into_inner()
                    .unwrap();
                Ok(collected)
            }
        }
    }

    /// Single best-effort abort; a failure here is logged and left to the
    /// target's lifecycle policy to reap.
    async fn abort_upload(&self, key: &str, upload_id: &str) {
        match self
            .with_timeout("abort multipart", self.target.abort_multipart(key, upload_id))
            .await
        {
            Ok(()) => {
                tracing::info!(key, upload_id = %upload_id, "aborted multipart upload");
            }
            Err(err) => {
                tracing::warn!(
                    key,
                    upload_id = %upload_id,
                    error = %err,
                    "failed to abort multipart upload; lifecycle policy must reap it"
                );
            }
        }
    }

    async fn with_timeout<T>(
        &self,
        what: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match timeout(self.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => bail!("{what} timed out"),
        }
    }
}
