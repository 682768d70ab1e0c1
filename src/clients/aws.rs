//! AWS-backed implementations of the collaborator contracts: SQS for the
//! durable queue, S3 for both object stores, and ECS/Fargate for the compute
//! launcher.

use crate::clients::launcher::{CapacityWeighting, ComputeLauncher, WorkerCensus};
use crate::clients::queue::{
    MessageReceipt, QueueClient, QueueDepth, QueueError, QueueMessage,
};
use crate::clients::store::{
    CompletedPartTag, ObjectHead, PartCopy, SourceStore, StoreError, TargetStore,
};
use anyhow::{anyhow, bail, Context, Result};
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ecs::types::{
    AssignPublicIp, AwsVpcConfiguration, CapacityProviderStrategyItem, DesiredStatus,
    NetworkConfiguration,
};
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName};
use futures::future::BoxFuture;
use futures::FutureExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::env;
use std::time::Duration;

/// Escape set for `x-amz-copy-source`: path separators stay literal, the rest
/// of the key is percent-encoded.
const COPY_SOURCE_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const FARGATE_SPOT_PROVIDER: &str = "FARGATE_SPOT";
const FARGATE_PROVIDER: &str = "FARGATE";
/// The platform caps one run-task request at this many instances.
const RUN_TASK_BATCH_MAX: u32 = 10;

/// Loads the shared AWS configuration, honoring `REGION` when set.
pub async fn load_aws_config() -> aws_config::SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Ok(region) = env::var("REGION") {
        if !region.trim().is_empty() {
            loader = loader.region(Region::new(region.trim().to_owned()));
        }
    }
    loader.load().await
}

fn copy_source(bucket: &str, key: &str) -> String {
    format!("{bucket}/{}", utf8_percent_encode(key, COPY_SOURCE_ENCODE))
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// SQS-backed durable queue.
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
    visibility_timeout: Duration,
}

impl SqsQueue {
    pub fn new(
        client: aws_sdk_sqs::Client,
        queue_url: impl Into<String>,
        visibility_timeout: Duration,
    ) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
            visibility_timeout,
        }
    }
}

fn is_lease_gone_code(code: Option<&str>) -> bool {
    matches!(code, Some("MessageNotInflight") | Some("ReceiptHandleIsInvalid"))
}

impl QueueClient for SqsQueue {
    fn receive(
        &self,
        wait: Duration,
        max_messages: usize,
    ) -> BoxFuture<'_, Result<Vec<QueueMessage>>> {
        async move {
            let output = self
                .client
                .receive_message()
                .queue_url(&self.queue_url)
                .max_number_of_messages(max_messages.min(10) as i32)
                .wait_time_seconds(wait.as_secs() as i32)
                .visibility_timeout(self.visibility_timeout.as_secs() as i32)
                .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
                .send()
                .await
                .context("receiving queue messages")?;

            let mut messages = Vec::new();
            for message in output.messages() {
                let Some(receipt) = message.receipt_handle() else {
                    tracing::warn!("dropping received message without a receipt handle");
                    continue;
                };
                let attempts = message
                    .attributes()
                    .and_then(|attrs| {
                        attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount)
                    })
                    .and_then(|count| count.parse::<u32>().ok())
                    .unwrap_or(1)
                    .max(1);

                messages.push(QueueMessage {
                    id: message.message_id().unwrap_or_default().to_owned(),
                    body: message.body().unwrap_or_default().to_owned(),
                    receipt: MessageReceipt::new(receipt),
                    attempts,
                });
            }
            Ok(messages)
        }
        .boxed()
    }

    fn ack<'a>(&'a self, receipt: &'a MessageReceipt) -> BoxFuture<'a, Result<()>> {
        async move {
            match self
                .client
                .delete_message()
                .queue_url(&self.queue_url)
                .receipt_handle(receipt.as_str())
                .send()
                .await
            {
                Ok(_) => Ok(()),
                Err(err) => {
                    if is_lease_gone_code(err.as_service_error().and_then(|se| se.code())) {
                        return Err(anyhow!(err).context(QueueError::MessageGone));
                    }
                    Err(err).context("deleting queue message")
                }
            }
        }
        .boxed()
    }

    fn extend<'a>(
        &'a self,
        receipt: &'a MessageReceipt,
        visibility: Duration,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            match self
                .client
                .change_message_visibility()
                .queue_url(&self.queue_url)
                .receipt_handle(receipt.as_str())
                .visibility_timeout(visibility.as_secs() as i32)
                .send()
                .await
            {
                Ok(_) => Ok(()),
                Err(err) => {
                    if is_lease_gone_code(err.as_service_error().and_then(|se| se.code())) {
                        return Err(anyhow!(err).context(QueueError::MessageGone));
                    }
                    Err(err).context("extending message visibility")
                }
            }
        }
        .boxed()
    }

    fn depth(&self) -> BoxFuture<'_, Result<QueueDepth>> {
        async move {
            let output = self
                .client
                .get_queue_attributes()
                .queue_url(&self.queue_url)
                .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
                .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
                .send()
                .await
                .context("reading queue attributes")?;

            let read = |name: &QueueAttributeName| -> u64 {
                output
                    .attributes()
                    .and_then(|attrs| attrs.get(name))
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(0)
            };

            Ok(QueueDepth::new(
                read(&QueueAttributeName::ApproximateNumberOfMessages),
                read(&QueueAttributeName::ApproximateNumberOfMessagesNotVisible),
            ))
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// Object stores
// ---------------------------------------------------------------------------

/// S3-backed read-only view of the source bucket.
pub struct S3SourceStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3SourceStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

async fn head_object(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    key: &str,
) -> Result<Option<ObjectHead>> {
    match client.head_object().bucket(bucket).key(key).send().await {
        Ok(output) => Ok(Some(ObjectHead {
            size: output.content_length().unwrap_or_default().max(0) as u64,
            etag: output.e_tag().map(str::to_owned),
        })),
        Err(err) => {
            if err
                .as_service_error()
                .map(|se| se.is_not_found())
                .unwrap_or(false)
            {
                return Ok(None);
            }
            Err(err).with_context(|| format!("head {key} in {bucket}"))
        }
    }
}

impl SourceStore for S3SourceStore {
    fn head<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<ObjectHead>>> {
        head_object(&self.client, &self.bucket, key).boxed()
    }
}

/// S3-backed target bucket carrying the full copy surface.
pub struct S3TargetStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3TargetStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

fn is_copy_size_refusal(code: Option<&str>, message: Option<&str>) -> bool {
    code == Some("InvalidRequest")
        && message
            .map(|msg| msg.contains("maximum allowable size") || msg.contains("copy source"))
            .unwrap_or(false)
}

impl TargetStore for S3TargetStore {
    fn head<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<ObjectHead>>> {
        head_object(&self.client, &self.bucket, key).boxed()
    }

    fn copy_single<'a>(
        &'a self,
        src_bucket: &'a str,
        src_key: &'a str,
        dst_key: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            match self
                .client
                .copy_object()
                .copy_source(copy_source(src_bucket, src_key))
                .bucket(&self.bucket)
                .key(dst_key)
                .send()
                .await
            {
                Ok(_) => Ok(()),
                Err(err) => {
                    let refused_for_size = err
                        .as_service_error()
                        .map(|se| is_copy_size_refusal(se.code(), se.message()))
                        .unwrap_or(false);
                    if refused_for_size {
                        return Err(anyhow!(err).context(StoreError::SingleCopyTooLarge));
                    }
                    Err(err).with_context(|| format!("copying {src_key} to {dst_key}"))
                }
            }
        }
        .boxed()
    }

    fn initiate_multipart<'a>(&'a self, dst_key: &'a str) -> BoxFuture<'a, Result<String>> {
        async move {
            let output = self
                .client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(dst_key)
                .send()
                .await
                .with_context(|| format!("initiating multipart upload for {dst_key}"))?;

            output
                .upload_id()
                .map(str::to_owned)
                .ok_or_else(|| anyhow!("multipart initiation returned no upload id"))
        }
        .boxed()
    }

    fn copy_part<'a>(&'a self, part: PartCopy<'a>) -> BoxFuture<'a, Result<String>> {
        async move {
            let output = self
                .client
                .upload_part_copy()
                .bucket(&self.bucket)
                .key(part.dst_key)
                .upload_id(part.upload_id)
                .part_number(part.part_number)
                .copy_source(copy_source(part.src_bucket, part.src_key))
                .copy_source_range(part.range.to_string())
                .send()
                .await
                .with_context(|| {
                    format!("copying part {} of {}", part.part_number, part.dst_key)
                })?;

            output
                .copy_part_result()
                .and_then(|result| result.e_tag())
                .map(str::to_owned)
                .ok_or_else(|| {
                    anyhow!("part {} copy returned no etag", part.part_number)
                })
        }
        .boxed()
    }

    fn complete_multipart<'a>(
        &'a self,
        dst_key: &'a str,
        upload_id: &'a str,
        parts: &'a [CompletedPartTag],
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let completed: Vec<CompletedPart> = parts
                .iter()
                .map(|part| {
                    CompletedPart::builder()
                        .part_number(part.number)
                        .e_tag(&part.etag)
                        .build()
                })
                .collect();

            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(dst_key)
                .upload_id(upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(completed))
                        .build(),
                )
                .send()
                .await
                .with_context(|| format!("completing multipart upload for {dst_key}"))?;
            Ok(())
        }
        .boxed()
    }

    fn abort_multipart<'a>(
        &'a self,
        dst_key: &'a str,
        upload_id: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            self.client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(dst_key)
                .upload_id(upload_id)
                .send()
                .await
                .with_context(|| format!("aborting multipart upload for {dst_key}"))?;
            Ok(())
        }
        .boxed()
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            match self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
            {
                Ok(_) => Ok(()),
                Err(err) => {
                    if err.as_service_error().and_then(|se| se.code()) == Some("NoSuchKey") {
                        return Err(anyhow!(err).context(StoreError::NotFound));
                    }
                    Err(err).with_context(|| format!("deleting {key}"))
                }
            }
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// Compute launcher
// ---------------------------------------------------------------------------

/// Settings for the ECS-backed launcher, read from the operational
/// environment; none of these reach the core.
#[derive(Debug, Clone)]
pub struct EcsLauncherConfig {
    pub cluster: String,
    pub task_definition: String,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub assign_public_ip: bool,
}

impl EcsLauncherConfig {
    pub fn from_env() -> Result<Self> {
        let cluster = env::var("CLUSTER").context("CLUSTER is required")?;
        let task_definition =
            env::var("TASK_DEFINITION").context("TASK_DEFINITION is required")?;
        let subnets = split_csv(env::var("SUBNETS").ok());
        let security_groups = split_csv(env::var("SECURITY_GROUPS").ok());
        if subnets.is_empty() {
            bail!("SUBNETS must name at least one subnet");
        }
        Ok(Self {
            cluster,
            task_definition,
            subnets,
            security_groups,
            assign_public_ip: true,
        })
    }
}

fn split_csv(value: Option<String>) -> Vec<String> {
    value
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

/// ECS/Fargate-backed compute launcher.
pub struct EcsLauncher {
    client: aws_sdk_ecs::Client,
    config: EcsLauncherConfig,
}

impl EcsLauncher {
    pub fn new(client: aws_sdk_ecs::Client, config: EcsLauncherConfig) -> Self {
        Self { client, config }
    }

    async fn count_tasks(&self, status: DesiredStatus) -> Result<u64> {
        let output = self
            .client
            .list_tasks()
            .cluster(&self.config.cluster)
            .desired_status(status)
            .send()
            .await
            .context("listing tasks")?;
        Ok(output.task_arns().len() as u64)
    }

    fn network_configuration(&self) -> Result<NetworkConfiguration> {
        let assign = if self.config.assign_public_ip {
            AssignPublicIp::Enabled
        } else {
            AssignPublicIp::Disabled
        };
        let vpc = AwsVpcConfiguration::builder()
            .set_subnets(Some(self.config.subnets.clone()))
            .set_security_groups(if self.config.security_groups.is_empty() {
                None
            } else {
                Some(self.config.security_groups.clone())
            })
            .assign_public_ip(assign)
            .build()
            .context("building awsvpc configuration")?;
        Ok(NetworkConfiguration::builder()
            .awsvpc_configuration(vpc)
            .build())
    }

    fn capacity_strategy(
        weighting: CapacityWeighting,
    ) -> Result<Vec<CapacityProviderStrategyItem>> {
        let mut strategy = Vec::new();
        if weighting.preemptible > 0 {
            strategy.push(
                CapacityProviderStrategyItem::builder()
                    .capacity_provider(FARGATE_SPOT_PROVIDER)
                    .weight(weighting.preemptible as i32)
                    .base(0)
                    .build()
                    .context("building spot capacity strategy")?,
            );
        }
        if weighting.on_demand > 0 {
            strategy.push(
                CapacityProviderStrategyItem::builder()
                    .capacity_provider(FARGATE_PROVIDER)
                    .weight(weighting.on_demand as i32)
                    .base(0)
                    .build()
                    .context("building on-demand capacity strategy")?,
            );
        }
        if strategy.is_empty() {
            bail!("capacity weighting must keep at least one provider above zero");
        }
        Ok(strategy)
    }
}

impl ComputeLauncher for EcsLauncher {
    fn list_workers(&self) -> BoxFuture<'_, Result<WorkerCensus>> {
        async move {
            let running = self.count_tasks(DesiredStatus::Running).await?;
            let pending = self.count_tasks(DesiredStatus::Pending).await?;
            Ok(WorkerCensus::new(running, pending))
        }
        .boxed()
    }

    fn launch(&self, weighting: CapacityWeighting, count: u32) -> BoxFuture<'_, Result<u32>> {
        async move {
            let strategy = Self::capacity_strategy(weighting)?;
            let network = self.network_configuration()?;

            let mut accepted = 0u32;
            let mut remaining = count;
            while remaining > 0 {
                let batch = remaining.min(RUN_TASK_BATCH_MAX);
                let output = self
                    .client
                    .run_task()
                    .cluster(&self.config.cluster)
                    .task_definition(&self.config.task_definition)
                    .count(batch as i32)
                    .set_capacity_provider_strategy(Some(strategy.clone()))
                    .network_configuration(network.clone())
                    .enable_execute_command(false)
                    .send()
                    .await
                    .context("running worker task")?;

                for failure in output.failures() {
                    tracing::warn!(
                        reason = failure.reason().unwrap_or("unknown"),
                        detail = failure.detail().unwrap_or(""),
                        "worker launch rejected"
                    );
                }

                let started = output.tasks().len() as u32;
                if started == 0 {
                    break;
                }
                accepted += started.min(remaining);
                remaining -= started.min(remaining);
            }

            Ok(accepted)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_source_keeps_slashes_and_escapes_the_rest() {
        assert_eq!(copy_source("src", "a/b.txt"), "src/a/b.txt");
        assert_eq!(
            copy_source("src", "reports 2024/q1+final.csv"),
            "src/reports%202024/q1%2Bfinal.csv"
        );
    }

    #[test]
    fn lease_gone_codes_are_recognized() {
        assert!(is_lease_gone_code(Some("MessageNotInflight")));
        assert!(is_lease_gone_code(Some("ReceiptHandleIsInvalid")));
        assert!(!is_lease_gone_code(Some("Throttling")));
        assert!(!is_lease_gone_code(None));
    }

    #[test]
    fn copy_size_refusals_need_the_invalid_request_code() {
        assert!(is_copy_size_refusal(
            Some("InvalidRequest"),
            Some("The specified copy source is larger than the maximum allowable size"),
        ));
        assert!(!is_copy_size_refusal(Some("InvalidRequest"), Some("bad header")));
        assert!(!is_copy_size_refusal(Some("AccessDenied"), Some("copy source")));
    }

    #[test]
    fn csv_splitting_trims_and_drops_empties() {
        assert_eq!(
            split_csv(Some("subnet-1, subnet-2,,".into())),
            vec!["subnet-1".to_owned(), "subnet-2".to_owned()]
        );
        assert!(split_csv(None).is_empty());
    }
}
