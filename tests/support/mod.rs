//! In-memory implementations of the collaborator contracts, with failure
//! injection hooks for the end-to-end scenarios.

// Each integration suite compiles this module separately and uses a subset.
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use bucketsync::{
    ByteRange, CapacityWeighting, CompletedPartTag, ComputeLauncher, MessageReceipt, ObjectHead,
    PartCopy, QueueClient, QueueDepth, QueueMessage, SourceStore, StoreError, TargetStore,
    WorkerCensus,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn sync_message(id: &str, records: &[String]) -> QueueMessage {
    QueueMessage {
        id: id.to_owned(),
        body: format!(r#"{{"Records":[{}]}}"#, records.join(",")),
        receipt: MessageReceipt::new(format!("receipt-{id}")),
        attempts: 1,
    }
}

pub fn created_record(bucket: &str, key: &str, size: u64) -> String {
    format!(
        r#"{{"eventName":"ObjectCreated:Put","s3":{{"bucket":{{"name":"{bucket}"}},"object":{{"key":"{key}","size":{size}}}}}}}"#
    )
}

pub fn removed_record(bucket: &str, key: &str) -> String {
    format!(
        r#"{{"eventName":"ObjectRemoved:Delete","s3":{{"bucket":{{"name":"{bucket}"}},"object":{{"key":"{key}"}}}}}}"#
    )
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockQueue {
    messages: Mutex<VecDeque<QueueMessage>>,
    pub acked: Mutex<Vec<String>>,
    pub extensions: AtomicUsize,
    pub receives: AtomicUsize,
    depth: Mutex<QueueDepth>,
    receive_failures: AtomicUsize,
}

impl MockQueue {
    pub fn with_messages(messages: Vec<QueueMessage>) -> Self {
        Self {
            messages: Mutex::new(messages.into()),
            ..Self::default()
        }
    }

    /// Makes the next `count` receive calls fail.
    pub fn fail_receives(&self, count: usize) {
        self.receive_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_depth(&self, depth: QueueDepth) {
        *self.depth.lock().unwrap() = depth;
    }

    pub fn acked_receipts(&self) -> Vec<String> {
        self.acked.lock().unwrap().clone()
    }
}

impl QueueClient for MockQueue {
    fn receive(
        &self,
        _wait: Duration,
        max_messages: usize,
    ) -> BoxFuture<'_, Result<Vec<QueueMessage>>> {
        async move {
            self.receives.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .receive_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                    remaining.checked_sub(1)
                })
                .is_ok();
            if failing {
                return Err(anyhow!("injected receive failure"));
            }
            let mut queue = self.messages.lock().unwrap();
            let mut batch = Vec::new();
            while batch.len() < max_messages {
                match queue.pop_front() {
                    Some(message) => batch.push(message),
                    None => break,
                }
            }
            Ok(batch)
        }
        .boxed()
    }

    fn ack<'a>(&'a self, receipt: &'a MessageReceipt) -> BoxFuture<'a, Result<()>> {
        async move {
            self.acked.lock().unwrap().push(receipt.as_str().to_owned());
            Ok(())
        }
        .boxed()
    }

    fn extend<'a>(
        &'a self,
        _receipt: &'a MessageReceipt,
        _visibility: Duration,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            self.extensions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        .boxed()
    }

    fn depth(&self) -> BoxFuture<'_, Result<QueueDepth>> {
        async move { Ok(*self.depth.lock().unwrap()) }.boxed()
    }
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockSource {
    objects: Mutex<HashMap<String, ObjectHead>>,
}

impl MockSource {
    pub fn with_object(key: &str, size: u64, etag: &str) -> Self {
        let source = Self::default();
        source.put(key, size, etag);
        source
    }

    pub fn put(&self, key: &str, size: u64, etag: &str) {
        self.objects.lock().unwrap().insert(
            key.to_owned(),
            ObjectHead {
                size,
                etag: Some(etag.to_owned()),
            },
        );
    }
}

impl SourceStore for MockSource {
    fn head<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<ObjectHead>>> {
        async move { Ok(self.objects.lock().unwrap().get(key).cloned()) }.boxed()
    }
}

#[derive(Default)]
pub struct MockTarget {
    pub objects: Mutex<HashMap<String, ObjectHead>>,
    pub single_copies: Mutex<Vec<String>>,
    pub initiated: Mutex<Vec<String>>,
    pub part_calls: Mutex<Vec<(i32, ByteRange)>>,
    pub completions: Mutex<Vec<Vec<CompletedPartTag>>>,
    pub aborts: Mutex<Vec<String>>,
    pub deletes: Mutex<Vec<String>>,
    upload_counter: AtomicUsize,
    /// part number → remaining transient failures to inject.
    part_failures: Mutex<HashMap<i32, usize>>,
    /// When set, part copies hang until the caller cancels them.
    pub stall_parts: Mutex<bool>,
    pub delete_reports_not_found: Mutex<bool>,
    /// When set, single copies fail as oversized, forcing escalation.
    pub refuse_single_copy: Mutex<bool>,
}

impl MockTarget {
    pub fn fail_part_times(&self, part_number: i32, times: usize) {
        self.part_failures
            .lock()
            .unwrap()
            .insert(part_number, times);
    }

    pub fn stall_part_copies(&self) {
        *self.stall_parts.lock().unwrap() = true;
    }

    pub fn report_delete_not_found(&self) {
        *self.delete_reports_not_found.lock().unwrap() = true;
    }

    pub fn refuse_single_copies(&self) {
        *self.refuse_single_copy.lock().unwrap() = true;
    }
}

impl TargetStore for MockTarget {
    fn head<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<ObjectHead>>> {
        async move { Ok(self.objects.lock().unwrap().get(key).cloned()) }.boxed()
    }

    fn copy_single<'a>(
        &'a self,
        _src_bucket: &'a str,
        src_key: &'a str,
        _dst_key: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            if *self.refuse_single_copy.lock().unwrap() {
                return Err(anyhow!(StoreError::SingleCopyTooLarge));
            }
            self.single_copies.lock().unwrap().push(src_key.to_owned());
            Ok(())
        }
        .boxed()
    }

    fn initiate_multipart<'a>(&'a self, dst_key: &'a str) -> BoxFuture<'a, Result<String>> {
        async move {
            let upload_id = format!(
                "upload-{}-{dst_key}",
                self.upload_counter.fetch_add(1, Ordering::SeqCst)
            );
            self.initiated.lock().unwrap().push(upload_id.clone());
            Ok(upload_id)
        }
        .boxed()
    }

    fn copy_part<'a>(&'a self, part: PartCopy<'a>) -> BoxFuture<'a, Result<String>> {
        let number = part.part_number;
        let range = part.range;
        async move {
            if *self.stall_parts.lock().unwrap() {
                // Hang until the caller's cancellation races us.
                std::future::pending::<()>().await;
            }

            self.part_calls.lock().unwrap().push((number, range));

            let should_fail = {
                let mut failures = self.part_failures.lock().unwrap();
                match failures.get_mut(&number) {
                    Some(remaining) if *remaining > 0 => {
                        *remaining -= 1;
                        true
                    }
                    _ => false,
                }
            };
            if should_fail {
                return Err(anyhow!("injected transient failure for part {number}"));
            }

            Ok(format!("etag-{number}"))
        }
        .boxed()
    }

    fn complete_multipart<'a>(
        &'a self,
        _dst_key: &'a str,
        _upload_id: &'a str,
        parts: &'a [CompletedPartTag],
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            self.completions.lock().unwrap().push(parts.to_vec());
            Ok(())
        }
        .boxed()
    }

    fn abort_multipart<'a>(
        &'a self,
        _dst_key: &'a str,
        upload_id: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            self.aborts.lock().unwrap().push(upload_id.to_owned());
            Ok(())
        }
        .boxed()
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            self.deletes.lock().unwrap().push(key.to_owned());
            if *self.delete_reports_not_found.lock().unwrap() {
                return Err(anyhow!(StoreError::NotFound));
            }
            self.objects.lock().unwrap().remove(key);
            Ok(())
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// Launcher
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockLauncher {
    census: Mutex<WorkerCensus>,
    pub launch_requests: Mutex<Vec<(CapacityWeighting, u32)>>,
    /// Scripted responses consumed per launch call; when exhausted, every
    /// request is accepted in full.
    responses: Mutex<VecDeque<Result<u32>>>,
}

impl MockLauncher {
    pub fn with_census(running: u64, pending: u64) -> Self {
        Self {
            census: Mutex::new(WorkerCensus::new(running, pending)),
            ..Self::default()
        }
    }

    pub fn script_response(&self, response: Result<u32>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn requested_total(&self) -> u32 {
        self.launch_requests
            .lock()
            .unwrap()
            .iter()
            .map(|(_, count)| count)
            .sum()
    }
}

impl ComputeLauncher for MockLauncher {
    fn list_workers(&self) -> BoxFuture<'_, Result<WorkerCensus>> {
        async move { Ok(*self.census.lock().unwrap()) }.boxed()
    }

    fn launch(&self, weighting: CapacityWeighting, count: u32) -> BoxFuture<'_, Result<u32>> {
        async move {
            self.launch_requests
                .lock()
                .unwrap()
                .push((weighting, count));
            match self.responses.lock().unwrap().pop_front() {
                Some(response) => response,
                None => Ok(count),
            }
        }
        .boxed()
    }
}
