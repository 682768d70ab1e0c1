//! End-to-end worker scenarios against in-memory collaborators.

mod support;

use bucketsync::{MirrorConfig, QueueDepth, Worker, WorkerParams, WorkerState, Telemetry};
use std::sync::Arc;
use std::time::Duration;
use support::{created_record, removed_record, sync_message, MockQueue, MockSource, MockTarget};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

fn test_config() -> MirrorConfig {
    MirrorConfig::builder()
        .source_bucket("src")
        .target_bucket("dst")
        .queue_url("https://queue.local/mirror")
        .wait_time(Duration::ZERO)
        .empty_polls_before_exit(1)
        .drain_deadline(Duration::from_secs(5))
        .build()
        .expect("test config should validate")
}

struct Fixture {
    queue: Arc<MockQueue>,
    source: Arc<MockSource>,
    target: Arc<MockTarget>,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
}

impl Fixture {
    fn new(queue: MockQueue, source: MockSource, target: MockTarget) -> Self {
        Self {
            queue: Arc::new(queue),
            source: Arc::new(source),
            target: Arc::new(target),
            telemetry: Arc::new(Telemetry::default()),
            shutdown: CancellationToken::new(),
        }
    }

    fn worker(&self, config: MirrorConfig) -> Worker {
        Worker::new(WorkerParams {
            config,
            queue: self.queue.clone(),
            source: self.source.clone(),
            target: self.target.clone(),
            telemetry: self.telemetry.clone(),
            shutdown: self.shutdown.clone(),
        })
    }
}

#[tokio::test(start_paused = true)]
async fn small_create_uses_a_single_copy_and_acks() {
    let fixture = Fixture::new(
        MockQueue::with_messages(vec![sync_message(
            "m1",
            &[created_record("src", "a/b.txt", 10)],
        )]),
        MockSource::with_object("a/b.txt", 10, "etag-a"),
        MockTarget::default(),
    );

    let worker = fixture.worker(test_config());
    assert_eq!(worker.state(), WorkerState::Starting);
    let summary = worker.run().await.unwrap();

    assert_eq!(summary.messages_processed, 1);
    assert!(!summary.drained);
    assert_eq!(
        fixture.target.single_copies.lock().unwrap().as_slice(),
        ["a/b.txt"]
    );
    assert!(fixture.target.initiated.lock().unwrap().is_empty());
    assert_eq!(fixture.queue.acked_receipts(), ["receipt-m1"]);
}

#[tokio::test(start_paused = true)]
async fn seven_gib_create_runs_a_full_multipart_copy() {
    let size = 7 * GIB;
    let fixture = Fixture::new(
        MockQueue::with_messages(vec![sync_message(
            "m1",
            &[created_record("src", "big.bin", size)],
        )]),
        MockSource::with_object("big.bin", size, "etag-big"),
        MockTarget::default(),
    );

    let summary = fixture.worker(test_config()).run().await.unwrap();
    assert_eq!(summary.messages_processed, 1);

    assert!(fixture.target.single_copies.lock().unwrap().is_empty());
    assert_eq!(fixture.target.initiated.lock().unwrap().len(), 1);
    assert_eq!(fixture.target.part_calls.lock().unwrap().len(), 112);
    assert!(fixture.target.aborts.lock().unwrap().is_empty());

    let completions = fixture.target.completions.lock().unwrap();
    assert_eq!(completions.len(), 1);
    let parts = &completions[0];
    assert_eq!(parts.len(), 112);
    for (index, part) in parts.iter().enumerate() {
        assert_eq!(part.number, index as i32 + 1);
        assert_eq!(part.etag, format!("etag-{}", part.number));
    }

    let mut ranges: Vec<_> = fixture
        .target
        .part_calls
        .lock()
        .unwrap()
        .iter()
        .map(|(_, range)| *range)
        .collect();
    ranges.sort_by_key(|range| range.start);
    assert_eq!(ranges[0].start, 0);
    assert_eq!(ranges.last().unwrap().end, size - 1);
    for window in ranges.windows(2) {
        assert_eq!(window[1].start, window[0].end + 1);
    }

    assert_eq!(fixture.queue.acked_receipts(), ["receipt-m1"]);
}

#[tokio::test(start_paused = true)]
async fn missing_source_object_is_acked_without_copying() {
    let fixture = Fixture::new(
        MockQueue::with_messages(vec![sync_message(
            "m1",
            &[created_record("src", "gone.txt", 10)],
        )]),
        MockSource::default(),
        MockTarget::default(),
    );

    let summary = fixture.worker(test_config()).run().await.unwrap();

    assert_eq!(summary.messages_processed, 1);
    assert!(fixture.target.single_copies.lock().unwrap().is_empty());
    assert!(fixture.target.initiated.lock().unwrap().is_empty());
    assert_eq!(fixture.queue.acked_receipts(), ["receipt-m1"]);
}

#[tokio::test(start_paused = true)]
async fn identical_target_object_short_circuits_the_copy() {
    let target = MockTarget::default();
    target.objects.lock().unwrap().insert(
        "a/b.txt".to_owned(),
        bucketsync::ObjectHead {
            size: 10,
            etag: Some("etag-a".to_owned()),
        },
    );

    let fixture = Fixture::new(
        MockQueue::with_messages(vec![sync_message(
            "m1",
            &[created_record("src", "a/b.txt", 10)],
        )]),
        MockSource::with_object("a/b.txt", 10, "etag-a"),
        target,
    );

    let summary = fixture.worker(test_config()).run().await.unwrap();

    assert_eq!(summary.messages_processed, 1);
    assert!(fixture.target.single_copies.lock().unwrap().is_empty());
    assert_eq!(fixture.queue.acked_receipts(), ["receipt-m1"]);
}

#[tokio::test(start_paused = true)]
async fn delete_event_is_idempotent_against_a_missing_object() {
    let target = MockTarget::default();
    target.report_delete_not_found();

    let fixture = Fixture::new(
        MockQueue::with_messages(vec![sync_message("m1", &[removed_record("src", "x")])]),
        MockSource::default(),
        target,
    );

    let summary = fixture.worker(test_config()).run().await.unwrap();

    assert_eq!(summary.messages_processed, 1);
    assert_eq!(fixture.target.deletes.lock().unwrap().as_slice(), ["x"]);
    assert_eq!(fixture.queue.acked_receipts(), ["receipt-m1"]);
}

#[tokio::test(start_paused = true)]
async fn transient_part_failures_retry_and_still_complete() {
    let size = 80 * MIB;
    let target = MockTarget::default();
    target.fail_part_times(3, 2);

    let config = MirrorConfig::builder()
        .source_bucket("src")
        .target_bucket("dst")
        .queue_url("https://queue.local/mirror")
        .wait_time(Duration::ZERO)
        .empty_polls_before_exit(1)
        .part_size(8 * MIB)
        .single_copy_ceiling(8 * MIB)
        .copy_parallelism(4)
        .build()
        .unwrap();

    let fixture = Fixture::new(
        MockQueue::with_messages(vec![sync_message(
            "m1",
            &[created_record("src", "medium.bin", size)],
        )]),
        MockSource::with_object("medium.bin", size, "etag-m"),
        target,
    );

    let summary = fixture.worker(config).run().await.unwrap();
    assert_eq!(summary.messages_processed, 1);

    // Ten parts, plus two extra attempts for the flaky one.
    let part_calls = fixture.target.part_calls.lock().unwrap();
    assert_eq!(part_calls.len(), 12);
    assert_eq!(
        part_calls.iter().filter(|(number, _)| *number == 3).count(),
        3
    );
    drop(part_calls);

    let completions = fixture.target.completions.lock().unwrap();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].len(), 10);
    assert!(fixture.target.aborts.lock().unwrap().is_empty());
    assert_eq!(fixture.queue.acked_receipts(), ["receipt-m1"]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_part_retries_abort_the_upload_without_acking() {
    let size = 80 * MIB;
    let target = MockTarget::default();
    target.fail_part_times(5, 99);

    let config = MirrorConfig::builder()
        .source_bucket("src")
        .target_bucket("dst")
        .queue_url("https://queue.local/mirror")
        .wait_time(Duration::ZERO)
        .empty_polls_before_exit(1)
        .part_size(8 * MIB)
        .single_copy_ceiling(8 * MIB)
        .copy_parallelism(4)
        .part_retries(2)
        .build()
        .unwrap();

    let fixture = Fixture::new(
        MockQueue::with_messages(vec![sync_message(
            "m1",
            &[created_record("src", "medium.bin", size)],
        )]),
        MockSource::with_object("medium.bin", size, "etag-m"),
        target,
    );

    let summary = fixture.worker(config).run().await.unwrap();

    assert_eq!(summary.messages_processed, 0);
    assert_eq!(fixture.target.aborts.lock().unwrap().len(), 1);
    assert!(fixture.target.completions.lock().unwrap().is_empty());
    assert!(fixture.queue.acked_receipts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn size_refused_single_copy_escalates_to_multipart() {
    let size = 80 * MIB;
    let target = MockTarget::default();
    target.refuse_single_copies();

    let config = MirrorConfig::builder()
        .source_bucket("src")
        .target_bucket("dst")
        .queue_url("https://queue.local/mirror")
        .wait_time(Duration::ZERO)
        .empty_polls_before_exit(1)
        .part_size(8 * MIB)
        .build()
        .unwrap();

    let fixture = Fixture::new(
        MockQueue::with_messages(vec![sync_message(
            "m1",
            &[created_record("src", "surprise.bin", size)],
        )]),
        MockSource::with_object("surprise.bin", size, "etag-s"),
        target,
    );

    let summary = fixture.worker(config).run().await.unwrap();

    assert_eq!(summary.messages_processed, 1);
    assert!(fixture.target.single_copies.lock().unwrap().is_empty());
    assert_eq!(fixture.target.part_calls.lock().unwrap().len(), 10);
    assert_eq!(fixture.target.completions.lock().unwrap().len(), 1);
    assert_eq!(fixture.queue.acked_receipts(), ["receipt-m1"]);
}

#[tokio::test(start_paused = true)]
async fn sustained_queue_failures_exit_the_worker_non_zero() {
    let queue = MockQueue::default();
    queue.fail_receives(99);
    let fixture = Fixture::new(queue, MockSource::default(), MockTarget::default());

    let err = fixture.worker(test_config()).run().await.unwrap_err();
    assert!(matches!(
        bucketsync::MirrorError::find(&err),
        Some(bucketsync::MirrorError::QueueUnavailable)
    ));
}

#[tokio::test(start_paused = true)]
async fn malformed_message_is_left_for_the_redrive() {
    let mut message = sync_message("m1", &[]);
    message.body = "not json".to_owned();

    let fixture = Fixture::new(
        MockQueue::with_messages(vec![message]),
        MockSource::default(),
        MockTarget::default(),
    );

    let summary = fixture.worker(test_config()).run().await.unwrap();

    assert_eq!(summary.messages_processed, 0);
    assert!(fixture.queue.acked_receipts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn foreign_bucket_event_is_not_acked() {
    let fixture = Fixture::new(
        MockQueue::with_messages(vec![sync_message(
            "m1",
            &[created_record("elsewhere", "a", 10)],
        )]),
        MockSource::default(),
        MockTarget::default(),
    );

    let summary = fixture.worker(test_config()).run().await.unwrap();

    assert_eq!(summary.messages_processed, 0);
    assert!(fixture.queue.acked_receipts().is_empty());
    assert!(fixture.target.single_copies.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn keys_outside_the_prefix_filter_are_acked_as_no_ops() {
    let config = MirrorConfig::builder()
        .source_bucket("src")
        .target_bucket("dst")
        .queue_url("https://queue.local/mirror")
        .wait_time(Duration::ZERO)
        .empty_polls_before_exit(1)
        .prefix_filter("data/")
        .build()
        .unwrap();

    let fixture = Fixture::new(
        MockQueue::with_messages(vec![sync_message(
            "m1",
            &[created_record("src", "logs/app.log", 10)],
        )]),
        MockSource::with_object("logs/app.log", 10, "etag-l"),
        MockTarget::default(),
    );

    let summary = fixture.worker(config).run().await.unwrap();

    assert_eq!(summary.messages_processed, 1);
    assert!(fixture.target.single_copies.lock().unwrap().is_empty());
    assert_eq!(fixture.queue.acked_receipts(), ["receipt-m1"]);
}

#[tokio::test(start_paused = true)]
async fn one_failing_record_stops_the_message_after_earlier_successes() {
    let fixture = Fixture::new(
        MockQueue::with_messages(vec![sync_message(
            "m1",
            &[
                created_record("src", "ok.txt", 10),
                created_record("src", "broken.bin", 80 * MIB),
                created_record("src", "never.txt", 10),
            ],
        )]),
        {
            let source = MockSource::with_object("ok.txt", 10, "etag-ok");
            source.put("broken.bin", 80 * MIB, "etag-b");
            source.put("never.txt", 10, "etag-n");
            source
        },
        {
            let target = MockTarget::default();
            target.fail_part_times(1, 99);
            target
        },
    );

    let config = MirrorConfig::builder()
        .source_bucket("src")
        .target_bucket("dst")
        .queue_url("https://queue.local/mirror")
        .wait_time(Duration::ZERO)
        .empty_polls_before_exit(1)
        .part_size(8 * MIB)
        .single_copy_ceiling(16 * MIB)
        .part_retries(1)
        .build()
        .unwrap();

    let summary = fixture.worker(config).run().await.unwrap();

    assert_eq!(summary.messages_processed, 0);
    // First record succeeded, second failed, third never started.
    assert_eq!(
        fixture.target.single_copies.lock().unwrap().as_slice(),
        ["ok.txt"]
    );
    assert!(fixture.queue.acked_receipts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn idle_worker_exits_after_the_configured_empty_polls() {
    let fixture = Fixture::new(MockQueue::default(), MockSource::default(), MockTarget::default());

    let config = MirrorConfig::builder()
        .source_bucket("src")
        .target_bucket("dst")
        .queue_url("https://queue.local/mirror")
        .wait_time(Duration::ZERO)
        .empty_polls_before_exit(3)
        .build()
        .unwrap();

    let summary = fixture.worker(config).run().await.unwrap();

    assert_eq!(summary.messages_processed, 0);
    assert!(!summary.drained);
    assert_eq!(fixture.queue.receives.load(std::sync::atomic::Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn preemption_mid_multipart_aborts_and_leaves_the_message() {
    let size = 7 * GIB;
    let target = MockTarget::default();
    target.stall_part_copies();

    let fixture = Fixture::new(
        MockQueue::with_messages(vec![sync_message(
            "m1",
            &[created_record("src", "big.bin", size)],
        )]),
        MockSource::with_object("big.bin", size, "etag-big"),
        target,
    );

    let worker = fixture.worker(test_config());
    let shutdown = fixture.shutdown.clone();
    let handle = tokio::spawn(worker.run());

    // Let the worker pick up the message and stall inside the part pool.
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();

    let summary = timeout(Duration::from_secs(20), handle)
        .await
        .expect("worker should exit within the drain deadline")
        .expect("worker task should not panic")
        .expect("drain is a clean exit");

    assert!(summary.drained);
    assert_eq!(summary.messages_processed, 0);
    assert_eq!(fixture.target.aborts.lock().unwrap().len(), 1);
    assert!(fixture.target.completions.lock().unwrap().is_empty());
    assert!(fixture.queue.acked_receipts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn depth_passthrough_reports_both_counts() {
    let queue = MockQueue::default();
    queue.set_depth(QueueDepth::new(30, 5));
    let fixture = Fixture::new(queue, MockSource::default(), MockTarget::default());

    use bucketsync::QueueClient;
    let depth = fixture.queue.depth().await.unwrap();
    assert_eq!(depth.total(), 35);
}
