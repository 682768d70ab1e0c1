use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back
/// to `info`. Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Lightweight rolling counters used to derive runtime metrics.
#[derive(Default, Debug)]
pub struct Telemetry {
    objects_copied: AtomicU64,
    bytes_copied: AtomicU64,
    multipart_copies: AtomicU64,
    objects_deleted: AtomicU64,
    events_skipped: AtomicU64,
    copy_failures: AtomicU64,
    delete_failures: AtomicU64,
    part_retries: AtomicU64,
    lease_losses: AtomicU64,
    messages_acked: AtomicU64,
    messages_redriven: AtomicU64,
    empty_polls: AtomicU64,
    workers_launched: AtomicU64,
}

impl Telemetry {
    pub fn record_copied(&self, bytes: u64) {
        self.objects_copied.fetch_add(1, Ordering::Relaxed);
        self.bytes_copied.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_multipart_copy(&self) {
        self.multipart_copies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deleted(&self) {
        self.objects_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.events_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_copy_failure(&self) {
        self.copy_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete_failure(&self) {
        self.delete_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_part_retry(&self) {
        self.part_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lease_lost(&self) {
        self.lease_losses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acked(&self) {
        self.messages_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_redriven(&self) {
        self.messages_redriven.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_empty_poll(&self) {
        self.empty_polls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_workers_launched(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.workers_launched.fetch_add(count, Ordering::Relaxed);
    }

    pub fn objects_copied(&self) -> u64 {
        self.objects_copied.load(Ordering::Relaxed)
    }

    pub fn objects_deleted(&self) -> u64 {
        self.objects_deleted.load(Ordering::Relaxed)
    }

    pub fn messages_acked(&self) -> u64 {
        self.messages_acked.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            objects_copied: self.objects_copied.load(Ordering::Relaxed),
            bytes_copied: self.bytes_copied.load(Ordering::Relaxed),
            multipart_copies: self.multipart_copies.load(Ordering::Relaxed),
            objects_deleted: self.objects_deleted.load(Ordering::Relaxed),
            events_skipped: self.events_skipped.load(Ordering::Relaxed),
            copy_failures: self.copy_failures.load(Ordering::Relaxed),
            delete_failures: self.delete_failures.load(Ordering::Relaxed),
            part_retries: self.part_retries.load(Ordering::Relaxed),
            lease_losses: self.lease_losses.load(Ordering::Relaxed),
            messages_acked: self.messages_acked.load(Ordering::Relaxed),
            messages_redriven: self.messages_redriven.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
            workers_launched: self.workers_launched.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub objects_copied: u64,
    pub bytes_copied: u64,
    pub multipart_copies: u64,
    pub objects_deleted: u64,
    pub events_skipped: u64,
    pub copy_failures: u64,
    pub delete_failures: u64,
    pub part_retries: u64,
    pub lease_losses: u64,
    pub messages_acked: u64,
    pub messages_redriven: u64,
    pub empty_polls: u64,
    pub workers_launched: u64,
}

/// Spawns a background task that periodically logs throughput and failure
/// counters until `shutdown` fires.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "bucketsync::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current = telemetry.snapshot();
                    let copied_delta = current
                        .objects_copied
                        .saturating_sub(last_snapshot.objects_copied);
                    let bytes_delta = current
                        .bytes_copied
                        .saturating_sub(last_snapshot.bytes_copied);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        bytes_delta as f64 / elapsed
                    };

                    tracing::info!(
                        target: "bucketsync::metrics",
                        copied = current.objects_copied,
                        copied_delta,
                        bytes_per_sec = format!("{throughput:.0}"),
                        deleted = current.objects_deleted,
                        skipped = current.events_skipped,
                        copy_failures = current.copy_failures,
                        delete_failures = current.delete_failures,
                        part_retries = current.part_retries,
                        lease_losses = current.lease_losses,
                        acked = current.messages_acked,
                        redriven = current.messages_redriven,
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current;
                    last_tick = Instant::now();
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn telemetry_records_counters() {
        let telemetry = Telemetry::default();
        telemetry.record_copied(10);
        telemetry.record_copied(2_048);
        telemetry.record_multipart_copy();
        telemetry.record_deleted();
        telemetry.record_skipped();
        telemetry.record_copy_failure();
        telemetry.record_part_retry();
        telemetry.record_lease_lost();
        telemetry.record_acked();
        telemetry.record_redriven();
        telemetry.record_workers_launched(3);
        telemetry.record_workers_launched(0);

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.objects_copied, 2);
        assert_eq!(snapshot.bytes_copied, 2_058);
        assert_eq!(snapshot.multipart_copies, 1);
        assert_eq!(snapshot.objects_deleted, 1);
        assert_eq!(snapshot.events_skipped, 1);
        assert_eq!(snapshot.copy_failures, 1);
        assert_eq!(snapshot.part_retries, 1);
        assert_eq!(snapshot.lease_losses, 1);
        assert_eq!(snapshot.messages_acked, 1);
        assert_eq!(snapshot.messages_redriven, 1);
        assert_eq!(snapshot.workers_launched, 3);
    }

    #[tokio::test]
    async fn metrics_reporter_logs_until_shutdown() {
        let telemetry = Arc::new(Telemetry::default());
        telemetry.record_copied(64);

        let shutdown = CancellationToken::new();
        let handle =
            spawn_metrics_reporter(telemetry, shutdown.clone(), Duration::from_millis(10));

        shutdown.cancel();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("reporter should stop promptly")
            .expect("task should not panic");
    }
}
