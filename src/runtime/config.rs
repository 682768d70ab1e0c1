use anyhow::{bail, Context, Result};
use std::env;
use std::time::Duration;

/// Largest part count a multipart upload may carry.
pub const MAX_PARTS: u64 = 10_000;
/// Smallest part size the target store accepts (except for the final part).
pub const PART_SIZE_MIN: u64 = 5 * 1024 * 1024;
/// Largest byte range a single part copy may cover.
pub const PART_SIZE_MAX: u64 = 5 * 1024 * 1024 * 1024;
/// Largest object a single-call server-side copy may cover.
pub const SINGLE_COPY_MAX: u64 = 5 * 1024 * 1024 * 1024;
/// Longest long-poll wait the queue supports.
pub const WAIT_TIME_MAX: Duration = Duration::from_secs(20);

const DEFAULT_MAX_WORKERS: u32 = 64;
const DEFAULT_TARGET_BACKLOG_PER_WORKER: u32 = 3;
const DEFAULT_BURST_START_LIMIT: u32 = 20;
const DEFAULT_DISPATCH_PERIOD_SECS: u64 = 60;
const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 1_800;
const DEFAULT_EXTEND_INTERVAL_SECS: u64 = 300;
const DEFAULT_EMPTY_POLLS_BEFORE_EXIT: u32 = 3;
const DEFAULT_WAIT_TIME_SECS: u64 = 20;
const DEFAULT_RECEIVE_BATCH: usize = 1;
const DEFAULT_COPY_PARALLELISM: usize = 256;
const DEFAULT_PART_SIZE: u64 = 64 * 1024 * 1024;
const DEFAULT_SINGLE_COPY_CEILING: u64 = 5 * 1024 * 1024 * 1024;
const DEFAULT_PART_RETRIES: usize = 3;
const DEFAULT_DELETE_RETRIES: usize = 3;
const DEFAULT_LAUNCH_RETRIES: usize = 3;
const DEFAULT_DRAIN_DEADLINE_SECS: u64 = 25;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Runtime configuration shared by the worker and the dispatcher.
///
/// All instances must be constructed via [`MirrorConfig::builder`],
/// [`MirrorConfig::new`], or [`MirrorConfig::from_env`] so invariants are
/// validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorConfig {
    source_bucket: String,
    target_bucket: String,
    queue_url: String,
    prefix_filter: String,
    max_workers: u32,
    target_backlog_per_worker: u32,
    burst_start_limit: u32,
    dispatch_period: Duration,
    visibility_timeout: Duration,
    extend_interval: Duration,
    empty_polls_before_exit: u32,
    wait_time: Duration,
    receive_batch: usize,
    copy_parallelism: usize,
    part_size: u64,
    single_copy_ceiling: u64,
    part_retries: usize,
    delete_retries: usize,
    launch_retries: usize,
    drain_deadline: Duration,
    request_timeout: Duration,
}

pub struct MirrorConfigParams {
    pub source_bucket: String,
    pub target_bucket: String,
    pub queue_url: String,
    pub prefix_filter: String,
    pub max_workers: u32,
    pub target_backlog_per_worker: u32,
    pub burst_start_limit: u32,
    pub dispatch_period: Duration,
    pub visibility_timeout: Duration,
    pub extend_interval: Duration,
    pub empty_polls_before_exit: u32,
    pub wait_time: Duration,
    pub receive_batch: usize,
    pub copy_parallelism: usize,
    pub part_size: u64,
    pub single_copy_ceiling: u64,
    pub part_retries: usize,
    pub delete_retries: usize,
    pub launch_retries: usize,
    pub drain_deadline: Duration,
    pub request_timeout: Duration,
}

impl MirrorConfig {
    /// Returns a builder to incrementally construct and validate a
    /// configuration.
    pub fn builder() -> MirrorConfigBuilder {
        MirrorConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    pub fn new(params: MirrorConfigParams) -> Result<Self> {
        let MirrorConfigParams {
            source_bucket,
            target_bucket,
            queue_url,
            prefix_filter,
            max_workers,
            target_backlog_per_worker,
            burst_start_limit,
            dispatch_period,
            visibility_timeout,
            extend_interval,
            empty_polls_before_exit,
            wait_time,
            receive_batch,
            copy_parallelism,
            part_size,
            single_copy_ceiling,
            part_retries,
            delete_retries,
            launch_retries,
            drain_deadline,
            request_timeout,
        } = params;

        let config = Self {
            source_bucket: trimmed_string(source_bucket),
            target_bucket: trimmed_string(target_bucket),
            queue_url: trimmed_string(queue_url),
            prefix_filter,
            max_workers,
            target_backlog_per_worker,
            burst_start_limit,
            dispatch_period,
            visibility_timeout,
            extend_interval,
            empty_polls_before_exit,
            wait_time,
            receive_batch,
            copy_parallelism,
            part_size,
            single_copy_ceiling,
            part_retries,
            delete_retries,
            launch_retries,
            drain_deadline,
            request_timeout,
        };

        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration from the documented environment variables.
    pub fn from_env() -> Result<Self> {
        let mut builder = Self::builder()
            .source_bucket(require_env("SOURCE_BUCKET")?)
            .target_bucket(require_env("TARGET_BUCKET")?)
            .queue_url(require_env("QUEUE_URL")?);

        if let Some(prefix) = optional_env("PREFIX_FILTER") {
            builder = builder.prefix_filter(prefix);
        }
        if let Some(value) = parse_env::<u32>("MAX_WORKERS")? {
            builder = builder.max_workers(value);
        }
        if let Some(value) = parse_env::<u32>("TARGET_BACKLOG_PER_TASK")? {
            builder = builder.target_backlog_per_worker(value);
        }
        if let Some(value) = parse_env::<u32>("BURST_START_LIMIT")? {
            builder = builder.burst_start_limit(value);
        }
        if let Some(value) = parse_env::<u64>("DISPATCH_PERIOD")? {
            builder = builder.dispatch_period(Duration::from_secs(value));
        }
        if let Some(value) = parse_env::<u64>("VISIBILITY_TIMEOUT")? {
            builder = builder.visibility_timeout(Duration::from_secs(value));
        }
        if let Some(value) = parse_env::<u64>("EXTEND_INTERVAL")? {
            builder = builder.extend_interval(Duration::from_secs(value));
        }
        if let Some(value) = parse_env::<u32>("EMPTY_POLLS_BEFORE_EXIT")? {
            builder = builder.empty_polls_before_exit(value);
        }
        if let Some(value) = parse_env::<u64>("WAIT_TIME_SECONDS")? {
            builder = builder.wait_time(Duration::from_secs(value));
        }
        if let Some(value) = parse_env::<usize>("BATCH")? {
            builder = builder.receive_batch(value);
        }
        if let Some(value) = parse_env::<usize>("COPY_PARALLELISM")? {
            builder = builder.copy_parallelism(value);
        }
        if let Some(value) = parse_env::<u64>("PART_SIZE")? {
            builder = builder.part_size(value);
        }
        if let Some(value) = parse_env::<u64>("SINGLE_COPY_CEILING")? {
            builder = builder.single_copy_ceiling(value);
        }
        if let Some(value) = parse_env::<usize>("PART_RETRIES")? {
            builder = builder.part_retries(value);
        }
        if let Some(value) = parse_env::<usize>("DELETE_RETRIES")? {
            builder = builder.delete_retries(value);
        }
        if let Some(value) = parse_env::<usize>("LAUNCH_RETRIES")? {
            builder = builder.launch_retries(value);
        }
        if let Some(value) = parse_env::<u64>("DRAIN_DEADLINE")? {
            builder = builder.drain_deadline(Duration::from_secs(value));
        }
        if let Some(value) = parse_env::<u64>("REQUEST_TIMEOUT")? {
            builder = builder.request_timeout(Duration::from_secs(value));
        }

        builder.build()
    }

    pub fn source_bucket(&self) -> &str {
        &self.source_bucket
    }

    pub fn target_bucket(&self) -> &str {
        &self.target_bucket
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    /// Key prefix events must match; empty means no filtering.
    pub fn prefix_filter(&self) -> &str {
        &self.prefix_filter
    }

    /// Cap on running plus pending workers.
    pub fn max_workers(&self) -> u32 {
        self.max_workers
    }

    /// Backlog messages one worker is expected to absorb.
    pub fn target_backlog_per_worker(&self) -> u32 {
        self.target_backlog_per_worker
    }

    /// Most workers one dispatcher tick may launch.
    pub fn burst_start_limit(&self) -> u32 {
        self.burst_start_limit
    }

    /// Interval at which the external clock invokes the dispatcher.
    pub fn dispatch_period(&self) -> Duration {
        self.dispatch_period
    }

    /// Initial and per-extension message lease duration.
    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    /// Tick interval of the visibility keeper.
    pub fn extend_interval(&self) -> Duration {
        self.extend_interval
    }

    /// Consecutive empty polls before a worker exits.
    pub fn empty_polls_before_exit(&self) -> u32 {
        self.empty_polls_before_exit
    }

    /// Long-poll wait per receive call.
    pub fn wait_time(&self) -> Duration {
        self.wait_time
    }

    /// Most messages fetched per receive call; each is processed serially.
    pub fn receive_batch(&self) -> usize {
        self.receive_batch
    }

    /// Concurrent part copies per worker.
    pub fn copy_parallelism(&self) -> usize {
        self.copy_parallelism
    }

    /// Preferred multipart part size in bytes.
    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Objects below this use a single server-side copy call.
    pub fn single_copy_ceiling(&self) -> u64 {
        self.single_copy_ceiling
    }

    /// Attempts per part copy.
    pub fn part_retries(&self) -> usize {
        self.part_retries
    }

    /// Attempts per target delete.
    pub fn delete_retries(&self) -> usize {
        self.delete_retries
    }

    /// In-invocation launch attempts per dispatcher tick.
    pub fn launch_retries(&self) -> usize {
        self.launch_retries
    }

    /// Hard ceiling on graceful-shutdown duration.
    pub fn drain_deadline(&self) -> Duration {
        self.drain_deadline
    }

    /// Per-request timeout on every queue and store call.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        ensure_not_empty(&self.source_bucket, "source_bucket")?;
        ensure_not_empty(&self.target_bucket, "target_bucket")?;
        ensure_not_empty(&self.queue_url, "queue_url")?;

        if self.source_bucket == self.target_bucket {
            bail!("source_bucket and target_bucket must differ");
        }

        if self.max_workers == 0 {
            bail!("max_workers must be greater than 0");
        }

        if self.target_backlog_per_worker == 0 {
            bail!("target_backlog_per_worker must be greater than 0");
        }

        if self.burst_start_limit == 0 {
            bail!("burst_start_limit must be greater than 0");
        }

        if self.dispatch_period.is_zero() {
            bail!("dispatch_period must be greater than 0");
        }

        if self.visibility_timeout.is_zero() {
            bail!("visibility_timeout must be greater than 0");
        }

        if self.extend_interval >= self.visibility_timeout {
            bail!(
                "extend_interval ({:?}) must be shorter than visibility_timeout ({:?}) \
                 or the lease lapses between extensions",
                self.extend_interval,
                self.visibility_timeout,
            );
        }

        if self.empty_polls_before_exit == 0 {
            bail!("empty_polls_before_exit must be greater than 0");
        }

        if self.wait_time > WAIT_TIME_MAX {
            bail!(
                "wait_time ({:?}) exceeds the queue's long-poll maximum ({:?})",
                self.wait_time,
                WAIT_TIME_MAX,
            );
        }

        if self.receive_batch == 0 {
            bail!("receive_batch must be greater than 0");
        }

        if self.copy_parallelism == 0 {
            bail!("copy_parallelism must be greater than 0");
        }

        if self.part_size < PART_SIZE_MIN {
            bail!(
                "part_size ({}) is below the platform minimum ({PART_SIZE_MIN})",
                self.part_size,
            );
        }

        if self.part_size > PART_SIZE_MAX {
            bail!(
                "part_size ({}) exceeds the platform per-part maximum ({PART_SIZE_MAX})",
                self.part_size,
            );
        }

        if self.single_copy_ceiling == 0 {
            bail!("single_copy_ceiling must be greater than 0");
        }

        if self.single_copy_ceiling > SINGLE_COPY_MAX {
            bail!(
                "single_copy_ceiling ({}) exceeds the platform single-copy maximum \
                 ({SINGLE_COPY_MAX})",
                self.single_copy_ceiling,
            );
        }

        if self.part_retries == 0 {
            bail!("part_retries must be greater than 0");
        }

        if self.delete_retries == 0 {
            bail!("delete_retries must be greater than 0");
        }

        if self.launch_retries == 0 {
            bail!("launch_retries must be greater than 0");
        }

        if self.drain_deadline.is_zero() {
            bail!("drain_deadline must be greater than 0");
        }

        if self.request_timeout.is_zero() {
            bail!("request_timeout must be greater than 0");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct MirrorConfigBuilder {
    source_bucket: Option<String>,
    target_bucket: Option<String>,
    queue_url: Option<String>,
    prefix_filter: Option<String>,
    max_workers: Option<u32>,
    target_backlog_per_worker: Option<u32>,
    burst_start_limit: Option<u32>,
    dispatch_period: Option<Duration>,
    visibility_timeout: Option<Duration>,
    extend_interval: Option<Duration>,
    empty_polls_before_exit: Option<u32>,
    wait_time: Option<Duration>,
    receive_batch: Option<usize>,
    copy_parallelism: Option<usize>,
    part_size: Option<u64>,
    single_copy_ceiling: Option<u64>,
    part_retries: Option<usize>,
    delete_retries: Option<usize>,
    launch_retries: Option<usize>,
    drain_deadline: Option<Duration>,
    request_timeout: Option<Duration>,
}

impl MirrorConfigBuilder {
    pub fn source_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.source_bucket = Some(bucket.into());
        self
    }

    pub fn target_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.target_bucket = Some(bucket.into());
        self
    }

    pub fn queue_url(mut self, url: impl Into<String>) -> Self {
        self.queue_url = Some(url.into());
        self
    }

    pub fn prefix_filter(mut self, prefix: impl Into<String>) -> Self {
        self.prefix_filter = Some(prefix.into());
        self
    }

    pub fn max_workers(mut self, workers: u32) -> Self {
        self.max_workers = Some(workers);
        self
    }

    pub fn target_backlog_per_worker(mut self, backlog: u32) -> Self {
        self.target_backlog_per_worker = Some(backlog);
        self
    }

    pub fn burst_start_limit(mut self, limit: u32) -> Self {
        self.burst_start_limit = Some(limit);
        self
    }

    pub fn dispatch_period(mut self, period: Duration) -> Self {
        self.dispatch_period = Some(period);
        self
    }

    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = Some(timeout);
        self
    }

    pub fn extend_interval(mut self, interval: Duration) -> Self {
        self.extend_interval = Some(interval);
        self
    }

    pub fn empty_polls_before_exit(mut self, polls: u32) -> Self {
        self.empty_polls_before_exit = Some(polls);
        self
    }

    pub fn wait_time(mut self, wait: Duration) -> Self {
        self.wait_time = Some(wait);
        self
    }

    pub fn receive_batch(mut self, batch: usize) -> Self {
        self.receive_batch = Some(batch);
        self
    }

    pub fn copy_parallelism(mut self, parallelism: usize) -> Self {
        self.copy_parallelism = Some(parallelism);
        self
    }

    pub fn part_size(mut self, bytes: u64) -> Self {
        self.part_size = Some(bytes);
        self
    }

    pub fn single_copy_ceiling(mut self, bytes: u64) -> Self {
        self.single_copy_ceiling = Some(bytes);
        self
    }

    pub fn part_retries(mut self, retries: usize) -> Self {
        self.part_retries = Some(retries);
        self
    }

    pub fn delete_retries(mut self, retries: usize) -> Self {
        self.delete_retries = Some(retries);
        self
    }

    pub fn launch_retries(mut self, retries: usize) -> Self {
        self.launch_retries = Some(retries);
        self
    }

    pub fn drain_deadline(mut self, deadline: Duration) -> Self {
        self.drain_deadline = Some(deadline);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<MirrorConfig> {
        let params = MirrorConfigParams {
            source_bucket: self.source_bucket.context("source_bucket is required")?,
            target_bucket: self.target_bucket.context("target_bucket is required")?,
            queue_url: self.queue_url.context("queue_url is required")?,
            prefix_filter: self.prefix_filter.unwrap_or_default(),
            max_workers: self.max_workers.unwrap_or(DEFAULT_MAX_WORKERS),
            target_backlog_per_worker: self
                .target_backlog_per_worker
                .unwrap_or(DEFAULT_TARGET_BACKLOG_PER_WORKER),
            burst_start_limit: self.burst_start_limit.unwrap_or(DEFAULT_BURST_START_LIMIT),
            dispatch_period: self
                .dispatch_period
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_DISPATCH_PERIOD_SECS)),
            visibility_timeout: self
                .visibility_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_VISIBILITY_TIMEOUT_SECS)),
            extend_interval: self
                .extend_interval
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_EXTEND_INTERVAL_SECS)),
            empty_polls_before_exit: self
                .empty_polls_before_exit
                .unwrap_or(DEFAULT_EMPTY_POLLS_BEFORE_EXIT),
            wait_time: self
                .wait_time
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_WAIT_TIME_SECS)),
            receive_batch: self.receive_batch.unwrap_or(DEFAULT_RECEIVE_BATCH),
            copy_parallelism: self.copy_parallelism.unwrap_or(DEFAULT_COPY_PARALLELISM),
            part_size: self.part_size.unwrap_or(DEFAULT_PART_SIZE),
            single_copy_ceiling: self
                .single_copy_ceiling
                .unwrap_or(DEFAULT_SINGLE_COPY_CEILING),
            part_retries: self.part_retries.unwrap_or(DEFAULT_PART_RETRIES),
            delete_retries: self.delete_retries.unwrap_or(DEFAULT_DELETE_RETRIES),
            launch_retries: self.launch_retries.unwrap_or(DEFAULT_LAUNCH_RETRIES),
            drain_deadline: self
                .drain_deadline
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_DRAIN_DEADLINE_SECS)),
            request_timeout: self
                .request_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)),
        };

        MirrorConfig::new(params)
    }
}

fn trimmed_string(value: String) -> String {
    value.trim().to_owned()
}

fn ensure_not_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{field} cannot be empty");
    }
    Ok(())
}

fn require_env(name: &str) -> Result<String> {
    optional_env(name).with_context(|| format!("{name} is required"))
}

fn optional_env(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

fn parse_env<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional_env(name) {
        Some(raw) => {
            let value = raw
                .trim()
                .parse::<T>()
                .with_context(|| format!("{name} has an unparsable value: {raw:?}"))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}
