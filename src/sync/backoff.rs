use anyhow::{anyhow, Result};
use rand::Rng;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy)]
pub(crate) struct RetryBackoff<'a> {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<usize>,
    pub jitter: f64,
    pub cancellation: Option<&'a CancellationToken>,
}

impl<'a> RetryBackoff<'a> {
    pub(crate) fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts: None,
            jitter: 0.0,
            cancellation: None,
        }
    }

    pub(crate) fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Symmetric jitter fraction applied to every delay, e.g. `0.2` for ±20%.
    pub(crate) fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub(crate) fn with_cancellation(mut self, token: &'a CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

pub(crate) enum RetryDisposition {
    Retry,
    Abort,
}

pub(crate) async fn retry_with_backoff<'a, T, F, Fut, L, C>(
    config: RetryBackoff<'a>,
    mut operation: F,
    mut on_retry: L,
    mut classify_error: C,
) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
    L: FnMut(usize, Duration, &anyhow::Error, bool),
    C: FnMut(usize, &anyhow::Error) -> RetryDisposition,
{
    let mut attempt = 0;
    let mut backoff = config.initial_delay;

    loop {
        attempt += 1;

        if let Some(token) = config.cancellation {
            if token.is_cancelled() {
                return Err(anyhow!("retry cancelled"));
            }
        }

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => match classify_error(attempt, &err) {
                RetryDisposition::Abort => return Err(err),
                RetryDisposition::Retry => {
                    let exhausted = config
                        .max_attempts
                        .map(|max| attempt >= max)
                        .unwrap_or(false);

                    let delay = apply_jitter(backoff, config.jitter);
                    on_retry(attempt, delay, &err, !exhausted);

                    if exhausted {
                        return Err(err);
                    }

                    sleep_with_cancellation(delay, config.cancellation).await?;
                    backoff = next_backoff(backoff, config.max_delay);
                }
            },
        }
    }
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }

    let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
    delay.mul_f64(factor)
}

async fn sleep_with_cancellation(
    delay: Duration,
    cancellation: Option<&CancellationToken>,
) -> Result<()> {
    if delay.is_zero() {
        yield_now().await;
        return Ok(());
    }

    if let Some(token) = cancellation {
        tokio::select! {
            _ = token.cancelled() => Err(anyhow!("retry cancelled")),
            _ = sleep(delay) => Ok(()),
        }
    } else {
        sleep(delay).await;
        Ok(())
    }
}

fn next_backoff(current: Duration, max_backoff: Duration) -> Duration {
    if current.is_zero() {
        return max_backoff.min(Duration::from_millis(1));
    }

    let mut next = current.saturating_mul(2);
    if next > max_backoff {
        next = max_backoff;
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[tokio::test]
    async fn succeeds_without_retry() {
        let attempts = AtomicUsize::new(0);
        let result = retry_with_backoff(
            RetryBackoff::new(Duration::ZERO, Duration::ZERO).with_max_attempts(3),
            |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Ok(42) }
            },
            |_, _, _, _| {},
            |_, _| RetryDisposition::Retry,
        )
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_attempts_exhaust() {
        let attempts = AtomicUsize::new(0);
        let err = retry_with_backoff(
            RetryBackoff::new(Duration::ZERO, Duration::ZERO).with_max_attempts(3),
            |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(anyhow!("transient")) }
            },
            |_, _, _, _| {},
            |_, _| RetryDisposition::Retry,
        )
        .await
        .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(format!("{err}").contains("transient"));
    }

    #[tokio::test]
    async fn abort_disposition_stops_immediately() {
        let attempts = AtomicUsize::new(0);
        retry_with_backoff(
            RetryBackoff::new(Duration::ZERO, Duration::ZERO).with_max_attempts(5),
            |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(anyhow!("fatal")) }
            },
            |_, _, _, _| {},
            |_, _| RetryDisposition::Abort,
        )
        .await
        .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_retry_loop() {
        let token = CancellationToken::new();
        token.cancel();

        let err = retry_with_backoff(
            RetryBackoff::new(Duration::from_secs(60), Duration::from_secs(60))
                .with_cancellation(&token),
            |_| async { Ok(()) },
            |_, _, _, _| {},
            |_, _| RetryDisposition::Retry,
        )
        .await
        .unwrap_err();

        assert!(format!("{err}").contains("cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn delays_grow_exponentially_within_jitter_bounds() {
        let delays: Mutex<Vec<Duration>> = Mutex::new(Vec::new());
        let _ = retry_with_backoff(
            RetryBackoff::new(Duration::from_millis(200), Duration::from_secs(5))
                .with_max_attempts(3)
                .with_jitter(0.2),
            |_| async { Err::<(), _>(anyhow!("transient")) },
            |_, delay, _, will_retry| {
                if will_retry {
                    delays.lock().unwrap().push(delay);
                }
            },
            |_, _| RetryDisposition::Retry,
        )
        .await;

        let delays = delays.lock().unwrap();
        assert_eq!(delays.len(), 2);
        // 200 ms then 400 ms, each within ±20%.
        assert!(delays[0] >= Duration::from_millis(160) && delays[0] <= Duration::from_millis(240));
        assert!(delays[1] >= Duration::from_millis(320) && delays[1] <= Duration::from_millis(480));
    }
}
