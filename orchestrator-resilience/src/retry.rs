//! ABOUTME: Retry with exponential/linear backoff, jitter and named presets (spec §4.1)

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// `retry`'s failure outcome. `should_retry` returning `false` is not the
/// same failure shape as exhausting `max_attempts`: the former must hand
/// the caller back the original, unwrapped error (spec §4.1 "`should_retry`
/// returning false propagates the original error immediately (not wrapped
/// in `RetryError`)"), while the latter carries the attempt/duration
/// bookkeeping a caller needs to build a stage/agent failure from.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("{0}")]
    Declined(E),
    #[error("operation failed after {attempts} attempt(s) in {total_duration_ms}ms: {last_error}")]
    Exhausted {
        attempts: u32,
        total_duration_ms: u64,
        last_error: E,
    },
}

impl<E> RetryError<E> {
    /// Unwraps either variant down to the underlying error, for callers
    /// that don't care whether it was declined or exhausted.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Declined(error) => error,
            RetryError::Exhausted { last_error, .. } => last_error,
        }
    }
}

/// Options controlling one `retry` invocation. Defaults match spec §4.1.
pub struct RetryOptions<E> {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub enable_jitter: bool,
    pub jitter_factor: f64,
    pub timeout_ms: Option<u64>,
    pub should_retry: Box<dyn Fn(&E, u32) -> bool + Send + Sync>,
    pub on_retry: Box<dyn Fn(&E, u32, u64) + Send + Sync>,
    pub on_max_retries_reached: Box<dyn Fn(&E, u32) + Send + Sync>,
    /// Builds the error value reported when an attempt exceeds
    /// `timeout_ms`; only consulted when `timeout_ms` is set. Defaults to
    /// a panic because a caller that sets `timeout_ms` must supply a
    /// matching error constructor for its own `E`.
    pub timeout_error: Box<dyn Fn() -> E + Send + Sync>,
}

impl<E> Default for RetryOptions<E> {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            enable_jitter: true,
            jitter_factor: 0.1,
            timeout_ms: None,
            should_retry: Box::new(|_, _| true),
            on_retry: Box::new(|_, _, _| {}),
            on_max_retries_reached: Box::new(|_, _| {}),
            timeout_error: Box::new(|| panic!("timeout_ms set without a timeout_error constructor")),
        }
    }
}

impl<E> RetryOptions<E> {
    /// `{3, 1000, 5000, 2}`
    pub fn quick() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            ..Self::default()
        }
    }

    /// `{3, 2000, 30000, 2}`
    pub fn standard() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 2000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            ..Self::default()
        }
    }

    /// `{5, 1000, 60000, 2.5}`
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.5,
            ..Self::default()
        }
    }

    /// `{3, 5000, 120000, 3}`
    pub fn patient() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 5000,
            max_delay_ms: 120_000,
            backoff_multiplier: 3.0,
            ..Self::default()
        }
    }

    /// `{5, 1000, 30000, 2, jitter=0.2}`
    pub fn network() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
            ..Self::default()
        }
    }
}

/// Computes the delay before attempt `n` (1-indexed, `n` in
/// `[1, max_attempts - 1]`) per the formula in spec §4.1.
fn compute_delay(n: u32, opts_initial: u64, opts_max: u64, multiplier: f64, jitter: bool, jitter_factor: f64) -> u64 {
    let base = (opts_initial as f64) * multiplier.powi((n - 1) as i32);
    let mut delay = base.min(opts_max as f64);
    if jitter {
        let noise_span = jitter_factor * delay;
        let offset = rand::thread_rng().gen_range(-noise_span / 2.0..=noise_span / 2.0);
        delay += offset;
    }
    delay.max(0.0).floor() as u64
}

/// Runs `op` until it succeeds, `should_retry` says stop, or
/// `max_attempts` is exhausted. See spec §4.1 for the exact contract.
pub async fn retry<T, E, F, Fut>(mut op: F, opts: RetryOptions<E>) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let start = std::time::Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let attempt_result = match opts.timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), op()).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(attempt, ms, "operation exceeded per-attempt timeout");
                    Err((opts.timeout_error)())
                }
            },
            None => op().await,
        };

        match attempt_result {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !(opts.should_retry)(&error, attempt) {
                    debug!(attempt, "should_retry declined — propagating original error");
                    return Err(RetryError::Declined(error));
                }

                if attempt >= opts.max_attempts {
                    (opts.on_max_retries_reached)(&error, attempt);
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        total_duration_ms: start.elapsed().as_millis() as u64,
                        last_error: error,
                    });
                }

                let delay = compute_delay(
                    attempt,
                    opts.initial_delay_ms,
                    opts.max_delay_ms,
                    opts.backoff_multiplier,
                    opts.enable_jitter,
                    opts.jitter_factor,
                );
                (opts.on_retry)(&error, attempt, delay);
                debug!(attempt, delay_ms = delay, "retrying after backoff");
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_without_retry_when_op_succeeds_first_try() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<u32, &str> = retry(
            move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                }
            },
            RetryOptions::standard(),
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_then_succeeds_and_invokes_on_retry_each_time() {
        let calls = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(AtomicU32::new(0));
        let retries2 = retries.clone();

        let calls2 = calls.clone();
        let mut opts = RetryOptions::<&str>::network();
        opts.initial_delay_ms = 1;
        opts.max_delay_ms = 2;
        opts.on_retry = Box::new(move |_, _, _| {
            retries2.fetch_add(1, Ordering::SeqCst);
        });

        let result = retry(
            move || {
                let calls = calls2.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err("transient")
                    } else {
                        Ok(7)
                    }
                }
            },
            opts,
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn should_retry_false_propagates_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let mut opts = RetryOptions::<&str>::standard();
        opts.should_retry = Box::new(|_, _| false);

        let result: Result<u32, _> = retry(
            move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("fatal")
                }
            },
            opts,
        )
        .await;

        assert!(matches!(result.unwrap_err(), RetryError::Declined("fatal")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_max_attempts_and_invokes_on_max_retries_reached() {
        let hit = Arc::new(AtomicU32::new(0));
        let hit2 = hit.clone();
        let mut opts = RetryOptions::<&str>::quick();
        opts.initial_delay_ms = 1;
        opts.max_delay_ms = 1;
        opts.on_max_retries_reached = Box::new(move |_, _| {
            hit2.fetch_add(1, Ordering::SeqCst);
        });

        let result: Result<u32, _> =
            retry(|| async { Err::<u32, &str>("always fails") }, opts).await;

        match result.unwrap_err() {
            RetryError::Exhausted { attempts, .. } => assert_eq!(attempts, 3),
            RetryError::Declined(_) => panic!("expected Exhausted, got Declined"),
        }
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_is_monotonic_under_exponential_backoff_without_jitter() {
        let d1 = compute_delay(1, 1000, 30_000, 2.0, false, 0.0);
        let d2 = compute_delay(2, 1000, 30_000, 2.0, false, 0.0);
        let d3 = compute_delay(3, 1000, 30_000, 2.0, false, 0.0);
        assert_eq!(d1, 1000);
        assert_eq!(d2, 2000);
        assert_eq!(d3, 4000);
    }

    #[test]
    fn delay_is_capped_at_max_delay_ms() {
        let d = compute_delay(10, 1000, 5000, 2.0, false, 0.0);
        assert_eq!(d, 5000);
    }
}
