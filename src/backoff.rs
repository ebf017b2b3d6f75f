//! Exponential backoff and the explicit retry policy wrapped around every network call.

use crate::config::Config;
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_ms: u64,
    max_ms: u64,
    jitter_percent: u64,
}

impl ExponentialBackoff {
    pub const fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            jitter_percent: 10,
        }
    }

    pub fn with_jitter(mut self, jitter_percent: u64) -> Self {
        self.jitter_percent = jitter_percent;
        self
    }

    /// Delay before retry number `attempt + 1`: `base * 2^attempt`, capped, plus up to
    /// `jitter_percent` of the capped value.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential_delay = self
            .base_ms
            .saturating_mul(2u64.saturating_pow(attempt.min(20)));
        let capped_delay = exponential_delay.min(self.max_ms);
        let jitter_bound = capped_delay.saturating_mul(self.jitter_percent) / 100;
        let jitter = if jitter_bound > 0 {
            rand::thread_rng().gen_range(0..=jitter_bound)
        } else {
            0
        };
        Duration::from_millis(capped_delay + jitter)
    }
}

/// Max attempts, base delay, jitter bound and a pre-attempt spread, applied around one operation.
///
/// The retryable predicate is supplied per call so each layer keeps its own error taxonomy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: ExponentialBackoff,
    /// Upper bound of the random sleep taken before every attempt, so replicas that start
    /// together do not hit the index service in lockstep.
    pub pre_attempt_jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Config::MAX_ATTEMPTS,
            backoff: ExponentialBackoff::new(Config::RETRY_BASE_MS, Config::RETRY_MAX_MS)
                .with_jitter(Config::RETRY_JITTER_PERCENT),
            pre_attempt_jitter_ms: Config::PRE_ATTEMPT_JITTER_MS,
        }
    }
}

impl RetryPolicy {
    /// Same attempt cap, no sleeping at all.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: ExponentialBackoff::new(0, 0).with_jitter(0),
            pre_attempt_jitter_ms: 0,
        }
    }

    /// Run `op` until it succeeds, returns a non-retryable error, or the attempt cap is hit.
    /// `op` receives the zero-based attempt number.
    pub async fn run<T, E, F, Fut, P>(&self, mut op: F, is_retryable: P) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            if self.pre_attempt_jitter_ms > 0 {
                let spread = rand::thread_rng().gen_range(0..=self.pre_attempt_jitter_ms);
                tokio::time::sleep(Duration::from_millis(spread)).await;
            }

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if is_retryable(&e) && attempt + 1 < max_attempts => {
                    let delay = self.backoff.delay(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_growth() {
        let backoff = ExponentialBackoff::new(100, 10000).with_jitter(0);
        assert_eq!(backoff.delay(0).as_millis(), 100);
        assert_eq!(backoff.delay(1).as_millis(), 200);
        assert_eq!(backoff.delay(2).as_millis(), 400);
    }

    #[test]
    fn test_max_cap() {
        let backoff = ExponentialBackoff::new(100, 1000).with_jitter(0);
        assert!(backoff.delay(10).as_millis() <= 1000);
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let backoff = ExponentialBackoff::new(1000, 1000).with_jitter(25);
        for _ in 0..100 {
            let ms = backoff.delay(3).as_millis();
            assert!((1000..=1250).contains(&ms), "delay {} out of range", ms);
        }
    }

    #[tokio::test]
    async fn test_always_transient_stops_at_cap() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(3);

        let result: Result<(), String> = policy
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("503".to_string()) }
                },
                |_| true,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(3);

        let result: Result<(), String> = policy
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("bad json".to_string()) }
                },
                |_| false,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let policy = RetryPolicy::immediate(3);

        let result: Result<u32, String> = policy
            .run(
                |attempt| async move {
                    if attempt < 2 {
                        Err("timeout".to_string())
                    } else {
                        Ok(attempt)
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result.unwrap(), 2);
    }
}
