// src/rabbitmq/retry.rs
// Exponential backoff for broker connect attempts.
//
// The delay schedule `backoff_delay` and the error classification
// `RabbitMQError::is_retryable` are plain functions so they can be checked
// without a broker. `RetryPolicy::run` combines them around an async
// operation and waits between attempts on a cancellable timer.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::errors::{RabbitMQError, Result};

/// Retries after the first failed connect for the listener role.
pub const CONSUMER_MAX_RETRIES: u32 = 5;
/// Retries after the first failed connect for the publisher role.
pub const PUBLISHER_MAX_RETRIES: u32 = 3;

/// Delay before retry number `attempt` (1-based): `2^attempt` seconds.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt))
}

/// Emitted once per scheduled retry.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub max_retries: u32,
    pub delay: Duration,
    pub error: String,
}

pub type RetryObserver = Arc<dyn Fn(&RetryAttempt) + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    observer: Option<RetryObserver>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            observer: None,
        }
    }

    pub fn consumer() -> Self {
        Self::new(CONSUMER_MAX_RETRIES)
    }

    pub fn publisher() -> Self {
        Self::new(PUBLISHER_MAX_RETRIES)
    }

    /// Called for every retry in addition to the warning log.
    pub fn with_observer(mut self, observer: RetryObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or `max_retries` retries have been spent.
    ///
    /// Exhaustion returns [`RabbitMQError::RetriesExhausted`]; a cancelled
    /// `stop` signal returns [`RabbitMQError::Cancelled`] before the next
    /// attempt or while waiting out a backoff.
    pub async fn run<T, F, Fut>(&self, stop: &CancellationToken, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0u32;

        loop {
            if stop.is_cancelled() {
                return Err(RabbitMQError::Cancelled);
            }

            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_retryable() {
                return Err(error);
            }

            if retries >= self.max_retries {
                return Err(RabbitMQError::RetriesExhausted {
                    attempts: retries + 1,
                    last: Box::new(error),
                });
            }

            retries += 1;
            let delay = backoff_delay(retries);
            warn!(
                error = %error,
                delay = ?delay,
                attempt = retries,
                max_retries = self.max_retries,
                "RabbitMQ connection failed. Retrying connection in {:?}. Attempt {}/{}",
                delay,
                retries,
                self.max_retries
            );

            if let Some(observer) = &self.observer {
                observer(&RetryAttempt {
                    attempt: retries,
                    max_retries: self.max_retries,
                    delay,
                    error: error.to_string(),
                });
            }

            tokio::select! {
                _ = stop.cancelled() => return Err(RabbitMQError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn unreachable() -> RabbitMQError {
        RabbitMQError::Unreachable("connection refused".to_string())
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(5), Duration::from_secs(32));
    }

    #[test]
    fn role_limits() {
        assert_eq!(RetryPolicy::consumer().max_retries(), 5);
        assert_eq!(RetryPolicy::publisher().max_retries(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result = RetryPolicy::publisher()
            .run(&CancellationToken::new(), || {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if call < 3 {
                        Err(unreachable())
                    } else {
                        Ok(call)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 2s + 4s of backoff before the third call.
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_role_limit() {
        let calls = AtomicU32::new(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let policy = RetryPolicy::publisher().with_observer(Arc::new(move |retry| {
            recorder.lock().unwrap().push((retry.attempt, retry.delay));
        }));

        let result: Result<()> = policy
            .run(&CancellationToken::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(unreachable()) }
            })
            .await;

        match result {
            Err(RabbitMQError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert!(last.is_retryable());
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (1, Duration::from_secs(2)),
                (2, Duration::from_secs(4)),
                (3, Duration::from_secs(8)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<()> = RetryPolicy::consumer()
            .run(&CancellationToken::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RabbitMQError::ProtocolError("ACCESS_REFUSED".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(RabbitMQError::ProtocolError(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let stop = CancellationToken::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result: Result<()> = RetryPolicy::consumer()
            .run(&stop, || async { Err(unreachable()) })
            .await;

        assert!(matches!(result, Err(RabbitMQError::Cancelled)));
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn cancelled_signal_skips_the_attempt() {
        let stop = CancellationToken::new();
        stop.cancel();
        let calls = AtomicU32::new(0);

        let result: Result<()> = RetryPolicy::consumer()
            .run(&stop, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(RabbitMQError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
