use super::{SessionError, SessionSource, UnitOfWork};
use crate::utils::backoff::linear_delay;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Acquisition attempts per request, at least 1.
    pub max_attempts: u32,
    /// Delay after attempt `n` is `n * base_delay`.
    pub base_delay: Duration,
    /// Consecutive connection-class failures that trigger recovery.
    pub failure_threshold: u32,
    pub acquire_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            failure_threshold: 3,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        linear_delay(attempt, self.base_delay)
    }
}

/// Work that runs inside one session.
#[async_trait]
pub trait SessionHandler<S: Send>: Send {
    type Output: Send;
    type Error: Send;

    async fn handle(self, session: &mut S) -> Result<Self::Output, Self::Error>;
}

#[derive(Debug, thiserror::Error)]
pub enum MiddlewareError<E> {
    /// No session could be acquired; the handler did not run.
    #[error("store unavailable after {attempts} attempts: {last}")]
    Unavailable { attempts: u32, last: SessionError },
    #[error("failed to acquire session: {0}")]
    Acquire(SessionError),
    #[error("failed to commit session: {0}")]
    Commit(SessionError),
    #[error("{0}")]
    Handler(E),
}

/// Runs handlers inside a session with acquisition retry.
///
/// The consecutive-failure counter is shared by every request that goes
/// through the same middleware.
pub struct SessionMiddleware<P: SessionSource> {
    source: Arc<P>,
    policy: RetryPolicy,
    consecutive_failures: AtomicU32,
}

impl<P: SessionSource> SessionMiddleware<P> {
    pub fn new(source: Arc<P>, policy: RetryPolicy) -> Self {
        Self {
            source,
            policy,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn source(&self) -> &Arc<P> {
        &self.source
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    async fn acquire<E>(&self) -> Result<P::Session, MiddlewareError<E>> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result =
                match tokio::time::timeout(self.policy.acquire_timeout, self.source.acquire()).await {
                    Ok(result) => result,
                    Err(_) => Err(SessionError::Timeout(self.policy.acquire_timeout)),
                };

            let err = match result {
                Ok(session) => {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    return Ok(session);
                }
                Err(err) if err.is_connection_class() => err,
                Err(err) => return Err(MiddlewareError::Acquire(err)),
            };

            let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                attempt,
                max_attempts,
                consecutive_failures = failures,
                error = %err,
                "Failed to acquire session"
            );
            if failures >= self.policy.failure_threshold {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                info!(failures, "Connection failure threshold reached, recovering session source");
                if let Err(recover_err) = self.source.recover().await {
                    warn!(error = %recover_err, "Session source recovery failed");
                }
            }

            if attempt >= max_attempts {
                error!(attempts = attempt, error = %err, "Giving up on session acquisition");
                return Err(MiddlewareError::Unavailable {
                    attempts: attempt,
                    last: err,
                });
            }
            tokio::time::sleep(self.policy.delay_after(attempt)).await;
            attempt += 1;
        }
    }

    /// Acquire a session, run `handler` in it, then commit on success or
    /// roll back on error. The session is always closed.
    pub async fn run<H>(&self, handler: H) -> Result<H::Output, MiddlewareError<H::Error>>
    where
        H: SessionHandler<P::Session>,
    {
        let mut session = self.acquire().await?;

        let outcome = match handler.handle(&mut session).await {
            Ok(output) => match session.commit().await {
                Ok(()) => Ok(output),
                Err(err) => {
                    error!(error = %err, "Failed to commit session");
                    Err(MiddlewareError::Commit(err))
                }
            },
            Err(err) => {
                if let Err(rollback_err) = session.rollback().await {
                    warn!(error = %rollback_err, "Failed to roll back session");
                }
                Err(MiddlewareError::Handler(err))
            }
        };

        if let Err(err) = session.close().await {
            debug!(error = %err, "Ignoring error while closing session");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::memory::{MemorySession, MemorySessionSource, MemoryStore};
    use std::sync::atomic::AtomicBool;
    use tokio::time::Instant;

    struct Touch(Arc<AtomicBool>);

    #[async_trait]
    impl SessionHandler<MemorySession> for Touch {
        type Output = &'static str;
        type Error = std::convert::Infallible;

        async fn handle(self, _session: &mut MemorySession) -> Result<&'static str, Self::Error> {
            self.0.store(true, Ordering::SeqCst);
            Ok("done")
        }
    }

    fn middleware(source: Arc<MemorySessionSource>) -> SessionMiddleware<MemorySessionSource> {
        SessionMiddleware::new(source, RetryPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_linear_backoff() {
        let source = Arc::new(MemorySessionSource::new(MemoryStore::default()));
        source.fail_next(2);
        let middleware = middleware(source.clone());
        let ran = Arc::new(AtomicBool::new(false));

        let start = Instant::now();
        let output = middleware.run(Touch(ran.clone())).await.unwrap();

        assert_eq!(output, "done");
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(source.acquisitions(), 3);
        // waited 1s after the first failure and 2s after the second
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_secs(4));
        assert_eq!(middleware.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_never_run_handler() {
        let source = Arc::new(MemorySessionSource::new(MemoryStore::default()));
        source.fail_next(3);
        let middleware = middleware(source.clone());
        let ran = Arc::new(AtomicBool::new(false));

        let err = middleware.run(Touch(ran.clone())).await.unwrap_err();

        assert!(matches!(err, MiddlewareError::Unavailable { attempts: 3, .. }));
        assert!(!ran.load(Ordering::SeqCst));
        // the third consecutive failure triggers recovery
        assert_eq!(source.recoveries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_counter_spans_requests() {
        let source = Arc::new(MemorySessionSource::new(MemoryStore::default()));
        let policy = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        };
        let middleware = SessionMiddleware::new(source.clone(), policy);
        let ran = Arc::new(AtomicBool::new(false));

        source.fail_next(2);
        for _ in 0..2 {
            assert!(middleware.run(Touch(ran.clone())).await.is_err());
        }
        assert_eq!(middleware.consecutive_failures(), 2);
        assert_eq!(source.recoveries(), 0);

        // a success in between resets the streak
        middleware.run(Touch(ran.clone())).await.unwrap();
        assert_eq!(middleware.consecutive_failures(), 0);

        source.fail_next(3);
        for _ in 0..3 {
            assert!(middleware.run(Touch(ran.clone())).await.is_err());
        }
        assert_eq!(source.recoveries(), 1);
    }
}
