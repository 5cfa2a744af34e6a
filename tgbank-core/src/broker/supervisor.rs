//! Restart policy for long-running consumer loops.

use super::BrokerError;
use crate::utils::backoff::{exponential_delay, with_jitter};
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Restarts allowed inside `restart_window` before every further
    /// restart waits the full `max_backoff`.
    pub max_restarts: u32,
    pub restart_window: Duration,
    /// Fraction of the delay added as random jitter.
    pub jitter: f64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_restarts: 5,
            restart_window: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

pub struct ConsumerSupervisor {
    name: String,
    config: SupervisorConfig,
}

impl ConsumerSupervisor {
    pub fn new(name: impl Into<String>, config: SupervisorConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    /// Delay before restart number `restart` (0-based), without jitter.
    pub fn backoff(&self, restart: u32) -> Duration {
        exponential_delay(
            restart,
            self.config.initial_backoff,
            self.config.max_backoff,
        )
    }

    /// Run `task` until it returns `Ok` or shutdown is requested.
    ///
    /// A failing task is always restarted. Once the restart budget for the
    /// window is spent, restarts are throttled to one per `max_backoff`.
    pub async fn run<F, Fut>(&self, mut shutdown_rx: watch::Receiver<bool>, mut task: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), BrokerError>>,
    {
        let mut restarts: VecDeque<Instant> = VecDeque::new();
        let mut streak: u32 = 0;
        let mut throttled = false;

        loop {
            let started = Instant::now();
            let err = match task().await {
                Ok(()) => return,
                Err(err) => err,
            };
            if *shutdown_rx.borrow() {
                return;
            }

            let now = Instant::now();
            while restarts
                .front()
                .is_some_and(|at| now.duration_since(*at) > self.config.restart_window)
            {
                restarts.pop_front();
            }
            let over_budget = restarts.len() >= self.config.max_restarts as usize;
            if over_budget && !throttled {
                error!(
                    consumer = %self.name,
                    restarts = restarts.len(),
                    window_secs = self.config.restart_window.as_secs(),
                    retry_secs = self.config.max_backoff.as_secs(),
                    error = %err,
                    "Consumer keeps failing, throttling restarts"
                );
            }
            throttled = over_budget;
            restarts.push_back(now);

            // a consumer that stayed up for a whole window starts over
            if now.duration_since(started) >= self.config.restart_window {
                streak = 0;
            }
            let base = if throttled {
                self.config.max_backoff
            } else {
                self.backoff(streak)
            };
            let delay = with_jitter(base, self.config.jitter);
            streak = streak.saturating_add(1);
            warn!(
                consumer = %self.name,
                restart = restarts.len(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Consumer failed, restarting after backoff"
            );

            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!(consumer = %self.name, "Shutdown requested during consumer backoff");
                        return;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(max_restarts: u32) -> SupervisorConfig {
        SupervisorConfig {
            max_restarts,
            jitter: 0.0,
            ..SupervisorConfig::default()
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let supervisor = ConsumerSupervisor::new("q", SupervisorConfig::default());
        assert_eq!(supervisor.backoff(0), Duration::from_secs(1));
        assert_eq!(supervisor.backoff(1), Duration::from_secs(2));
        assert_eq!(supervisor.backoff(3), Duration::from_secs(8));
        assert_eq!(supervisor.backoff(6), Duration::from_secs(60));
        assert_eq!(supervisor.backoff(20), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeps_restarting_through_long_outage() {
        let supervisor = ConsumerSupervisor::new("q", config(5));
        let (_tx, rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));
        let outage = Duration::from_secs(300);

        let start = Instant::now();
        supervisor
            .run(rx, || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if start.elapsed() < outage {
                        Err(BrokerError::Connection("connection refused".to_string()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        // failures at 0, 1, 3, 7, 15 and 31s, then one restart per minute
        // at 91, 151, 211 and 271s, recovering at 331s
        assert_eq!(calls.load(Ordering::SeqCst), 11);
        assert!(start.elapsed() >= Duration::from_secs(331));
        assert!(start.elapsed() < Duration::from_secs(332));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_restarts_wait_max_backoff() {
        let supervisor = ConsumerSupervisor::new(
            "q",
            SupervisorConfig {
                max_backoff: Duration::from_secs(10),
                ..config(2)
            },
        );
        let (_tx, rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));

        let start = Instant::now();
        supervisor
            .run(rx, || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 5 {
                        Err(BrokerError::Closed)
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        // waited 1s and 2s, then 10s for each restart past the budget
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert!(start.elapsed() >= Duration::from_secs(33));
        assert!(start.elapsed() < Duration::from_secs(34));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let supervisor = ConsumerSupervisor::new("q", config(5));
        let (_tx, rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));

        supervisor
            .run(rx, || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(BrokerError::Connection("refused".to_string()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_backoff() {
        let supervisor = ConsumerSupervisor::new("q", config(5));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            supervisor
                .run(rx, || async { Err(BrokerError::Closed) })
                .await
        });
        tokio::time::sleep(Duration::from_millis(500)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
