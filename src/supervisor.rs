//! Keeps the service running.
//!
//! Every attempt runs on its own task so a panic surfaces as a failed
//! attempt instead of taking the process down. Failed attempts are
//! restarted after an increasing delay unless the supervisor runs in
//! fail-fast mode, where the first failure ends the process. An attempt
//! that reports a [`Failure::Fatal`] always ends the process.

use anyhow::anyhow;
use std::future::Future;
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::scheduler::BackoffPolicy;

/// An attempt that stays up this long resets the restart delay.
const HEALTHY_RUN: Duration = Duration::from_secs(600);

#[derive(Debug)]
pub enum Exit {
    /// Stopped on request.
    Clean,
    Fatal(anyhow::Error),
}

impl Exit {
    pub fn code(&self) -> ExitCode {
        match self {
            Exit::Clean => ExitCode::SUCCESS,
            Exit::Fatal(_) => ExitCode::FAILURE,
        }
    }
}

/// Why a service attempt stopped.
#[derive(Debug)]
pub enum Failure {
    /// Another attempt may succeed.
    Transient(anyhow::Error),
    /// Restarting cannot help, e.g. delivery state can no longer be persisted.
    Fatal(anyhow::Error),
}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Self {
        Failure::Transient(err)
    }
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    fail_fast: bool,
    restart: BackoffPolicy,
}

impl Supervisor {
    pub fn new(fail_fast: bool) -> Self {
        Self {
            fail_fast,
            restart: BackoffPolicy {
                base: Duration::from_secs(5),
                cap: Duration::from_secs(300),
            },
        }
    }

    pub fn with_restart_delay(mut self, base: Duration) -> Self {
        self.restart = BackoffPolicy {
            base,
            cap: self.restart.cap.max(base),
        };
        self
    }

    /// Runs attempts produced by `attempt` until `shutdown` flips to true.
    ///
    /// `attempt` receives the attempt number (starting at 1) and its own
    /// copy of the shutdown signal.
    pub async fn run<F, Fut>(&self, mut attempt: F, mut shutdown: watch::Receiver<bool>) -> Exit
    where
        F: FnMut(u32, watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = Result<(), Failure>> + Send + 'static,
    {
        let mut number = 0u32;
        let mut consecutive = 0u32;

        loop {
            number += 1;
            info!(attempt = number, "Starting service");
            let started = Instant::now();

            let result = match tokio::spawn(attempt(number, shutdown.clone())).await {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(anyhow!("service panicked: {e}").into()),
                Err(e) => Err(anyhow!("service task cancelled: {e}").into()),
            };

            if *shutdown.borrow() {
                if let Err(e) = result {
                    warn!(error = ?e, "Service failed while shutting down");
                }
                info!("Shutdown complete");
                return Exit::Clean;
            }

            let (err, fatal) = match result {
                Ok(()) => (anyhow!("service stopped without a shutdown request"), false),
                Err(Failure::Transient(e)) => (e, false),
                Err(Failure::Fatal(e)) => (e, true),
            };
            error!(error = ?err, attempt = number, fatal, "Service failed");
            if self.fail_fast || fatal {
                return Exit::Fatal(err);
            }

            if started.elapsed() >= HEALTHY_RUN {
                consecutive = 0;
            }
            consecutive += 1;
            let delay = self.restart.delay(consecutive);
            info!(delay_secs = delay.as_secs(), "Restarting service");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    // a dropped sender counts as a shutdown request
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested during restart delay");
                        return Exit::Clean;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(fail_fast: bool) -> Supervisor {
        Supervisor::new(fail_fast).with_restart_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_fail_fast_returns_first_error() {
        let (_tx, rx) = watch::channel(false);
        let exit = fast(true)
            .run(|_, _| async { Err::<(), _>(Failure::Transient(anyhow!("feed down"))) }, rx)
            .await;
        match exit {
            Exit::Fatal(e) => assert!(e.to_string().contains("feed down")),
            Exit::Clean => panic!("expected a fatal exit"),
        }
    }

    #[tokio::test]
    async fn test_restarts_after_panic_then_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let tx = Arc::new(tx);
        let attempts = Arc::new(AtomicU32::new(0));

        let exit = fast(false)
            .run(
                |n, mut shutdown| {
                    let attempts = attempts.clone();
                    let tx = tx.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        if n < 3 {
                            panic!("boom");
                        }
                        let _ = tx.send(true);
                        let _ = shutdown.changed().await;
                        Ok::<(), Failure>(())
                    }
                },
                rx,
            )
            .await;

        assert!(matches!(exit, Exit::Clean));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_failures_are_never_restarted() {
        let (_tx, rx) = watch::channel(false);
        let attempts = Arc::new(AtomicU32::new(0));
        let exit = fast(false)
            .run(
                |_, _| {
                    let attempts = attempts.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(Failure::Fatal(anyhow!("disk full")))
                    }
                },
                rx,
            )
            .await;
        assert!(matches!(exit, Exit::Fatal(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unexpected_return_is_a_failure() {
        let (_tx, rx) = watch::channel(false);
        let exit = fast(true)
            .run(|_, _| async { Ok::<(), Failure>(()) }, rx)
            .await;
        assert!(matches!(exit, Exit::Fatal(_)));
    }

    #[tokio::test]
    async fn test_shutdown_during_restart_delay() {
        let (tx, rx) = watch::channel(false);
        let supervisor = Supervisor::new(false).with_restart_delay(Duration::from_secs(3600));

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });

        let exit = supervisor
            .run(|_, _| async { Err::<(), Failure>(anyhow!("transient").into()) }, rx)
            .await;
        assert!(matches!(exit, Exit::Clean));
        stopper.await.unwrap();
    }
}
