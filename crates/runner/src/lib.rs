//! Runs the long-lived pieces of the dashboard (change-feed consumer,
//! maintenance loop, simulators) side by side and tears them down together.
//!
//! Every process receives the same [`CancellationToken`]. The runner cancels
//! it when a process fails, when a process panics, or when the host sends
//! SIGINT/SIGTERM. Closers run once all processes have stopped, bounded by a
//! timeout.
//!
//! # Example
//!
//! ```no_run
//! use homedash_runner::Runner;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let outcome = Runner::new()
//!         .with_app_process(|ctx| async move {
//!             ctx.cancelled().await;
//!             Ok(())
//!         })
//!         .with_closer(|| async move {
//!             tracing::info!("flushing dashboard state");
//!             Ok(())
//!         })
//!         .with_closer_timeout(Duration::from_secs(5))
//!         .run()
//!         .await;
//!
//!     std::process::exit(outcome.exit_code());
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

type BoxedRun = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A long-lived process. Receives the shared shutdown token.
pub type AppProcess = Box<dyn FnOnce(CancellationToken) -> BoxedRun + Send>;

/// A cleanup step executed after every process has stopped.
pub type Closer = Box<dyn FnOnce() -> BoxedRun + Send>;

/// How a [`Runner::run`] call ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// All processes stopped cleanly, either on their own or after shutdown.
    Completed,
    /// A process returned an error (the first one is kept).
    Failed(anyhow::Error),
}

impl RunOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, RunOutcome::Failed(_))
    }

    /// Process exit code matching the outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::Failed(_) => 1,
        }
    }
}

pub struct Runner {
    app_processes: Vec<AppProcess>,
    closers: Vec<Closer>,
    closer_timeout: Duration,
    cancellation_token: CancellationToken,
    handle_signals: bool,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    /// Empty runner: 10 second closer timeout, OS signal handling on.
    pub fn new() -> Self {
        Self {
            app_processes: Vec::new(),
            closers: Vec::new(),
            closer_timeout: Duration::from_secs(10),
            cancellation_token: CancellationToken::new(),
            handle_signals: true,
        }
    }

    /// Adds a process. If any process errors, every other process is cancelled.
    pub fn with_app_process<F, Fut>(mut self, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.app_processes
            .push(Box::new(|token| Box::pin(process(token))));
        self
    }

    /// Adds an already boxed process, as produced by module `into_runner_process` helpers.
    pub fn with_boxed_process(mut self, process: AppProcess) -> Self {
        self.app_processes.push(process);
        self
    }

    /// Adds a closer. Closers run concurrently; a failing closer does not stop the others.
    pub fn with_closer<F, Fut>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.closers.push(Box::new(|| Box::pin(closer())));
        self
    }

    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    /// Shares an externally owned shutdown token with the processes.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Disables SIGINT/SIGTERM handling (tests, embedding).
    pub fn without_signal_handlers(mut self) -> Self {
        self.handle_signals = false;
        self
    }

    /// Runs every process until all finish or shutdown is requested, then runs the closers.
    pub async fn run(self) -> RunOutcome {
        let token = self.cancellation_token;
        let mut join_set = JoinSet::new();

        for process in self.app_processes {
            let process_token = token.clone();
            join_set.spawn(async move { process(process_token).await });
        }

        if self.handle_signals {
            spawn_signal_listeners(token.clone());
        }

        let mut first_error = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(())) => debug!("app process completed"),
                Ok(Err(err)) => {
                    if !token.is_cancelled() {
                        error!(error = %format!("{err:#}"), "app process failed, shutting down");
                        first_error = Some(err);
                        token.cancel();
                    } else {
                        debug!(error = %format!("{err:#}"), "app process failed during shutdown");
                    }
                }
                Err(join_err) => {
                    error!(error = %join_err, "app process panicked, shutting down");
                    token.cancel();
                }
            }

            if token.is_cancelled() {
                break;
            }
        }

        join_set.shutdown().await;

        if !self.closers.is_empty() {
            info!(timeout = ?self.closer_timeout, "running closers");
            match tokio::time::timeout(self.closer_timeout, run_closers(self.closers)).await {
                Ok(()) => info!("all closers completed"),
                Err(_) => error!(timeout = ?self.closer_timeout, "closers timed out"),
            }
        }

        match first_error {
            Some(err) => RunOutcome::Failed(err),
            None => RunOutcome::Completed,
        }
    }
}

fn spawn_signal_listeners(token: CancellationToken) {
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received interrupt, shutting down");
                ctrl_c_token.cancel();
            }
            Err(err) => error!(error = %err, "failed to listen for interrupt"),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("received SIGTERM, shutting down");
                token.cancel();
            }
            Err(err) => error!(error = %err, "failed to listen for SIGTERM"),
        }
    });
}

async fn run_closers(closers: Vec<Closer>) {
    let mut closer_set = JoinSet::new();
    for closer in closers {
        closer_set.spawn(async move { closer().await });
    }

    while let Some(joined) = closer_set.join_next().await {
        match joined {
            Ok(Ok(())) => debug!("closer completed"),
            Ok(Err(err)) => error!(error = %format!("{err:#}"), "closer failed"),
            Err(join_err) => error!(error = %join_err, "closer panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_cancellation_stops_processes_and_runs_closers() {
        let closer_called = Arc::new(AtomicBool::new(false));
        let flag = closer_called.clone();
        let token = CancellationToken::new();

        let runner = Runner::new()
            .without_signal_handlers()
            .with_cancellation_token(token.clone())
            .with_app_process(|ctx| async move {
                ctx.cancelled().await;
                Ok(())
            })
            .with_closer(move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            });

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let outcome = runner.run().await;
        assert!(!outcome.is_failed());
        assert_eq!(outcome.exit_code(), 0);
        assert!(closer_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failing_process_cancels_siblings() {
        let sibling_stopped = Arc::new(AtomicBool::new(false));
        let stopped = sibling_stopped.clone();

        let outcome = Runner::new()
            .without_signal_handlers()
            .with_app_process(move |ctx| async move {
                ctx.cancelled().await;
                stopped.store(true, Ordering::SeqCst);
                Ok(())
            })
            .with_app_process(|_ctx| async move { Err(anyhow::anyhow!("change feed lost")) })
            .run()
            .await;

        assert!(outcome.is_failed());
        assert_eq!(outcome.exit_code(), 1);
        match outcome {
            RunOutcome::Failed(err) => assert_eq!(err.to_string(), "change feed lost"),
            RunOutcome::Completed => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_all_closers_run_even_when_one_fails() {
        let counter = Arc::new(AtomicUsize::new(0));
        let first = counter.clone();
        let second = counter.clone();

        let outcome = Runner::new()
            .without_signal_handlers()
            .with_app_process(|_ctx| async move { Ok(()) })
            .with_closer(move || async move {
                first.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("flush failed"))
            })
            .with_closer(move || async move {
                second.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .run()
            .await;

        assert!(!outcome.is_failed());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_closers_are_bounded_by_timeout() {
        let outcome = Runner::new()
            .without_signal_handlers()
            .with_app_process(|_ctx| async move { Ok(()) })
            .with_closer(|| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .with_closer_timeout(Duration::from_secs(1))
            .run()
            .await;

        assert!(!outcome.is_failed());
    }
}
