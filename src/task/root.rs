use super::{Cause, Task, TaskPool, SHUTDOWN};
use crate::error::ShutdownError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// The single top-level task of the process.
///
/// Owns the task pool and performs OS-signal driven graceful shutdown.
pub struct Root {
    task: Task,
    pool: Arc<TaskPool>,
}

impl Root {
    pub fn new() -> Self {
        Self::with_pool(Arc::new(TaskPool::default()))
    }

    pub fn with_pool(pool: Arc<TaskPool>) -> Self {
        Self {
            task: Task::new_root(Arc::clone(&pool)),
            pool,
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn pool(&self) -> &Arc<TaskPool> {
        &self.pool
    }

    pub fn subtask(&self, name: impl Into<String>, independent: bool) -> Task {
        self.task.subtask(name, independent)
    }

    /// Register cleanup that runs once the whole tree has drained.
    pub fn on_program_exit<F>(&self, about: impl Into<String>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.task.on_finished(about, f);
    }

    /// Cancel the tree with the `shutdown` reason and wait up to `deadline`
    /// for it to drain.
    ///
    /// Returns [`ShutdownError::DeadlineExceeded`] with the names of the
    /// pending tasks and callbacks when the tree does not drain in time. The
    /// drain keeps running in the background; this never waits past
    /// `deadline`.
    pub async fn graceful_shutdown(&self, deadline: Duration) -> Result<(), ShutdownError> {
        info!(deadline_ms = deadline.as_millis() as u64, "graceful shutdown started");

        let task = self.task.clone();
        let drain =
            tokio::spawn(async move { task.finish_within(Cause::from(SHUTDOWN), deadline).await });

        // Someone else may have started the drain already; wait for it too.
        let outcome = tokio::time::timeout(deadline, async {
            let clean = match drain.await {
                Ok(clean) => clean,
                Err(e) => {
                    error!(error = %e, "shutdown drain panicked");
                    false
                }
            };
            self.task.wait_finished().await;
            clean
        })
        .await;
        let clean = matches!(outcome, Ok(true));

        if clean {
            info!("graceful shutdown complete");
            Ok(())
        } else {
            let pending = self.task.pending();
            error!(
                deadline_ms = deadline.as_millis() as u64,
                pending = ?pending,
                "graceful shutdown timed out"
            );
            Err(ShutdownError::DeadlineExceeded { deadline, pending })
        }
    }

    /// Wait for SIGINT or SIGTERM, then shut down gracefully within
    /// `deadline`.
    pub async fn wait_exit(&self, deadline: Duration) -> Result<(), ShutdownError> {
        tokio::select! {
            result = shutdown_signal() => {
                if let Err(e) = result {
                    error!(error = %e, "failed to listen for shutdown signals");
                }
            }
            _ = self.task.cancelled() => {
                info!("root task cancelled");
            }
        }
        self.graceful_shutdown(deadline).await
    }
}

impl Default for Root {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves when the process receives a termination signal.
#[cfg(unix)]
pub async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received SIGINT (Ctrl+C), shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_on_program_exit_runs_on_shutdown() {
        let root = Root::new();
        let exited = Arc::new(AtomicBool::new(false));
        let e = Arc::clone(&exited);
        root.on_program_exit("flag", move || e.store(true, Ordering::SeqCst));

        root.graceful_shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(exited.load(Ordering::SeqCst));
        assert!(root.task().is_finished());
        assert_eq!(root.task().finish_cause(), Some(Cause::from(SHUTDOWN)));
    }

    #[tokio::test]
    async fn test_wait_exit_after_root_cancelled() {
        let root = Root::new();
        let task = root.task().clone();
        tokio::spawn(async move { task.finish("test exit").await });

        root.wait_exit(Duration::from_secs(1)).await.unwrap();
        assert_eq!(root.task().finish_cause(), Some(Cause::from("test exit")));
    }
}
