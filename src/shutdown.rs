//! Graceful termination for the daemon.
//!
//! Tasks watch the shared token; on ctrl-c (or when something else cancels
//! the token) they get a bounded grace period to finish.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DEFAULT_GRACE: Duration = Duration::from_secs(10);

pub struct ShutdownManager {
    cancel_token: CancellationToken,
    task_handles: Vec<JoinHandle<()>>,
    grace: Duration,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::with_grace(DEFAULT_GRACE)
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task_handles: Vec::new(),
            grace,
        }
    }

    /// Clone of the token handed to spawned tasks
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn register_task(&mut self, handle: JoinHandle<()>) {
        self.task_handles.push(handle);
    }

    /// Resolve on ctrl-c, or as soon as any holder cancels the token.
    pub async fn wait_for_signal(&self) {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::info!("🛑 Shutdown signal received"),
                Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
            },
            _ = self.cancel_token.cancelled() => {
                tracing::info!("🛑 Shutdown requested");
            }
        }
    }

    /// Cancel the token and join every registered task within the grace period.
    ///
    /// Returns false if some task did not finish in time.
    pub async fn shutdown(mut self) -> bool {
        self.cancel_token.cancel();

        let handles: Vec<JoinHandle<()>> = self.task_handles.drain(..).collect();
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        match tokio::time::timeout(self.grace, join_all).await {
            Ok(()) => {
                tracing::info!("✓ All tasks shut down gracefully");
                true
            }
            Err(_) => {
                tracing::warn!("⏱️  Shutdown timeout: Some tasks did not complete");
                false
            }
        }
    }

    pub async fn wait_for_shutdown(self) -> bool {
        self.wait_for_signal().await;
        self.shutdown().await
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tasks_observe_cancellation() {
        let mut manager = ShutdownManager::with_grace(Duration::from_secs(1));
        let token = manager.token();
        manager.register_task(tokio::spawn(async move {
            token.cancelled().await;
        }));

        assert!(manager.shutdown().await);
    }

    #[tokio::test]
    async fn test_stuck_task_hits_grace_timeout() {
        let mut manager = ShutdownManager::with_grace(Duration::from_millis(50));
        manager.register_task(tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }));

        assert!(!manager.shutdown().await);
    }

    #[tokio::test]
    async fn test_cancelled_token_ends_wait() {
        let manager = ShutdownManager::new();
        manager.token().cancel();
        manager.wait_for_signal().await;
    }
}
