//! Stop signal shared by the engine's background loops (state saver,
//! connectivity monitor, event logger).

use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Cloneable stop switch. Clones share one signal; [`child`](Self::child)
/// scopes a signal that stops with its parent but can also stop alone.
///
/// Loops take a [`ShutdownSignal`] from [`subscribe`](Self::subscribe) and
/// `select!` on it:
///
/// ```no_run
/// use upload_engine::shutdown::ShutdownCoordinator;
///
/// # async fn example() {
/// let coordinator = ShutdownCoordinator::new();
/// let mut stop = coordinator.subscribe();
/// let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
/// loop {
///     tokio::select! {
///         _ = ticker.tick() => { /* poll */ }
///         _ = stop.recv() => break,
///     }
/// }
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scoped signal for one installation of a component
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            wait: Box::pin(self.token.clone().cancelled_owned()),
            token: self.token.clone(),
        }
    }

    /// Idempotent
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Receiving end of a [`ShutdownCoordinator`].
///
/// Unlike a broadcast receiver it also fires when subscribed after the
/// shutdown, so a loop started late never outlives its owner.
pub struct ShutdownSignal {
    wait: std::pin::Pin<Box<WaitForCancellationFutureOwned>>,
    token: CancellationToken,
}

impl ShutdownSignal {
    /// Resolves once shutdown is requested; cancel safe
    pub async fn recv(&mut self) {
        self.wait.as_mut().await;
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl std::fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_signal_reaches_running_loop() {
        let coordinator = ShutdownCoordinator::new();
        let mut stop = coordinator.subscribe();

        let task = tokio::spawn(async move {
            stop.recv().await;
            "stopped"
        });
        coordinator.shutdown();

        let result = timeout(Duration::from_millis(100), task).await;
        assert_eq!(result.unwrap().unwrap(), "stopped");
    }

    #[tokio::test]
    async fn test_late_subscriber_fires_immediately() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.shutdown();
        coordinator.shutdown();

        let mut stop = coordinator.subscribe();
        assert!(stop.is_triggered());
        assert!(timeout(Duration::from_millis(10), stop.recv()).await.is_ok());
    }

    #[test]
    fn test_child_is_scoped() {
        let root = ShutdownCoordinator::new();
        let first = root.child();
        first.shutdown();
        assert!(!root.is_shutdown());

        let second = root.child();
        assert!(!second.is_shutdown());
        root.clone().shutdown();
        assert!(second.is_shutdown());
    }
}
