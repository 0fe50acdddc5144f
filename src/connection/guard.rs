use super::ResilientConnection;
use std::future::Future;

/// The structured report emitted every time the guard fails to (re)connect.
#[derive(Debug)]
pub struct ReconnectFailure<'a> {
    /// How many attempts have failed so far for the guarded call. Starts at `1`.
    pub retry_count: u64,
    /// Why the last attempt failed.
    pub error: &'a anyhow::Error,
}

/// Observes the reconnection attempts made by the guard.
///
/// Use it to plug reconnection failures into your own logging or alerting.
pub trait RetryObserver: Send + Sync + 'static {
    fn on_reconnect_failure(&self, failure: &ReconnectFailure<'_>);
}

/// The default [`RetryObserver`]: reports every failure as a `tracing` error event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRetryObserver;

impl RetryObserver for TracingRetryObserver {
    fn on_reconnect_failure(&self, failure: &ReconnectFailure<'_>) {
        tracing::error!(
            event = "reconnect-failure",
            retry_count = failure.retry_count,
            error = ?failure.error,
            "Failed to connect to the broker"
        );
    }
}

impl ResilientConnection {
    /// Run `op` once a connection to the broker is available.
    ///
    /// While the client is running and not connected, it keeps trying to connect, sleeping
    /// `retry_interval` and notifying the [`RetryObserver`] after each failed attempt.
    /// There is no upper bound on the number of attempts: wrap the call in
    /// `tokio::time::timeout` if you need a deadline.
    ///
    /// If the client is stopped while disconnected the retry loop is abandoned and `op`
    /// still runs. Operations look up the current channel themselves and fail with
    /// [`QueueError::NotConnected`](crate::QueueError::NotConnected) if there is none.
    pub async fn guarded<F, Fut>(&self, op: F) -> Fut::Output
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        self.ensure_connected().await;
        op().await
    }

    async fn ensure_connected(&self) {
        let mut retries = 0;
        while self.is_running() && !self.is_connected() {
            let attempt = {
                let _connecting = self.connect_lock.lock().await;
                // Somebody else might have connected while we were waiting for the lock.
                if self.is_connected() {
                    break;
                }
                self.connect().await
            };
            match attempt {
                Ok(_) => break,
                Err(e) => {
                    tokio::time::sleep(self.retry_interval).await;
                    retries += 1;
                    self.observer.on_reconnect_failure(&ReconnectFailure {
                        retry_count: retries,
                        error: &e,
                    });
                }
            }
        }
        if !self.is_running() && !self.is_connected() {
            tracing::warn!("Queue client stopped before a connection could be established");
        }
    }
}
