//! Graceful shutdown coordination via `CancellationToken`.
//!
//! Connection sessions are spawned by the HTTP layer, so they are tracked
//! with a [`TaskTracker`] instead of join handles. A second token forces the
//! remaining sessions to be dropped once the grace period runs out.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// How long to wait for force-cancelled tasks to unwind.
const FORCE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How a shutdown finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every tracked task finished within the grace period.
    Graceful,
    /// Some tasks were still running and had to be dropped.
    Forced {
        /// Tasks still running when the grace period expired.
        remaining: usize,
    },
}

/// Coordinates shutdown across the listener and all connection sessions.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    force: CancellationToken,
    tracker: TaskTracker,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            force: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Token cancelled by [`shutdown`](Self::shutdown) or when the returned
    /// token itself is cancelled.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of tracked tasks still running.
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Track `task` so shutdown can wait for it. The task is dropped if it is
    /// still running when the grace period expires.
    pub fn track<F>(&self, task: F) -> impl Future<Output = ()> + Send + 'static + use<F>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let force = self.force.clone();
        self.tracker.track_future(async move {
            tokio::select! {
                () = task => {}
                () = force.cancelled() => debug!("task dropped by forced shutdown"),
            }
        })
    }

    /// Cancel the token, then wait up to `grace` for tracked tasks.
    ///
    /// Tasks still running afterwards are force-cancelled.
    pub async fn graceful_shutdown(&self, grace: Duration) -> ShutdownOutcome {
        self.shutdown();
        let _ = self.tracker.close();
        info!(
            task_count = self.tracker.len(),
            grace_ms = grace.as_millis(),
            "waiting for tasks to complete"
        );

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            return ShutdownOutcome::Graceful;
        }

        let remaining = self.tracker.len();
        warn!(remaining, "shutdown grace period expired, dropping remaining tasks");
        self.force.cancel();
        if tokio::time::timeout(FORCE_DRAIN_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(remaining = self.tracker.len(), "tasks still unwinding after forced shutdown");
        }
        ShutdownOutcome::Forced { remaining }
    }

    /// Drop every tracked task immediately.
    pub fn force_shutdown(&self) {
        self.token.cancel();
        self.force.cancel();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
