//! Shutdown coordination.
//!
//! Shutdown runs in a fixed order:
//! 1. Fire the shared cancellation token
//! 2. Close the registry so nothing new is allocated
//! 3. Send terminate to every live worker
//! 4. Wait until every tracked task has returned

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::registry::Registry;

/// What a shutdown did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers live when shutdown began.
    pub workers: usize,

    /// Workers that accepted a terminate signal.
    pub terminated: usize,

    /// Time spent draining.
    pub elapsed: Duration,
}

/// Drives the pool to a stop.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    registry: Arc<Registry>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl ShutdownCoordinator {
    pub fn new(registry: Arc<Registry>, cancel: CancellationToken, tracker: TaskTracker) -> Self {
        Self {
            registry,
            cancel,
            tracker,
        }
    }

    /// Stop the pool and wait for every worker to exit.
    ///
    /// Returns only once every worker task has returned.
    pub async fn shutdown(&self) -> ShutdownReport {
        let started = Instant::now();

        self.cancel.cancel();
        self.registry.close().await;

        let workers = self.registry.workers().await;
        info!(workers = workers.len(), "Terminating workers");

        let mut terminated = 0;
        for worker in &workers {
            if worker.terminate().await {
                terminated += 1;
            }
        }

        self.tracker.close();
        self.tracker.wait().await;

        let report = ShutdownReport {
            workers: workers.len(),
            terminated,
            elapsed: started.elapsed(),
        };
        info!(
            workers = report.workers,
            terminated = report.terminated,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "All workers exited"
        );
        report
    }
}
