//! Reconciliation loop.
//!
//! The reconciler keeps each runner group at its desired size:
//! - On every pass it launches the deficit of each group, in config order
//! - Each launched worker gets a supervisor task that removes it from the
//!   registry when it exits and then wakes the loop
//! - Between passes the loop sleeps until a wake, a backoff expiry or
//!   cancellation; it never polls
//!
//! Surplus workers are never reclaimed. Groups whose workers keep failing
//! to provision are skipped until their backoff expires.

use std::sync::Arc;
use std::time::Instant;

use rpool_reconcile::{BackoffPolicy, GroupBackoff, GroupObservation};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::config::GroupSpec;
use crate::id::WorkerId;
use crate::registry::{Registry, RegistryError};
use crate::worker::{ExitInfo, Worker, WorkerError, WorkerServices};

/// Reconciliation loop configuration.
#[derive(Debug, Clone, Default)]
pub struct ReconcilerConfig {
    /// Backoff for groups that fail to provision.
    pub backoff: BackoffPolicy,
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassStats {
    pub groups_checked: usize,
    pub launched: usize,
    pub backing_off: usize,
    pub over_target: usize,
}

/// Sent by a supervisor after its worker has been removed.
#[derive(Debug)]
struct Wake {
    group: String,
    provisioning_failed: bool,
}

/// Reconciler for runner groups.
pub struct Reconciler {
    groups: Vec<Arc<GroupSpec>>,
    registry: Arc<Registry>,
    services: Arc<WorkerServices>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    backoff: GroupBackoff,
    wake_tx: mpsc::Sender<Wake>,
    wake_rx: mpsc::Receiver<Wake>,
}

impl Reconciler {
    /// Create a reconciler.
    ///
    /// Workers and their supervisors are spawned on `tracker`, so waiting
    /// on it waits for every worker to finish.
    pub fn new(
        groups: Vec<GroupSpec>,
        registry: Arc<Registry>,
        services: Arc<WorkerServices>,
        cancel: CancellationToken,
        tracker: TaskTracker,
        config: ReconcilerConfig,
    ) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        Self {
            groups: groups.into_iter().map(Arc::new).collect(),
            registry,
            services,
            cancel,
            tracker,
            backoff: GroupBackoff::new(config.backoff),
            wake_tx,
            wake_rx,
        }
    }

    /// Run until cancelled.
    pub async fn run(mut self) {
        info!(groups = self.groups.len(), "Starting reconciliation loop");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let stats = self.reconcile_pass().await;
            if stats.launched > 0 || stats.backing_off > 0 {
                info!(
                    launched = stats.launched,
                    backing_off = stats.backing_off,
                    over_target = stats.over_target,
                    "Reconciliation pass complete"
                );
            }

            let retry_at = self.backoff.next_ready_at(Instant::now());
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(wake) = self.wake_rx.recv() => self.observe(wake),
                _ = sleep_until(retry_at) => {
                    debug!("Backoff expired");
                }
            }
        }

        info!("Reconciliation loop stopped");
    }

    /// Launch the deficit of every group that is not backing off.
    #[instrument(skip(self))]
    pub async fn reconcile_pass(&mut self) -> PassStats {
        let mut stats = PassStats::default();
        let now = Instant::now();

        for group in &self.groups {
            if self.cancel.is_cancelled() {
                break;
            }
            stats.groups_checked += 1;

            if let Some(until) = self.backoff.blocked_until(&group.name, now) {
                debug!(
                    group = %group.name,
                    retry_in_ms = until.saturating_duration_since(now).as_millis() as u64,
                    "Group backing off"
                );
                stats.backing_off += 1;
                continue;
            }

            let observation = GroupObservation {
                desired: group.count,
                live: self.registry.count_by_group(&group.name).await,
            };
            if observation.is_over_target() {
                debug!(
                    group = %group.name,
                    desired = observation.desired,
                    live = observation.live,
                    "Group above target, leaving surplus workers"
                );
                stats.over_target += 1;
            }

            let deficit = observation.deficit();
            if deficit == 0 {
                continue;
            }

            info!(
                group = %group.name,
                desired = observation.desired,
                live = observation.live,
                deficit,
                "Launching workers"
            );

            for _ in 0..deficit {
                match self.registry.allocate(Arc::clone(group)).await {
                    Ok((worker, outcome_rx)) => {
                        self.launch(worker, outcome_rx);
                        stats.launched += 1;
                    }
                    Err(RegistryError::Closed) => {
                        debug!("Registry closed, ending pass");
                        return stats;
                    }
                }
            }
        }

        stats
    }

    fn launch(&self, worker: Worker, outcome_rx: oneshot::Receiver<ExitInfo>) {
        let id = worker.id();
        let group = worker.handle().group().name.clone();
        debug!(
            worker_id = %id,
            group = %group,
            runner_name = %worker.handle().runner_name(),
            "Launching worker"
        );

        self.tracker
            .spawn(worker.run(Arc::clone(&self.services), self.cancel.clone()));
        self.tracker.spawn(supervise(
            id,
            group,
            outcome_rx,
            Arc::clone(&self.registry),
            self.wake_tx.clone(),
            self.cancel.clone(),
        ));
    }

    fn observe(&mut self, wake: Wake) {
        if wake.provisioning_failed {
            let now = Instant::now();
            let retry_at = self.backoff.record_failure(&wake.group, now);
            warn!(
                group = %wake.group,
                consecutive_failures = self.backoff.consecutive_failures(&wake.group),
                retry_in_ms = retry_at.saturating_duration_since(now).as_millis() as u64,
                "Provisioning failed, backing off"
            );
        } else {
            self.backoff.record_success(&wake.group);
        }
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

/// Wait for a worker's outcome, remove it, then wake the loop unless
/// shutting down.
async fn supervise(
    worker_id: WorkerId,
    group: String,
    outcome_rx: oneshot::Receiver<ExitInfo>,
    registry: Arc<Registry>,
    wake_tx: mpsc::Sender<Wake>,
    cancel: CancellationToken,
) {
    let info = outcome_rx.await.unwrap_or_else(|_| ExitInfo {
        worker_id,
        group: group.clone(),
        error: Some(WorkerError::OutcomeLost),
    });

    match &info.error {
        None => info!(worker_id = %worker_id, group = %group, "Worker exited"),
        Some(e) => error!(
            worker_id = %worker_id,
            group = %group,
            error = %e,
            "Worker exited with error"
        ),
    }

    registry.remove(&worker_id).await;

    if cancel.is_cancelled() {
        return;
    }

    let wake = Wake {
        group,
        provisioning_failed: info.error.as_ref().is_some_and(WorkerError::is_provisioning),
    };
    tokio::select! {
        _ = cancel.cancelled() => {}
        sent = wake_tx.send(wake) => {
            if sent.is_err() {
                debug!(worker_id = %worker_id, "Reconciler gone, wake dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::mock::{MockPlatform, MockRuntime};
    use crate::platform::Repository;

    fn group(name: &str, count: u32) -> GroupSpec {
        GroupSpec {
            name: name.to_string(),
            count,
            repository: Repository {
                owner: "acme".to_string(),
                name: "widgets".to_string(),
                token: "t".to_string(),
            },
            labels: Vec::new(),
            no_default_labels: false,
            image: "ghcr.io/actions/actions-runner".to_string(),
            env_vars: BTreeMap::new(),
        }
    }

    fn reconciler(groups: Vec<GroupSpec>, backoff: BackoffPolicy) -> (Reconciler, Arc<Registry>) {
        let registry = Arc::new(Registry::new());
        let services = Arc::new(WorkerServices {
            runtime: Arc::new(MockRuntime::new()),
            platform: Arc::new(MockPlatform::new()),
            github_url: "https://github.com".to_string(),
            teardown_timeout: None,
        });
        let reconciler = Reconciler::new(
            groups,
            registry.clone(),
            services,
            CancellationToken::new(),
            TaskTracker::new(),
            ReconcilerConfig { backoff },
        );
        (reconciler, registry)
    }

    #[tokio::test]
    async fn test_single_pass_allocates_desired_count() {
        let (mut reconciler, registry) =
            reconciler(vec![group("build", 3), group("deploy", 2)], BackoffPolicy::disabled());

        let stats = reconciler.reconcile_pass().await;

        assert_eq!(stats.groups_checked, 2);
        assert_eq!(stats.launched, 5);
        assert_eq!(registry.count_by_group("build").await, 3);
        assert_eq!(registry.count_by_group("deploy").await, 2);
        for worker in registry.workers().await {
            let expected = if worker.group().name == "build" { 3 } else { 2 };
            assert_eq!(worker.group().count, expected);
        }

        let stats = reconciler.reconcile_pass().await;
        assert_eq!(stats.launched, 0);
    }

    #[tokio::test]
    async fn test_pass_stops_when_registry_closed() {
        let (mut reconciler, registry) =
            reconciler(vec![group("build", 3)], BackoffPolicy::disabled());
        registry.close().await;

        let stats = reconciler.reconcile_pass().await;
        assert_eq!(stats.launched, 0);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_backing_off_group_is_skipped() {
        let backoff = BackoffPolicy {
            base: Duration::from_secs(60),
            max: Duration::from_secs(60),
            jitter: 0.0,
        };
        let (mut reconciler, registry) =
            reconciler(vec![group("ci", 1), group("build", 1)], backoff);

        reconciler.observe(Wake {
            group: "ci".to_string(),
            provisioning_failed: true,
        });
        let stats = reconciler.reconcile_pass().await;

        assert_eq!(stats.backing_off, 1);
        assert_eq!(registry.count_by_group("ci").await, 0);
        assert_eq!(registry.count_by_group("build").await, 1);

        reconciler.observe(Wake {
            group: "ci".to_string(),
            provisioning_failed: false,
        });
        let stats = reconciler.reconcile_pass().await;
        assert_eq!(stats.backing_off, 0);
        assert_eq!(registry.count_by_group("ci").await, 1);
    }
}
