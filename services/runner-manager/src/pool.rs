//! Runner pool wiring.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::GroupSpec;
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::registry::Registry;
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::worker::WorkerServices;

/// A running pool: the reconciliation loop, its workers and the means to
/// stop them.
pub struct RunnerPool {
    registry: Arc<Registry>,
    cancel: CancellationToken,
    coordinator: ShutdownCoordinator,
}

impl RunnerPool {
    /// Start reconciling `groups`. Must be called within a tokio runtime.
    pub fn start(
        groups: Vec<GroupSpec>,
        services: WorkerServices,
        config: ReconcilerConfig,
    ) -> Self {
        Self::start_with_registry(Arc::new(Registry::new()), groups, services, config)
    }

    /// Start with a caller-supplied registry.
    pub fn start_with_registry(
        registry: Arc<Registry>,
        groups: Vec<GroupSpec>,
        services: WorkerServices,
        config: ReconcilerConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let reconciler = Reconciler::new(
            groups,
            Arc::clone(&registry),
            Arc::new(services),
            cancel.clone(),
            tracker.clone(),
            config,
        );
        tracker.spawn(reconciler.run());

        let coordinator = ShutdownCoordinator::new(Arc::clone(&registry), cancel.clone(), tracker);
        Self {
            registry,
            cancel,
            coordinator,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel, terminate every worker and wait for all of them.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.coordinator.shutdown().await
    }
}
