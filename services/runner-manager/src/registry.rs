//! Worker registry.
//!
//! The registry is the authoritative map from worker ID to live worker. A
//! worker is inserted when the reconciler allocates it and removed when its
//! supervisor has received its outcome. Reads take a snapshot under the read
//! lock so callers never hold the lock while talking to a worker.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::config::GroupSpec;
use crate::id::WorkerId;
use crate::worker::{ExitInfo, Worker, WorkerHandle};

/// Registry errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry is closed")]
    Closed,
}

/// Source of fresh worker IDs.
pub type IdSource = Box<dyn Fn() -> WorkerId + Send + Sync>;

#[derive(Default)]
struct Inner {
    workers: HashMap<WorkerId, Arc<WorkerHandle>>,
    closed: bool,
}

/// Thread-safe map of live workers.
pub struct Registry {
    inner: RwLock<Inner>,
    next_id: IdSource,
}

impl Registry {
    /// Create a registry that generates random ULID-based IDs.
    pub fn new() -> Self {
        Self::with_id_source(Box::new(WorkerId::new))
    }

    /// Create a registry that draws IDs from `next_id`.
    pub fn with_id_source(next_id: IdSource) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            next_id,
        }
    }

    /// Allocate a worker for `group` and insert it.
    ///
    /// IDs are drawn until one is found that no live worker holds. Returns
    /// the run side of the worker and its outcome receiver.
    pub async fn allocate(
        &self,
        group: Arc<GroupSpec>,
    ) -> Result<(Worker, oneshot::Receiver<ExitInfo>), RegistryError> {
        let mut inner = self.inner.write().await;
        if inner.closed {
            return Err(RegistryError::Closed);
        }

        let id = loop {
            let id = (self.next_id)();
            if !inner.workers.contains_key(&id) {
                break id;
            }
            warn!(worker_id = %id, "Worker ID collision, regenerating");
        };

        let (worker, outcome_rx) = Worker::new(id, group);
        inner.workers.insert(id, Arc::clone(worker.handle()));

        debug!(
            worker_id = %id,
            group = %worker.handle().group().name,
            live = inner.workers.len(),
            "Worker allocated"
        );
        Ok((worker, outcome_rx))
    }

    /// Remove a worker. Removing an unknown ID is a no-op.
    pub async fn remove(&self, id: &WorkerId) -> Option<Arc<WorkerHandle>> {
        let removed = self.inner.write().await.workers.remove(id);
        if removed.is_some() {
            debug!(worker_id = %id, "Worker removed");
        }
        removed
    }

    /// Snapshot of live workers, in no particular order.
    pub async fn workers(&self) -> Vec<Arc<WorkerHandle>> {
        self.inner.read().await.workers.values().cloned().collect()
    }

    /// Look up a live worker.
    pub async fn get(&self, id: &WorkerId) -> Option<Arc<WorkerHandle>> {
        self.inner.read().await.workers.get(id).cloned()
    }

    /// Live workers belonging to the group named `name`.
    pub async fn count_by_group(&self, name: &str) -> usize {
        self.workers()
            .await
            .iter()
            .filter(|w| w.group().name == name)
            .count()
    }

    /// Number of live workers.
    pub async fn len(&self) -> usize {
        self.inner.read().await.workers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Refuse further allocations. Idempotent.
    pub async fn close(&self) {
        let mut inner = self.inner.write().await;
        if !inner.closed {
            inner.closed = true;
            info!(live = inner.workers.len(), "Registry closed");
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.read().await.closed
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use proptest::prelude::*;
    use ulid::Ulid;

    use super::*;
    use crate::platform::Repository;

    fn group(name: &str) -> Arc<GroupSpec> {
        Arc::new(GroupSpec {
            name: name.to_string(),
            count: 3,
            repository: Repository {
                owner: "acme".to_string(),
                name: "widgets".to_string(),
                token: "t".to_string(),
            },
            labels: Vec::new(),
            no_default_labels: false,
            image: "ghcr.io/actions/actions-runner".to_string(),
            env_vars: BTreeMap::new(),
        })
    }

    #[tokio::test]
    async fn test_allocate_and_count() {
        let registry = Registry::new();
        let build = group("build");
        let deploy = group("deploy");

        let (a, _) = registry.allocate(build.clone()).await.unwrap();
        registry.allocate(build.clone()).await.unwrap();
        registry.allocate(deploy.clone()).await.unwrap();

        assert_eq!(registry.len().await, 3);
        assert_eq!(registry.count_by_group("build").await, 2);
        assert_eq!(registry.count_by_group("deploy").await, 1);
        assert_eq!(registry.count_by_group("other").await, 0);
        assert!(registry.get(&a.id()).await.is_some());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = Registry::new();
        let (worker, _) = registry.allocate(group("build")).await.unwrap();
        let id = worker.id();

        assert!(registry.remove(&id).await.is_some());
        assert!(registry.remove(&id).await.is_none());
        assert!(registry.remove(&WorkerId::new()).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_colliding_ids_are_regenerated() {
        let fixed = Ulid::from_parts(1, 1);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        // First two draws return the same ID; later draws are fresh.
        let registry = Registry::with_id_source(Box::new(move || {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => WorkerId::from_ulid(fixed),
                _ => WorkerId::new(),
            }
        }));

        let (first, _) = registry.allocate(group("build")).await.unwrap();
        let (second, _) = registry.allocate(group("build")).await.unwrap();

        assert_eq!(first.id(), WorkerId::from_ulid(fixed));
        assert_ne!(second.id(), first.id());
        assert_eq!(registry.len().await, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_closed_registry_rejects_allocation() {
        let registry = Registry::new();
        registry.allocate(group("build")).await.unwrap();
        registry.close().await;
        registry.close().await;

        assert!(registry.is_closed().await);
        assert_eq!(
            registry.allocate(group("build")).await.unwrap_err(),
            RegistryError::Closed
        );
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_allocation_yields_unique_ids() {
        let registry = Arc::new(Registry::new());
        let mut tasks = Vec::new();
        for i in 0..64 {
            let registry = registry.clone();
            let group = group(if i % 2 == 0 { "a" } else { "b" });
            tasks.push(tokio::spawn(async move {
                registry.allocate(group).await.unwrap().0.id()
            }));
        }

        let mut ids = HashSet::new();
        for task in tasks {
            assert!(ids.insert(task.await.unwrap()));
        }
        assert_eq!(registry.count_by_group("a").await, 32);
        assert_eq!(registry.count_by_group("b").await, 32);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate(bool),
        Remove(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<bool>().prop_map(Op::Allocate),
            (0usize..32).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn prop_interleaved_ops_keep_ids_unique(ops in prop::collection::vec(op(), 1..64)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                // A tiny ID space forces collisions.
                let registry = Registry::with_id_source(Box::new(|| {
                    WorkerId::from_ulid(Ulid::from_parts(0, rand_small()))
                }));
                let mut live: Vec<WorkerId> = Vec::new();
                let mut per_group = [0usize; 2];

                for op in ops {
                    match op {
                        Op::Allocate(in_a) => {
                            if live.len() >= 48 {
                                continue;
                            }
                            let name = if in_a { "a" } else { "b" };
                            let (worker, _) = registry.allocate(group(name)).await.unwrap();
                            assert!(!live.contains(&worker.id()));
                            live.push(worker.id());
                            per_group[usize::from(!in_a)] += 1;
                        }
                        Op::Remove(i) => {
                            if live.is_empty() {
                                continue;
                            }
                            let id = live.remove(i % live.len());
                            let handle = registry.remove(&id).await.unwrap();
                            let idx = usize::from(handle.group().name != "a");
                            per_group[idx] -= 1;
                        }
                    }

                    assert_eq!(registry.len().await, live.len());
                    assert_eq!(registry.count_by_group("a").await, per_group[0]);
                    assert_eq!(registry.count_by_group("b").await, per_group[1]);
                }
            });
        }
    }

    fn rand_small() -> u128 {
        use std::sync::atomic::AtomicU64;
        static NEXT: AtomicU64 = AtomicU64::new(0);
        // Cycles through 64 values so live IDs collide often.
        u128::from(NEXT.fetch_add(7, Ordering::Relaxed) % 64)
    }
}
