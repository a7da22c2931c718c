//! In-memory collaborators for testing and development.
//!
//! [`MockRuntime`] stands in for Docker and [`MockPlatform`] for GitHub.
//! Both record what was asked of them and can be told to fail or stall.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{debug, info};

use crate::platform::{CiPlatform, PlatformError, RegisteredRunner, RegistrationToken, Repository};
use crate::runtime::{ContainerId, ContainerRuntime, ContainerSpec, ExitStatus, RuntimeError};

struct MockContainer {
    spec: ContainerSpec,
    exit: watch::Sender<Option<ExitStatus>>,
}

/// Mock container runtime.
///
/// Containers run until [`MockRuntime::exit`] or `force_remove` is called.
pub struct MockRuntime {
    counter: AtomicU64,
    fail_starts: AtomicBool,
    fail_removes: AtomicBool,
    remove_delay_ms: AtomicU64,
    start_gate: OnceLock<Arc<Semaphore>>,
    containers: Mutex<HashMap<ContainerId, MockContainer>>,
    created: Mutex<Vec<String>>,
    removed: Mutex<Vec<ContainerId>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            fail_starts: AtomicBool::new(false),
            fail_removes: AtomicBool::new(false),
            remove_delay_ms: AtomicU64::new(0),
            start_gate: OnceLock::new(),
            containers: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        }
    }

    /// Make every start fail.
    pub fn fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    /// Make every force-remove fail.
    pub fn fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    /// Delay every force-remove.
    pub fn set_remove_delay(&self, delay: Duration) {
        self.remove_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Block starts until a permit is added to the returned semaphore.
    pub fn hold_starts(&self) -> Arc<Semaphore> {
        self.start_gate
            .get_or_init(|| Arc::new(Semaphore::new(0)))
            .clone()
    }

    /// Stop the container named `name` with `status`.
    ///
    /// Returns false if no such container is running.
    pub async fn exit(&self, name: &str, status: ExitStatus) -> bool {
        let containers = self.containers.lock().await;
        let Some(container) = containers.values().find(|c| c.spec.name == name) else {
            return false;
        };
        if container.exit.borrow().is_some() {
            return false;
        }
        container.exit.send_replace(Some(status));
        true
    }

    /// Spec a container was created with, while it is still present.
    pub async fn spec(&self, name: &str) -> Option<ContainerSpec> {
        self.containers
            .lock()
            .await
            .values()
            .find(|c| c.spec.name == name)
            .map(|c| c.spec.clone())
    }

    /// Names of every container created so far.
    pub async fn created(&self) -> Vec<String> {
        self.created.lock().await.clone()
    }

    /// Containers force-removed so far.
    pub async fn removed(&self) -> Vec<ContainerId> {
        self.removed.lock().await.clone()
    }

    /// Containers that have not exited.
    pub async fn running(&self) -> usize {
        self.containers
            .lock()
            .await
            .values()
            .filter(|c| c.exit.borrow().is_none())
            .count()
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<ContainerId, RuntimeError> {
        if let Some(gate) = self.start_gate.get() {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
            permit.forget();
        }

        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api {
                status: 500,
                message: "mock runtime configured to fail".to_string(),
            });
        }

        let id = ContainerId(format!(
            "mock_{:016x}",
            self.counter.fetch_add(1, Ordering::SeqCst)
        ));
        info!(
            container_id = %id,
            name = %spec.name,
            image = %spec.image,
            "[MOCK] Starting container"
        );

        let (exit, _) = watch::channel(None);
        self.containers.lock().await.insert(
            id.clone(),
            MockContainer {
                spec: spec.clone(),
                exit,
            },
        );
        self.created.lock().await.push(spec.name.clone());

        Ok(id)
    }

    async fn wait_for_exit(&self, id: &ContainerId) -> Result<ExitStatus, RuntimeError> {
        let mut rx = {
            let containers = self.containers.lock().await;
            let container = containers.get(id).ok_or_else(|| RuntimeError::Api {
                status: 404,
                message: format!("No such container: {}", id),
            })?;
            container.exit.subscribe()
        };

        let status = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RuntimeError::Unavailable("container vanished".to_string()))?;

        Ok(status.clone().unwrap_or_else(|| ExitStatus::code(0)))
    }

    async fn force_remove(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        let delay = self.remove_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            debug!(container_id = %id, delay_ms = delay, "[MOCK] Delaying container removal");
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable(
                "mock runtime configured to fail removal".to_string(),
            ));
        }

        info!(container_id = %id, "[MOCK] Removing container");
        if let Some(container) = self.containers.lock().await.remove(id) {
            container.exit.send_if_modified(|exit| {
                if exit.is_some() {
                    return false;
                }
                *exit = Some(ExitStatus::code(137));
                true
            });
        }
        self.removed.lock().await.push(id.clone());

        Ok(())
    }
}

/// Mock CI platform.
///
/// Runners are only "registered" when a test calls [`MockPlatform::register`].
pub struct MockPlatform {
    token_failures: AtomicUsize,
    token_requests: AtomicUsize,
    fail_lists: AtomicBool,
    fail_removes: AtomicBool,
    next_runner_id: AtomicU64,
    registered: Mutex<Vec<RegisteredRunner>>,
    removed: Mutex<Vec<u64>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            token_failures: AtomicUsize::new(0),
            token_requests: AtomicUsize::new(0),
            fail_lists: AtomicBool::new(false),
            fail_removes: AtomicBool::new(false),
            next_runner_id: AtomicU64::new(1),
            registered: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        }
    }

    /// Make every registration-token request fail.
    pub fn fail_tokens(&self, fail: bool) {
        let n = if fail { usize::MAX } else { 0 };
        self.token_failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` registration-token requests fail.
    pub fn fail_next_tokens(&self, n: usize) {
        self.token_failures.store(n, Ordering::SeqCst);
    }

    /// Make every registered-runner listing fail.
    pub fn fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }

    /// Make every registered-runner removal fail.
    pub fn fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    /// Registration-token requests seen so far.
    pub fn token_requests(&self) -> usize {
        self.token_requests.load(Ordering::SeqCst)
    }

    /// Register a runner under `name`, returning its ID.
    pub async fn register(&self, name: &str) -> u64 {
        let id = self.next_runner_id.fetch_add(1, Ordering::SeqCst);
        self.registered.lock().await.push(RegisteredRunner {
            id,
            name: name.to_string(),
            status: Some("online".to_string()),
        });
        id
    }

    /// Runner IDs removed so far.
    pub async fn removed(&self) -> Vec<u64> {
        self.removed.lock().await.clone()
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CiPlatform for MockPlatform {
    async fn issue_registration_token(
        &self,
        repo: &Repository,
    ) -> Result<RegistrationToken, PlatformError> {
        self.token_requests.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .token_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if failing {
            return Err(PlatformError::Unavailable(
                "mock platform configured to fail".to_string(),
            ));
        }

        debug!(repository = %repo.full_name(), "[MOCK] Issuing registration token");
        Ok(RegistrationToken {
            token: "MOCKREGISTRATIONTOKEN".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        })
    }

    async fn list_registered_workers(
        &self,
        _repo: &Repository,
        name: &str,
    ) -> Result<Vec<RegisteredRunner>, PlatformError> {
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(PlatformError::Api {
                status: 503,
                message: "mock platform configured to fail listing".to_string(),
            });
        }

        Ok(self
            .registered
            .lock()
            .await
            .iter()
            .filter(|r| r.name == name)
            .cloned()
            .collect())
    }

    async fn remove_registered_worker(
        &self,
        _repo: &Repository,
        runner_id: u64,
    ) -> Result<(), PlatformError> {
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(PlatformError::Api {
                status: 422,
                message: "mock platform configured to fail removal".to_string(),
            });
        }

        info!(runner_id, "[MOCK] Removing runner");
        self.registered.lock().await.retain(|r| r.id != runner_id);
        self.removed.lock().await.push(runner_id);
        Ok(())
    }
}
