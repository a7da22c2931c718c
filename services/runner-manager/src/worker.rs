//! Worker lifecycle.
//!
//! A worker is one ephemeral runner: a container that registers itself with
//! GitHub, runs at most one job and exits. Each worker moves through:
//!
//! ```text
//! Created -> Provisioning -> Running -> Exited
//!                               |          ^
//!                               v          |
//!                          Terminating ----+
//! ```
//!
//! No state is revisited. The worker reports exactly one [`ExitInfo`] on its
//! outcome channel when it reaches `Exited`.
//!
//! The run side ([`Worker`]) is consumed by [`Worker::run`]. The shared side
//! ([`WorkerHandle`]) lives in the registry and carries the terminate signal.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::GroupSpec;
use crate::id::WorkerId;
use crate::platform::{CiPlatform, PlatformError};
use crate::runtime::{ContainerId, ContainerRuntime, ContainerSpec, RuntimeError};

/// Container label carrying the group name.
pub const GROUP_LABEL: &str = "rpool.group";

/// Container label carrying the worker ID.
pub const WORKER_LABEL: &str = "rpool.worker";

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Allocated in the registry, run not started.
    Created,
    /// Obtaining a registration token and starting the container.
    Provisioning,
    /// Container running; waiting for it to exit or for terminate.
    Running,
    /// Removing the container and the runner registration.
    Terminating,
    /// Terminal.
    Exited,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Created => "created",
            WorkerState::Provisioning => "provisioning",
            WorkerState::Running => "running",
            WorkerState::Terminating => "terminating",
            WorkerState::Exited => "exited",
        };
        f.write_str(s)
    }
}

/// Why a worker exited with an error.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to get registration token: {0}")]
    RegistrationToken(#[source] PlatformError),

    #[error("failed to start container: {0}")]
    ContainerStart(#[source] RuntimeError),

    #[error("failed to wait for container: {0}")]
    ContainerWait(#[source] RuntimeError),

    #[error("container exited with error: {0}")]
    ContainerExited(String),

    #[error("failed to remove container: {0}")]
    ContainerRemove(#[source] RuntimeError),

    #[error("failed to list registered runners: {0}")]
    ListRunners(#[source] PlatformError),

    #[error("failed to remove registered runner {runner_id}: {source}")]
    RemoveRunner {
        runner_id: u64,
        #[source]
        source: PlatformError,
    },

    #[error("teardown did not finish within {0:?}")]
    TeardownTimedOut(Duration),

    #[error("worker ended without reporting an outcome")]
    OutcomeLost,
}

impl WorkerError {
    /// True if the worker failed before its container was running.
    pub fn is_provisioning(&self) -> bool {
        matches!(
            self,
            WorkerError::RegistrationToken(_) | WorkerError::ContainerStart(_)
        )
    }
}

/// Terminal result of one worker, delivered exactly once.
#[derive(Debug)]
pub struct ExitInfo {
    pub worker_id: WorkerId,
    pub group: String,
    pub error: Option<WorkerError>,
}

/// External collaborators and settings shared by every worker.
pub struct WorkerServices {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub platform: Arc<dyn CiPlatform>,

    /// GitHub web URL the runner registers against.
    pub github_url: String,

    /// Bound on the terminate path; `None` waits forever.
    pub teardown_timeout: Option<Duration>,
}

/// Shared view of a worker, held by the registry.
pub struct WorkerHandle {
    id: WorkerId,
    group: Arc<GroupSpec>,
    runner_name: String,
    terminate_tx: Mutex<Option<oneshot::Sender<()>>>,
    state: watch::Receiver<WorkerState>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn group(&self) -> &Arc<GroupSpec> {
        &self.group
    }

    /// Name registered with GitHub; also the container name.
    pub fn runner_name(&self) -> &str {
        &self.runner_name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Wait until the worker reaches `target` or any later state.
    pub async fn wait_for_state(&self, target: WorkerState) -> WorkerState {
        let mut rx = self.state.clone();
        let state = match rx.wait_for(|s| state_rank(*s) >= state_rank(target)).await {
            Ok(state) => *state,
            Err(_) => WorkerState::Exited,
        };
        state
    }

    /// Ask the worker to tear down.
    ///
    /// Only the first call sends. Returns false if terminate was already
    /// requested or the worker has already finished.
    pub async fn terminate(&self) -> bool {
        let Some(tx) = self.terminate_tx.lock().await.take() else {
            warn!(worker_id = %self.id, "Terminate already requested");
            return false;
        };

        if tx.send(()).is_err() {
            debug!(worker_id = %self.id, "Worker finished before terminate");
            return false;
        }

        info!(worker_id = %self.id, group = %self.group.name, "Terminate requested");
        true
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("group", &self.group.name)
            .field("runner_name", &self.runner_name)
            .field("state", &self.state())
            .finish()
    }
}

fn state_rank(state: WorkerState) -> u8 {
    match state {
        WorkerState::Created => 0,
        WorkerState::Provisioning => 1,
        WorkerState::Running => 2,
        WorkerState::Terminating => 3,
        WorkerState::Exited => 4,
    }
}

/// Runner name for a worker: `runner-{group}-{ulid}`.
pub fn runner_name(group: &str, id: &WorkerId) -> String {
    format!("runner-{}-{}", group, id.name_suffix())
}

/// Run side of a worker. Consumed by [`Worker::run`].
pub struct Worker {
    handle: Arc<WorkerHandle>,
    terminate_rx: oneshot::Receiver<()>,
    outcome_tx: oneshot::Sender<ExitInfo>,
    state_tx: watch::Sender<WorkerState>,
}

impl Worker {
    /// Build a worker in `Created` with its outcome receiver.
    pub(crate) fn new(id: WorkerId, group: Arc<GroupSpec>) -> (Self, oneshot::Receiver<ExitInfo>) {
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(WorkerState::Created);

        let handle = Arc::new(WorkerHandle {
            id,
            runner_name: runner_name(&group.name, &id),
            group,
            terminate_tx: Mutex::new(Some(terminate_tx)),
            state: state_rx,
        });

        let worker = Self {
            handle,
            terminate_rx,
            outcome_tx,
            state_tx,
        };
        (worker, outcome_rx)
    }

    pub fn handle(&self) -> &Arc<WorkerHandle> {
        &self.handle
    }

    pub fn id(&self) -> WorkerId {
        self.handle.id
    }

    /// Drive the worker to `Exited` and deliver its outcome.
    ///
    /// A worker whose run begins after `cancel` has fired exits cleanly
    /// without provisioning anything.
    pub async fn run(self, services: Arc<WorkerServices>, cancel: CancellationToken) {
        let Worker {
            handle,
            terminate_rx,
            outcome_tx,
            state_tx,
        } = self;

        let result = if cancel.is_cancelled() {
            info!(
                worker_id = %handle.id,
                group = %handle.group.name,
                "Shutting down, skipping provisioning"
            );
            Ok(())
        } else {
            let mut run = Run {
                handle: &handle,
                services: &services,
                state_tx: &state_tx,
                terminate_rx,
            };
            run.drive().await
        };

        state_tx.send_replace(WorkerState::Exited);

        let info = ExitInfo {
            worker_id: handle.id,
            group: handle.group.name.clone(),
            error: result.err(),
        };
        if outcome_tx.send(info).is_err() {
            warn!(worker_id = %handle.id, "Outcome receiver dropped");
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Worker").field(&self.handle).finish()
    }
}

struct Run<'a> {
    handle: &'a WorkerHandle,
    services: &'a WorkerServices,
    state_tx: &'a watch::Sender<WorkerState>,
    terminate_rx: oneshot::Receiver<()>,
}

impl Run<'_> {
    fn set_state(&self, state: WorkerState) {
        debug!(worker_id = %self.handle.id, state = %state, "Worker state changed");
        self.state_tx.send_replace(state);
    }

    async fn drive(&mut self) -> Result<(), WorkerError> {
        self.set_state(WorkerState::Provisioning);
        let container = self.provision().await?;

        self.set_state(WorkerState::Running);
        info!(
            worker_id = %self.handle.id,
            group = %self.handle.group.name,
            runner_name = %self.handle.runner_name,
            container_id = %container,
            "Runner started"
        );

        let runtime = Arc::clone(&self.services.runtime);
        tokio::select! {
            biased;
            _ = terminate_signal(&mut self.terminate_rx) => {}
            exit = runtime.wait_for_exit(&container) => return self.completed(exit),
        }

        self.set_state(WorkerState::Terminating);
        self.bounded_teardown(&container).await
    }

    async fn provision(&self) -> Result<ContainerId, WorkerError> {
        let group = &self.handle.group;

        let token = self
            .services
            .platform
            .issue_registration_token(&group.repository)
            .await
            .map_err(WorkerError::RegistrationToken)?;
        debug!(
            worker_id = %self.handle.id,
            expires_at = %token.expires_at,
            "Got registration token"
        );

        let spec = ContainerSpec {
            name: self.handle.runner_name.clone(),
            image: group.image.clone(),
            entrypoint: runner_command(
                &self.services.github_url,
                group,
                &self.handle.runner_name,
                &token.token,
            ),
            env: group.env_vars.clone(),
            labels: BTreeMap::from([
                (GROUP_LABEL.to_string(), group.name.clone()),
                (WORKER_LABEL.to_string(), self.handle.id.to_string()),
            ]),
        };

        self.services
            .runtime
            .create_and_start(&spec)
            .await
            .map_err(WorkerError::ContainerStart)
    }

    fn completed(
        &self,
        exit: Result<crate::runtime::ExitStatus, RuntimeError>,
    ) -> Result<(), WorkerError> {
        match exit {
            Ok(status) => match status.error {
                None => {
                    info!(
                        worker_id = %self.handle.id,
                        runner_name = %self.handle.runner_name,
                        exit_code = status.status_code,
                        "Runner exited"
                    );
                    Ok(())
                }
                Some(message) => Err(WorkerError::ContainerExited(message)),
            },
            Err(e) => Err(WorkerError::ContainerWait(e)),
        }
    }

    async fn bounded_teardown(&self, container: &ContainerId) -> Result<(), WorkerError> {
        let Some(limit) = self.services.teardown_timeout else {
            return self.teardown(container).await;
        };

        match tokio::time::timeout(limit, self.teardown(container)).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    worker_id = %self.handle.id,
                    runner_name = %self.handle.runner_name,
                    timeout = ?limit,
                    "Teardown timed out, abandoning"
                );
                Err(WorkerError::TeardownTimedOut(limit))
            }
        }
    }

    /// Remove the container, then the runner registration. Both steps run
    /// even if the first fails; the first error is reported.
    async fn teardown(&self, container: &ContainerId) -> Result<(), WorkerError> {
        let repo = &self.handle.group.repository;
        let name = &self.handle.runner_name;
        let mut first_error = None;

        info!(worker_id = %self.handle.id, container_id = %container, "Removing container");
        if let Err(e) = self.services.runtime.force_remove(container).await {
            error!(worker_id = %self.handle.id, error = %e, "Failed to remove container");
            first_error.get_or_insert(WorkerError::ContainerRemove(e));
        }

        match self.services.platform.list_registered_workers(repo, name).await {
            Ok(runners) => match runners.as_slice() {
                [] => {
                    info!(runner_name = %name, "Runner not registered, nothing to remove");
                }
                [runner] => {
                    info!(
                        runner_name = %name,
                        runner_id = runner.id,
                        "Removing runner registration"
                    );
                    if let Err(source) = self
                        .services
                        .platform
                        .remove_registered_worker(repo, runner.id)
                        .await
                    {
                        error!(runner_id = runner.id, error = %source, "Failed to remove runner");
                        first_error.get_or_insert(WorkerError::RemoveRunner {
                            runner_id: runner.id,
                            source,
                        });
                    }
                }
                many => {
                    warn!(
                        runner_name = %name,
                        count = many.len(),
                        "Multiple runners share this name, removing none"
                    );
                }
            },
            Err(e) => {
                error!(runner_name = %name, error = %e, "Failed to list runners");
                first_error.get_or_insert(WorkerError::ListRunners(e));
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

/// Resolves when terminate is received. A dropped sender never resolves.
async fn terminate_signal(rx: &mut oneshot::Receiver<()>) {
    if rx.await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Entrypoint that configures an ephemeral runner and runs it.
pub fn runner_command(
    github_url: &str,
    group: &GroupSpec,
    runner_name: &str,
    token: &str,
) -> Vec<String> {
    let url = format!(
        "{}/{}/{}",
        github_url.trim_end_matches('/'),
        group.repository.owner,
        group.repository.name
    );

    let mut script = format!(
        "./config.sh --url {} --name {} --token {} --unattended --ephemeral",
        shell_quote(&url),
        shell_quote(runner_name),
        shell_quote(token),
    );
    if !group.labels.is_empty() {
        script.push_str(" --labels ");
        script.push_str(&shell_quote(&group.labels.join(",")));
    }
    if group.no_default_labels {
        script.push_str(" --no-default-labels");
    }
    script.push_str("; ./run.sh");

    vec!["sh".to_string(), "-c".to_string(), script]
}
