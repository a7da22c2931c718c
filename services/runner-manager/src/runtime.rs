//! Container runtime interface.
//!
//! The runtime interface abstracts the container lifecycle a worker needs:
//! - Creating and starting the runner container
//! - Waiting for it to stop running
//! - Force-removing it during teardown
//!
//! `DockerRuntime` implements it against the Docker Engine API; `MockRuntime`
//! in [`crate::mock`] implements it in memory.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    #[error("runtime unavailable: {0}")]
    Unavailable(String),
}

impl RuntimeError {
    /// True if the runtime reported the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::Api { status: 404, .. })
    }
}

impl From<hyper::http::Error> for RuntimeError {
    fn from(err: hyper::http::Error) -> Self {
        RuntimeError::InvalidRequest(err.to_string())
    }
}

/// Handle to a created container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(pub String);

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to create a runner container.
#[derive(Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name (also the runner name).
    pub name: String,

    /// Image reference.
    pub image: String,

    /// Entrypoint override.
    pub entrypoint: Vec<String>,

    /// Environment variables.
    pub env: BTreeMap<String, String>,

    /// Container labels.
    pub labels: BTreeMap<String, String>,
}

impl fmt::Debug for ContainerSpec {
    // The entrypoint embeds the registration token and env may hold secrets.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerSpec")
            .field("name", &self.name)
            .field("image", &self.image)
            .field("env_var_count", &self.env.len())
            .field("labels", &self.labels)
            .finish_non_exhaustive()
    }
}

/// How a container stopped running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    /// Process exit code.
    pub status_code: i64,

    /// Error reported by the runtime while waiting, if any.
    pub error: Option<String>,
}

impl ExitStatus {
    /// A clean exit with the given code.
    pub fn code(status_code: i64) -> Self {
        Self {
            status_code,
            error: None,
        }
    }
}

/// Container runtime interface.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container.
    ///
    /// On error nothing is left running: a container that was created but
    /// failed to start is removed before returning.
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<ContainerId, RuntimeError>;

    /// Block until the container is no longer running.
    async fn wait_for_exit(&self, id: &ContainerId) -> Result<ExitStatus, RuntimeError>;

    /// Force-remove a container. Removing a missing container is not an error.
    async fn force_remove(&self, id: &ContainerId) -> Result<(), RuntimeError>;
}
