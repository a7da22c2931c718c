//! CI platform interface.
//!
//! The worker needs three things from the CI platform:
//! - A short-lived registration token so the runner can join the repository
//! - The registered runners matching a name (for teardown)
//! - Removal of a registered runner by ID
//!
//! `GitHubClient` implements this against the GitHub REST API; `MockPlatform`
//! in [`crate::mock`] implements it in memory.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

/// Errors from the CI platform.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("platform unavailable: {0}")]
    Unavailable(String),
}

/// A repository runners register against, with the credential used to
/// manage them.
#[derive(Clone, PartialEq, Eq)]
pub struct Repository {
    pub owner: String,
    pub name: String,
    pub token: String,
}

impl Repository {
    /// `owner/name`, as used in URLs and logs.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("owner", &self.owner)
            .field("name", &self.name)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Token a runner presents to `config.sh` to register itself.
#[derive(Clone, Deserialize)]
pub struct RegistrationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for RegistrationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationToken")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A runner as registered on the CI platform.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegisteredRunner {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// CI platform interface.
#[async_trait]
pub trait CiPlatform: Send + Sync {
    /// Issue a registration token for the repository.
    async fn issue_registration_token(
        &self,
        repo: &Repository,
    ) -> Result<RegistrationToken, PlatformError>;

    /// List registered runners whose name is exactly `name`.
    async fn list_registered_workers(
        &self,
        repo: &Repository,
        name: &str,
    ) -> Result<Vec<RegisteredRunner>, PlatformError>;

    /// Remove a registered runner. Removing an unknown runner is not an error.
    async fn remove_registered_worker(
        &self,
        repo: &Repository,
        runner_id: u64,
    ) -> Result<(), PlatformError>;
}
