//! GitHub Actions API client.
//!
//! Implements [`CiPlatform`] against the repository-level self-hosted runner
//! endpoints:
//! - `POST /repos/{owner}/{repo}/actions/runners/registration-token`
//! - `GET /repos/{owner}/{repo}/actions/runners?name=`
//! - `DELETE /repos/{owner}/{repo}/actions/runners/{runner_id}`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, error};

use crate::platform::{CiPlatform, PlatformError, RegisteredRunner, RegistrationToken, Repository};

const API_VERSION: &str = "2022-11-28";
const ACCEPT: &str = "application/vnd.github+json";

/// GitHub REST API client.
pub struct GitHubClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct RunnerList {
    #[allow(dead_code)]
    total_count: u64,
    runners: Vec<RegisteredRunner>,
}

impl GitHubClient {
    /// Create a client for the given API base URL (e.g. `https://api.github.com`).
    pub fn new(base_url: &str) -> Result<Self, PlatformError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("rpool-runner-manager/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn runners_url(&self, repo: &Repository) -> String {
        format!(
            "{}/repos/{}/{}/actions/runners",
            self.base_url, repo.owner, repo.name
        )
    }

    fn authorized(
        &self,
        builder: reqwest::RequestBuilder,
        repo: &Repository,
    ) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(&repo.token)
            .header("Accept", ACCEPT)
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    async fn api_error(response: reqwest::Response, what: &str) -> PlatformError {
        let status = response.status();
        let message = response.text().await.unwrap_or_default();
        error!(status = %status, message = %message, "GitHub API request failed: {}", what);
        PlatformError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl CiPlatform for GitHubClient {
    async fn issue_registration_token(
        &self,
        repo: &Repository,
    ) -> Result<RegistrationToken, PlatformError> {
        let url = format!("{}/registration-token", self.runners_url(repo));
        debug!(repository = %repo.full_name(), "Requesting registration token");

        let response = self
            .authorized(self.client.post(&url), repo)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::api_error(response, "create registration token").await);
        }

        Ok(response.json().await?)
    }

    async fn list_registered_workers(
        &self,
        repo: &Repository,
        name: &str,
    ) -> Result<Vec<RegisteredRunner>, PlatformError> {
        let url = self.runners_url(repo);
        debug!(repository = %repo.full_name(), runner_name = %name, "Listing registered runners");

        let response = self
            .authorized(self.client.get(&url), repo)
            .query(&[("name", name), ("per_page", "100")])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::api_error(response, "list runners").await);
        }

        let list: RunnerList = response.json().await?;
        Ok(list
            .runners
            .into_iter()
            .filter(|runner| runner.name == name)
            .collect())
    }

    async fn remove_registered_worker(
        &self,
        repo: &Repository,
        runner_id: u64,
    ) -> Result<(), PlatformError> {
        let url = format!("{}/{}", self.runners_url(repo), runner_id);
        debug!(repository = %repo.full_name(), runner_id, "Removing registered runner");

        let response = self
            .authorized(self.client.delete(&url), repo)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(runner_id, "Runner already removed");
            return Ok(());
        }

        if !response.status().is_success() {
            return Err(Self::api_error(response, "remove runner").await);
        }

        Ok(())
    }
}
