//! Docker Engine API client.
//!
//! Talks to the Docker daemon over its Unix socket and implements
//! [`ContainerRuntime`] for runner containers.
//!
//! Reference: https://docs.docker.com/engine/api/v1.41/

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::runtime::{ContainerId, ContainerRuntime, ContainerSpec, ExitStatus, RuntimeError};

/// Engine API version the requests are pinned to.
pub const API_VERSION: &str = "v1.41";

/// Default Docker socket path.
pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Pulls of large runner images routinely outlast ordinary requests.
const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateContainerRequest<'a> {
    image: &'a str,
    entrypoint: &'a [String],
    env: Vec<String>,
    labels: &'a BTreeMap<String, String>,
    host_config: HostConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig {
    auto_remove: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateContainerResponse {
    id: String,
    #[serde(default)]
    warnings: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WaitResponse {
    status_code: i64,
    #[serde(default)]
    error: Option<WaitError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WaitError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct EngineMessage {
    message: String,
}

/// Docker Engine API client for Unix socket communication.
pub struct DockerRuntime {
    socket_path: String,
    client: Client<UnixConnector>,
    request_timeout: Duration,
    pull_timeout: Duration,
}

impl DockerRuntime {
    /// Create a new client for the given socket path.
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_string_lossy().to_string(),
            client: Client::unix(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            pull_timeout: DEFAULT_PULL_TIMEOUT,
        }
    }

    /// Bound every call except `wait_for_exit` and image pulls by `timeout`.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Bound image pulls by `timeout`.
    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    /// Check if the socket exists.
    pub fn socket_exists(&self) -> bool {
        Path::new(&self.socket_path).exists()
    }

    /// Perform a request and collect the full response body.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Bytes), RuntimeError> {
        let uri: hyper::Uri = Uri::new(&self.socket_path, &format!("/{API_VERSION}{path}")).into();

        debug!(method = %method, path = path, "Docker API request");

        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");

        let request = match body {
            Some(bytes) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(bytes))?,
            None => builder.body(Body::empty())?,
        };

        let response = self.client.request(request).await?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await?;
        Ok((status, bytes))
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, RuntimeError>>,
    ) -> Result<T, RuntimeError> {
        bounded_by(self.request_timeout, operation, fut).await
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, RuntimeError> {
        let request = CreateContainerRequest {
            image: &spec.image,
            entrypoint: &spec.entrypoint,
            env: env_list(&spec.env),
            labels: &spec.labels,
            host_config: HostConfig { auto_remove: true },
        };
        let body = serde_json::to_vec(&request)?;
        let path = format!("/containers/create?name={}", spec.name);

        let (status, bytes) = self
            .bounded("container create", self.request(Method::POST, &path, Some(body)))
            .await?;
        if !status.is_success() {
            return Err(api_error(status, &bytes));
        }

        let created: CreateContainerResponse = serde_json::from_slice(&bytes)?;
        for warning in created.warnings.unwrap_or_default() {
            warn!(container = %spec.name, warning = %warning, "Docker create warning");
        }
        Ok(ContainerId(created.id))
    }

    /// Pull an image. The engine streams progress objects; a failed pull
    /// still answers 200 with an `error` object in the stream.
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let (from_image, tag) = split_image_ref(image);
        let path = match tag {
            Some(tag) => format!("/images/create?fromImage={from_image}&tag={tag}"),
            None => format!("/images/create?fromImage={from_image}"),
        };

        info!(image = %image, "Pulling image");
        let (status, bytes) = bounded_by(
            self.pull_timeout,
            "image pull",
            self.request(Method::POST, &path, None),
        )
        .await?;
        if !status.is_success() {
            return Err(api_error(status, &bytes));
        }

        if let Some(message) = stream_error(&bytes) {
            return Err(RuntimeError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }

    async fn start_container(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        let path = format!("/containers/{}/start", id);
        let (status, bytes) = self
            .bounded("container start", self.request(Method::POST, &path, None))
            .await?;

        // 304: already started
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            Ok(())
        } else {
            Err(api_error(status, &bytes))
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<ContainerId, RuntimeError> {
        let id = match self.create_container(spec).await {
            Ok(id) => id,
            Err(e) if e.is_not_found() => {
                self.pull_image(&spec.image).await?;
                self.create_container(spec).await?
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = self.start_container(&id).await {
            if let Err(remove_err) = self.force_remove(&id).await {
                warn!(
                    container_id = %id,
                    error = %remove_err,
                    "Failed to remove container after start failure"
                );
            }
            return Err(e);
        }

        debug!(container_id = %id, name = %spec.name, "Container started");
        Ok(id)
    }

    async fn wait_for_exit(&self, id: &ContainerId) -> Result<ExitStatus, RuntimeError> {
        let path = format!("/containers/{}/wait?condition=not-running", id);
        let (status, bytes) = self.request(Method::POST, &path, None).await?;
        if !status.is_success() {
            return Err(api_error(status, &bytes));
        }

        let response: WaitResponse = serde_json::from_slice(&bytes)?;
        Ok(ExitStatus {
            status_code: response.status_code,
            error: response
                .error
                .map(|e| e.message)
                .filter(|message| !message.is_empty()),
        })
    }

    async fn force_remove(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        let path = format!("/containers/{}?force=true", id);
        let (status, bytes) = self
            .bounded("container remove", self.request(Method::DELETE, &path, None))
            .await?;

        match status {
            s if s.is_success() => Ok(()),
            // Gone already, or AutoRemove is deleting it.
            StatusCode::NOT_FOUND | StatusCode::CONFLICT => {
                debug!(container_id = %id, status = %status, "Container already gone");
                Ok(())
            }
            _ => Err(api_error(status, &bytes)),
        }
    }
}

fn env_list(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{k}={v}")).collect()
}

fn api_error(status: StatusCode, body: &[u8]) -> RuntimeError {
    let message = serde_json::from_slice::<EngineMessage>(body)
        .map(|m| m.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string());
    RuntimeError::Api {
        status: status.as_u16(),
        message,
    }
}

/// First `error` reported in a newline-delimited JSON progress stream.
fn stream_error(body: &[u8]) -> Option<String> {
    String::from_utf8_lossy(body)
        .lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .find_map(|value| value.get("error").and_then(|e| e.as_str()).map(str::to_string))
}

/// Split an image reference into the `fromImage` and `tag` pull parameters.
///
/// Without a tag the engine would pull every tag, so `latest` is implied.
/// Digest references are passed through whole.
fn split_image_ref(image: &str) -> (&str, Option<&str>) {
    if image.contains('@') {
        return (image, None);
    }

    let last_segment_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[last_segment_start..].rfind(':') {
        Some(colon) => {
            let colon = last_segment_start + colon;
            (&image[..colon], Some(&image[colon + 1..]))
        }
        None => (image, Some("latest")),
    }
}

async fn bounded_by<T>(
    limit: Duration,
    operation: &'static str,
    fut: impl Future<Output = Result<T, RuntimeError>>,
) -> Result<T, RuntimeError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| RuntimeError::Timeout {
            operation,
            elapsed: limit,
        })?
}
