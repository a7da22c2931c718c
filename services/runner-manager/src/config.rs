//! Configuration for the runner manager.
//!
//! Configuration comes from a YAML file, optionally overridden by
//! `DEFAULT_*` environment variables. Loading runs in four steps:
//! parse, apply environment overrides, validate, canonicalize. The result
//! is one immutable [`GroupSpec`] per runner group with every default
//! already resolved, plus the service-level settings.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rpool_reconcile::BackoffPolicy;
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info};

use crate::platform::Repository;

/// Image used when neither the group nor the defaults name one.
pub const DEFAULT_RUNNER_IMAGE: &str = "ghcr.io/actions/actions-runner";

/// Longest allowed group name. Names are embedded in runner and container
/// names next to a 26-character ULID.
pub const MAX_GROUP_NAME_LEN: usize = 20;

const DEFAULT_GITHUB_URL: &str = "https://github.com";
const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
const DEFAULT_TEARDOWN_TIMEOUT_SECS: u64 = 120;
const DEFAULT_BACKOFF_BASE_MILLIS: u64 = 1_000;
const DEFAULT_BACKOFF_MAX_MILLIS: u64 = 300_000;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot open config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("at least one runner group must be defined")]
    NoGroups,

    #[error("runner group name is required")]
    EmptyName,

    #[error("runner group name '{name}' exceeds maximum length of {max} characters")]
    NameTooLong { name: String, max: usize },

    #[error("runner group name '{name}' contains invalid characters. Only alphanumeric characters, hyphens, and underscores are allowed")]
    InvalidName { name: String },

    #[error("runner group name '{name}' is defined more than once")]
    DuplicateName { name: String },

    #[error("runner group count must be greater than 0 for runner group: {name}")]
    InvalidCount { name: String },

    #[error("neither defaultGithubOwner nor githubOwner is set for runner group: {name}")]
    MissingOwner { name: String },

    #[error("neither defaultGithubRepository nor githubRepository is set for runner group: {name}")]
    MissingRepository { name: String },

    #[error("neither defaultGithubToken nor githubToken is set for runner group: {name}")]
    MissingToken { name: String },
}

/// Config file as written by the operator.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    #[serde(default)]
    default_github_owner: String,
    #[serde(default)]
    default_github_repository: String,
    #[serde(default)]
    default_github_token: String,
    #[serde(default)]
    default_labels: Vec<String>,
    #[serde(default)]
    default_no_default_labels: bool,
    #[serde(default)]
    default_image: String,
    #[serde(default)]
    default_env_vars: BTreeMap<String, String>,
    #[serde(default)]
    runner_groups: Vec<RawGroup>,

    #[serde(default)]
    github_url: Option<String>,
    #[serde(default)]
    github_api_url: Option<String>,
    #[serde(default)]
    docker_socket: Option<PathBuf>,
    #[serde(default)]
    teardown_timeout_secs: Option<u64>,
    #[serde(default)]
    provisioning_backoff: Option<RawBackoff>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawGroup {
    #[serde(default)]
    name: String,
    #[serde(default)]
    count: i64,
    #[serde(default)]
    github_owner: String,
    #[serde(default)]
    github_repository: String,
    #[serde(default)]
    github_token: String,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    no_default_labels: Option<bool>,
    #[serde(default)]
    image: String,
    #[serde(default)]
    env_vars: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBackoff {
    #[serde(default = "default_backoff_base")]
    base_millis: u64,
    #[serde(default = "default_backoff_max")]
    max_millis: u64,
}

fn default_backoff_base() -> u64 {
    DEFAULT_BACKOFF_BASE_MILLIS
}

fn default_backoff_max() -> u64 {
    DEFAULT_BACKOFF_MAX_MILLIS
}

/// Fully resolved configuration of one runner group.
#[derive(Clone, PartialEq, Eq)]
pub struct GroupSpec {
    /// Unique group name.
    pub name: String,

    /// Desired number of live workers.
    pub count: u32,

    /// Repository the runners register against.
    pub repository: Repository,

    /// Runner labels.
    pub labels: Vec<String>,

    /// Skip GitHub's default `self-hosted`/OS/arch labels.
    pub no_default_labels: bool,

    /// Runner container image.
    pub image: String,

    /// Environment passed to the runner container.
    pub env_vars: BTreeMap<String, String>,
}

impl fmt::Debug for GroupSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupSpec")
            .field("name", &self.name)
            .field("count", &self.count)
            .field("repository", &self.repository)
            .field("labels", &self.labels)
            .field("no_default_labels", &self.no_default_labels)
            .field("image", &self.image)
            .field("env_vars", &self.env_vars.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Runner manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Runner groups in file order.
    pub groups: Vec<GroupSpec>,

    /// GitHub web URL runners register against.
    pub github_url: String,

    /// GitHub REST API URL.
    pub github_api_url: String,

    /// Docker daemon socket.
    pub docker_socket: PathBuf,

    /// Bound on a worker's teardown; `None` waits forever.
    pub teardown_timeout: Option<Duration>,

    /// Backoff applied to groups that keep failing to provision.
    pub backoff: BackoffPolicy,
}

impl Config {
    /// Load configuration from a YAML file, applying process environment
    /// overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_yaml(&contents, |key| std::env::var(key).ok())
    }

    /// Build configuration from YAML text, reading overrides through `env`.
    pub fn from_yaml<F>(contents: &str, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut raw: RawConfig = serde_yaml::from_str(contents)?;
        apply_env_overrides(&mut raw, env);
        validate(&raw)?;
        Ok(canonicalize(raw))
    }
}

fn apply_env_overrides<F>(raw: &mut RawConfig, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    let var = |key: &str| env(key).filter(|v| !v.is_empty());

    if let Some(owner) = var("DEFAULT_GITHUB_OWNER") {
        info!(value = %owner, "Override defaultGithubOwner with env");
        raw.default_github_owner = owner;
    }

    if let Some(repo) = var("DEFAULT_GITHUB_REPOSITORY") {
        info!(value = %repo, "Override defaultGithubRepository with env");
        raw.default_github_repository = repo;
    }

    if let Some(token) = var("DEFAULT_GITHUB_TOKEN") {
        info!(value = "[REDACTED]", "Override defaultGithubToken with env");
        raw.default_github_token = token;
    }

    if let Some(labels) = var("DEFAULT_LABELS") {
        let labels: Vec<String> = labels.split(',').map(|l| l.trim().to_string()).collect();
        info!(value = ?labels, "Override defaultLabels with env");
        raw.default_labels = labels;
    }

    if let Some(flag) = var("DEFAULT_NO_DEFAULT_LABELS") {
        match flag.as_str() {
            "true" | "1" => {
                info!(value = true, "Override defaultNoDefaultLabels with env");
                raw.default_no_default_labels = true;
            }
            "false" | "0" => {
                info!(value = false, "Override defaultNoDefaultLabels with env");
                raw.default_no_default_labels = false;
            }
            _ => {}
        }
    }

    if let Some(image) = var("DEFAULT_IMAGE") {
        info!(value = %image, "Override defaultImage with env");
        raw.default_image = image;
    }

    if let Some(env_vars) = var("DEFAULT_ENV_VARS") {
        match serde_json::from_str::<BTreeMap<String, String>>(&env_vars) {
            Ok(parsed) => {
                info!(value = "[REDACTED]", "Merge defaultEnvVars and env");
                raw.default_env_vars.extend(parsed);
            }
            Err(e) => {
                error!(error = %e, "Failed to parse DEFAULT_ENV_VARS. Skipping");
            }
        }
    }
}

fn is_valid_group_name(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn validate(raw: &RawConfig) -> Result<(), ConfigError> {
    if raw.runner_groups.is_empty() {
        return Err(ConfigError::NoGroups);
    }

    let mut seen = HashSet::new();
    for group in &raw.runner_groups {
        let name = group.name.clone();

        if name.is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if name.len() > MAX_GROUP_NAME_LEN {
            return Err(ConfigError::NameTooLong {
                name,
                max: MAX_GROUP_NAME_LEN,
            });
        }
        if !is_valid_group_name(&name) {
            return Err(ConfigError::InvalidName { name });
        }
        if !seen.insert(group.name.as_str()) {
            return Err(ConfigError::DuplicateName { name });
        }
        if group.count <= 0 || group.count > i64::from(u32::MAX) {
            return Err(ConfigError::InvalidCount { name });
        }
        if group.github_owner.is_empty() && raw.default_github_owner.is_empty() {
            return Err(ConfigError::MissingOwner { name });
        }
        if group.github_repository.is_empty() && raw.default_github_repository.is_empty() {
            return Err(ConfigError::MissingRepository { name });
        }
        if group.github_token.is_empty() && raw.default_github_token.is_empty() {
            return Err(ConfigError::MissingToken { name });
        }
    }

    Ok(())
}

fn or_default(value: String, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value
    }
}

/// Resolve defaults into each group. Assumes `validate` passed.
fn canonicalize(raw: RawConfig) -> Config {
    let default_image = or_default(raw.default_image, DEFAULT_RUNNER_IMAGE);

    let groups = raw
        .runner_groups
        .into_iter()
        .map(|group| {
            let mut env_vars = raw.default_env_vars.clone();
            env_vars.extend(group.env_vars);

            GroupSpec {
                count: group.count as u32,
                repository: Repository {
                    owner: or_default(group.github_owner, &raw.default_github_owner),
                    name: or_default(group.github_repository, &raw.default_github_repository),
                    token: or_default(group.github_token, &raw.default_github_token),
                },
                labels: if group.labels.is_empty() {
                    raw.default_labels.clone()
                } else {
                    group.labels
                },
                no_default_labels: group
                    .no_default_labels
                    .unwrap_or(raw.default_no_default_labels),
                image: or_default(group.image, &default_image),
                env_vars,
                name: group.name,
            }
        })
        .collect();

    let teardown_secs = raw
        .teardown_timeout_secs
        .unwrap_or(DEFAULT_TEARDOWN_TIMEOUT_SECS);
    let backoff = raw.provisioning_backoff.map_or_else(
        || BackoffPolicy {
            base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MILLIS),
            max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MILLIS),
            ..BackoffPolicy::default()
        },
        |b| BackoffPolicy {
            base: Duration::from_millis(b.base_millis),
            max: Duration::from_millis(b.max_millis),
            ..BackoffPolicy::default()
        },
    );

    Config {
        groups,
        github_url: raw
            .github_url
            .unwrap_or_else(|| DEFAULT_GITHUB_URL.to_string())
            .trim_end_matches('/')
            .to_string(),
        github_api_url: raw
            .github_api_url
            .unwrap_or_else(|| DEFAULT_GITHUB_API_URL.to_string()),
        docker_socket: raw
            .docker_socket
            .unwrap_or_else(|| PathBuf::from(crate::docker::DEFAULT_SOCKET)),
        teardown_timeout: (teardown_secs > 0).then(|| Duration::from_secs(teardown_secs)),
        backoff,
    }
}
