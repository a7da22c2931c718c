//! rpool Runner Manager Library
//!
//! The runner manager keeps pools of ephemeral GitHub Actions runners at
//! their configured size. Each runner runs in its own Docker container,
//! registers itself, takes at most one job and exits; the manager notices
//! and launches a replacement.
//!
//! ## Architecture
//!
//! ```text
//! RunnerPool
//! ├── Reconciler          (launches each group's deficit, wakes on exits)
//! │   └── supervisor(id)  (removes an exited worker, wakes the reconciler)
//! ├── Worker(id)          (token -> container -> wait | terminate -> teardown)
//! ├── Registry            (authoritative id -> worker map)
//! └── ShutdownCoordinator (cancel, terminate all, drain)
//! ```
//!
//! ## Modules
//!
//! - `config`: YAML configuration and runner group specs
//! - `docker`: Docker Engine API container runtime
//! - `github`: GitHub Actions runner API client
//! - `mock`: In-memory runtime and platform for tests

pub mod config;
pub mod docker;
pub mod github;
pub mod id;
pub mod mock;
pub mod platform;
pub mod pool;
pub mod reconciler;
pub mod registry;
pub mod runtime;
pub mod shutdown;
pub mod worker;

// Re-export commonly used types
pub use config::{Config, GroupSpec};
pub use id::WorkerId;
pub use pool::RunnerPool;
pub use registry::Registry;
pub use worker::{ExitInfo, WorkerError, WorkerServices, WorkerState};
