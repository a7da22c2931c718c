//! Integration tests for the reconciliation flow.
//!
//! These tests drive a full pool against the mock collaborators:
//! 1. The reconciler launches each group's deficit
//! 2. Workers get a token, start a container and wait on it
//! 3. Exits are removed from the registry and replaced

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rpool_reconcile::BackoffPolicy;
use rpool_runner_manager::config::GroupSpec;
use rpool_runner_manager::mock::{MockPlatform, MockRuntime};
use rpool_runner_manager::platform::Repository;
use rpool_runner_manager::reconciler::ReconcilerConfig;
use rpool_runner_manager::runtime::ExitStatus;
use rpool_runner_manager::{RunnerPool, WorkerServices, WorkerState};

fn group(name: &str, count: u32) -> GroupSpec {
    GroupSpec {
        name: name.to_string(),
        count,
        repository: Repository {
            owner: "acme".to_string(),
            name: "widgets".to_string(),
            token: "ghp_test".to_string(),
        },
        labels: vec!["linux".to_string()],
        no_default_labels: false,
        image: "ghcr.io/actions/actions-runner".to_string(),
        env_vars: BTreeMap::new(),
    }
}

fn start_pool(
    groups: Vec<GroupSpec>,
    runtime: &Arc<MockRuntime>,
    platform: &Arc<MockPlatform>,
    backoff: BackoffPolicy,
) -> RunnerPool {
    let services = WorkerServices {
        runtime: runtime.clone(),
        platform: platform.clone(),
        github_url: "https://github.com".to_string(),
        teardown_timeout: Some(Duration::from_secs(5)),
    };
    RunnerPool::start(groups, services, ReconcilerConfig { backoff })
}

/// Poll `check` until it returns true or five seconds pass.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn running_names(pool: &RunnerPool, group: &str) -> Vec<String> {
    let mut names = Vec::new();
    for worker in pool.registry().workers().await {
        if worker.group().name == group && worker.state() == WorkerState::Running {
            names.push(worker.runner_name().to_string());
        }
    }
    names
}

#[tokio::test]
async fn test_exited_worker_is_replaced() {
    let runtime = Arc::new(MockRuntime::new());
    let platform = Arc::new(MockPlatform::new());
    let pool = start_pool(vec![group("build", 3)], &runtime, &platform, BackoffPolicy::disabled());

    eventually("3 running containers", || async { runtime.running().await == 3 }).await;
    eventually("3 running workers", || async {
        running_names(&pool, "build").await.len() == 3
    })
    .await;
    assert_eq!(pool.registry().count_by_group("build").await, 3);

    let victim = running_names(&pool, "build").await.remove(0);
    assert!(runtime.exit(&victim, ExitStatus::code(0)).await);

    eventually("a replacement container", || async { runtime.created().await.len() == 4 }).await;
    eventually("3 running containers again", || async { runtime.running().await == 3 }).await;

    assert_eq!(pool.registry().count_by_group("build").await, 3);
    assert!(!running_names(&pool, "build").await.contains(&victim));

    pool.shutdown().await;
}

#[tokio::test]
async fn test_failed_provisioning_is_retried() {
    let runtime = Arc::new(MockRuntime::new());
    let platform = Arc::new(MockPlatform::new());
    platform.fail_next_tokens(1);

    let pool = start_pool(vec![group("ci", 1)], &runtime, &platform, BackoffPolicy::disabled());

    eventually("a running container", || async { runtime.running().await == 1 }).await;
    assert_eq!(platform.token_requests(), 2);
    assert_eq!(runtime.created().await.len(), 1);
    assert_eq!(pool.registry().count_by_group("ci").await, 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_failed_start_is_retried_after_backoff() {
    let runtime = Arc::new(MockRuntime::new());
    let platform = Arc::new(MockPlatform::new());
    platform.fail_next_tokens(2);

    let backoff = BackoffPolicy {
        base: Duration::from_millis(100),
        max: Duration::from_secs(1),
        jitter: 0.0,
    };
    let started = Instant::now();
    let pool = start_pool(vec![group("ci", 1)], &runtime, &platform, backoff);

    eventually("a running container", || async { runtime.running().await == 1 }).await;

    // 100ms after the first failure, 200ms after the second.
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(platform.token_requests(), 3);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_failed_pass_backs_off_once() {
    let runtime = Arc::new(MockRuntime::new());
    let platform = Arc::new(MockPlatform::new());
    platform.fail_next_tokens(8);

    let backoff = BackoffPolicy {
        base: Duration::from_millis(100),
        max: Duration::from_secs(10),
        jitter: 0.0,
    };
    let started = Instant::now();
    let pool = start_pool(vec![group("build", 8)], &runtime, &platform, backoff);

    eventually("8 running containers", || async { runtime.running().await == 8 }).await;

    // Eight failures from one pass are one round: about `base`, not the cap.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(2), "recovery took {elapsed:?}");
    assert_eq!(platform.token_requests(), 16);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_groups_are_isolated() {
    let runtime = Arc::new(MockRuntime::new());
    let platform = Arc::new(MockPlatform::new());
    let pool = start_pool(
        vec![group("a", 1), group("b", 1)],
        &runtime,
        &platform,
        BackoffPolicy::disabled(),
    );

    eventually("both groups running", || async { runtime.running().await == 2 }).await;
    eventually("both workers running", || async {
        running_names(&pool, "a").await.len() == 1 && running_names(&pool, "b").await.len() == 1
    })
    .await;
    let b_worker = running_names(&pool, "b").await.remove(0);

    let a_worker = running_names(&pool, "a").await.remove(0);
    runtime.exit(&a_worker, ExitStatus::code(0)).await;

    eventually("group a replaced", || async { runtime.created().await.len() == 3 }).await;
    eventually("group a running again", || async { runtime.running().await == 2 }).await;

    let created = runtime.created().await;
    assert_eq!(created.iter().filter(|n| n.starts_with("runner-b-")).count(), 1);
    assert_eq!(created.iter().filter(|n| n.starts_with("runner-a-")).count(), 2);
    assert_eq!(running_names(&pool, "b").await, vec![b_worker]);
    assert_eq!(pool.registry().count_by_group("b").await, 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_runtime_error_is_replaced_without_backoff() {
    let runtime = Arc::new(MockRuntime::new());
    let platform = Arc::new(MockPlatform::new());
    let backoff = BackoffPolicy {
        base: Duration::from_secs(60),
        max: Duration::from_secs(60),
        jitter: 0.0,
    };
    let pool = start_pool(vec![group("build", 1)], &runtime, &platform, backoff);

    eventually("a running worker", || async {
        running_names(&pool, "build").await.len() == 1
    })
    .await;
    let name = running_names(&pool, "build").await.remove(0);

    let status = ExitStatus {
        status_code: 1,
        error: Some("runner crashed".to_string()),
    };
    runtime.exit(&name, status).await;

    eventually("a replacement container", || async { runtime.created().await.len() == 2 }).await;
    pool.shutdown().await;
}
