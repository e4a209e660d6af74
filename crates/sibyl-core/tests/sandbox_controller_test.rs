//! Sandbox controller lifecycle and reconcile tests against real
//! PostgreSQL, with the in-process pod runtime standing in for the
//! cluster.

use std::sync::Arc;

use uuid::Uuid;

use sibyl_core::sandbox::{
    MemoryPodRuntime, PodPhase, PodRuntime, SandboxConfig, SandboxController,
};
use sibyl_db::models::SandboxStatus;
use sibyl_test_utils::{create_test_db, drop_test_db};

fn controller(
    pool: &sqlx::PgPool,
    runtime: Option<Arc<MemoryPodRuntime>>,
    enabled: bool,
    k8s_required: bool,
) -> SandboxController {
    SandboxController::new(
        pool.clone(),
        runtime.map(|r| r as Arc<dyn sibyl_core::sandbox::PodRuntime>),
        SandboxConfig {
            enabled,
            k8s_required,
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn disabled_controller_rejects_mutations() {
    let (pool, db_name) = create_test_db().await;
    let ctl = controller(&pool, Some(Arc::new(MemoryPodRuntime::new())), false, false);

    let result = ctl.ensure(Uuid::new_v4(), Uuid::new_v4(), None).await;
    assert!(result.is_err());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn create_provisions_pod_and_runs() {
    let (pool, db_name) = create_test_db().await;
    let runtime = Arc::new(MemoryPodRuntime::new());
    let ctl = controller(&pool, Some(Arc::clone(&runtime)), true, false);

    let sandbox = ctl.create(Uuid::new_v4(), Uuid::new_v4(), None).await.unwrap();
    assert_eq!(sandbox.status, SandboxStatus::Running);
    assert!(sandbox.pod_name.is_some());
    assert_eq!(runtime.pod_count(), 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn create_without_runtime_degrades_to_error() {
    let (pool, db_name) = create_test_db().await;
    let ctl = controller(&pool, None, true, false);

    let sandbox = ctl.create(Uuid::new_v4(), Uuid::new_v4(), None).await.unwrap();
    assert_eq!(sandbox.status, SandboxStatus::Error);
    assert!(sandbox.last_error.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn ensure_reuses_then_resumes_then_creates() {
    let (pool, db_name) = create_test_db().await;
    let runtime = Arc::new(MemoryPodRuntime::new());
    let ctl = controller(&pool, Some(Arc::clone(&runtime)), true, false);
    let org = Uuid::new_v4();
    let user = Uuid::new_v4();

    // First ensure creates.
    let first = ctl.ensure(org, user, None).await.unwrap();
    // Second ensure reuses the same row.
    let second = ctl.ensure(org, user, None).await.unwrap();
    assert_eq!(first.id, second.id);

    // Suspended sandboxes are resumed, not recreated.
    ctl.suspend(first.id, org).await.unwrap();
    let resumed = ctl.ensure(org, user, None).await.unwrap();
    assert_eq!(resumed.id, first.id);
    assert_eq!(resumed.status, SandboxStatus::Running);

    // A destroyed sandbox is terminal; ensure makes a new one.
    ctl.destroy(first.id, org).await.unwrap();
    let fresh = ctl.ensure(org, user, None).await.unwrap();
    assert_ne!(fresh.id, first.id);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn reconcile_realigns_status_from_pod_phase() {
    let (pool, db_name) = create_test_db().await;
    let runtime = Arc::new(MemoryPodRuntime::new());
    let ctl = controller(&pool, Some(Arc::clone(&runtime)), true, false);
    let org = Uuid::new_v4();

    let sandbox = ctl.create(org, Uuid::new_v4(), None).await.unwrap();
    let pod_name = sandbox.pod_name.clone().unwrap();

    // The pod fails out of band; the reconcile pass must notice.
    runtime.set_phase("default", &pod_name, PodPhase::Failed);
    let realigned = ctl.reconcile_once().await.unwrap();
    assert_eq!(realigned, 1);

    let row = sibyl_db::queries::sandboxes::get_sandbox(&pool, sandbox.id, org)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, SandboxStatus::Error);

    // The pod comes back; status follows.
    runtime.set_phase("default", &pod_name, PodPhase::Running);
    let realigned = ctl.reconcile_once().await.unwrap();
    assert_eq!(realigned, 1);
    let row = sibyl_db::queries::sandboxes::get_sandbox(&pool, sandbox.id, org)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, SandboxStatus::Running);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn reconcile_flags_missing_pod_in_active_state() {
    let (pool, db_name) = create_test_db().await;
    let runtime = Arc::new(MemoryPodRuntime::new());
    let ctl = controller(&pool, Some(Arc::clone(&runtime)), true, false);
    let org = Uuid::new_v4();

    let sandbox = ctl.create(org, Uuid::new_v4(), None).await.unwrap();
    let pod_name = sandbox.pod_name.clone().unwrap();

    // Someone deletes the pod behind our back.
    runtime.delete_pod("default", &pod_name).await.unwrap();
    ctl.reconcile_once().await.unwrap();

    let row = sibyl_db::queries::sandboxes::get_sandbox(&pool, sandbox.id, org)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, SandboxStatus::Error);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn runner_connection_toggles_ready() {
    let (pool, db_name) = create_test_db().await;
    let runtime = Arc::new(MemoryPodRuntime::new());
    let ctl = controller(&pool, Some(runtime), true, false);
    let org = Uuid::new_v4();

    let sandbox = ctl.create(org, Uuid::new_v4(), None).await.unwrap();

    let connected = ctl
        .sync_runner_connection(sandbox.id, org, Some(Uuid::new_v4()))
        .await
        .unwrap();
    assert_eq!(connected.status, SandboxStatus::Ready);

    let disconnected = ctl.sync_runner_connection(sandbox.id, org, None).await.unwrap();
    assert_eq!(disconnected.status, SandboxStatus::Running);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn logs_require_a_provisioned_pod() {
    let (pool, db_name) = create_test_db().await;
    let runtime = Arc::new(MemoryPodRuntime::new());
    let ctl = controller(&pool, Some(Arc::clone(&runtime)), true, false);
    let org = Uuid::new_v4();

    let sandbox = ctl.create(org, Uuid::new_v4(), None).await.unwrap();
    let pod_name = sandbox.pod_name.clone().unwrap();
    runtime.push_log("default", &pod_name, "booted");
    runtime.push_log("default", &pod_name, "ready");

    let logs = ctl.get_logs(sandbox.id, org, 200).await.unwrap();
    assert_eq!(logs, "booted\nready");

    // A controller with no runtime reports a specific failure.
    let blind = controller(&pool, None, true, false);
    assert!(blind.get_logs(sandbox.id, org, 200).await.is_err());

    pool.close().await;
    drop_test_db(&db_name).await;
}
