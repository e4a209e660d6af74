//! Durable sandbox task queue tests against real PostgreSQL.
//!
//! Covers idempotent enqueue, dispatch-time attempt accounting, terminal
//! one-shot transitions, and the two-TTL lease reaper.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use uuid::Uuid;

use sibyl_core::sandbox::{CompletionReport, EnqueueRequest, SandboxDispatcher};
use sibyl_db::models::SandboxTaskStatus;
use sibyl_db::queries::sandboxes;
use sibyl_test_utils::{create_test_db, drop_test_db};

async fn sandbox_fixture(pool: &sqlx::PgPool) -> (Uuid, Uuid) {
    let org_id = Uuid::new_v4();
    let user_id = Uuid::new_v4();
    let sandbox = sandboxes::insert_sandbox(pool, org_id, user_id, &serde_json::json!({}))
        .await
        .expect("insert sandbox");
    (org_id, sandbox.id)
}

#[tokio::test]
async fn enqueue_is_idempotent_while_live() {
    let (pool, db_name) = create_test_db().await;
    let (org_id, sandbox_id) = sandbox_fixture(&pool).await;
    let dispatcher = SandboxDispatcher::new(pool.clone(), true, None);

    let mut req = EnqueueRequest::new(org_id, sandbox_id);
    req.idempotency_key = Some("run-tests".to_owned());

    let first = dispatcher.enqueue_task(req.clone()).await.unwrap();
    let second = dispatcher.enqueue_task(req.clone()).await.unwrap();
    assert_eq!(first.id, second.id);

    // Completing the task frees the key for a new row.
    dispatcher
        .complete_task(
            first.id,
            org_id,
            CompletionReport {
                success: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let third = dispatcher.enqueue_task(req).await.unwrap();
    assert_ne!(first.id, third.id);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn attempts_increment_only_at_dispatch() {
    let (pool, db_name) = create_test_db().await;
    let (org_id, sandbox_id) = sandbox_fixture(&pool).await;
    let dispatcher = SandboxDispatcher::new(pool.clone(), true, None);

    let task = dispatcher
        .enqueue_task(EnqueueRequest::new(org_id, sandbox_id))
        .await
        .unwrap();
    assert_eq!(task.attempt_count, 0);

    let dispatched = dispatcher
        .dispatch_pending_for_sandbox(sandbox_id, None, 20, |_message| async { true })
        .await
        .unwrap();
    assert_eq!(dispatched, 1);

    let acked = dispatcher.ack_task(task.id, org_id, None).await.unwrap();
    assert_eq!(acked.status, SandboxTaskStatus::Acked);
    assert_eq!(acked.attempt_count, 1);

    let completed = dispatcher
        .complete_task(
            task.id,
            org_id,
            CompletionReport {
                success: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    // Neither ack nor completion touched the counter.
    assert_eq!(completed.attempt_count, 1);
    assert_eq!(completed.status, SandboxTaskStatus::Completed);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn terminal_statuses_are_sinks() {
    let (pool, db_name) = create_test_db().await;
    let (org_id, sandbox_id) = sandbox_fixture(&pool).await;
    let dispatcher = SandboxDispatcher::new(pool.clone(), true, None);

    let task = dispatcher
        .enqueue_task(EnqueueRequest::new(org_id, sandbox_id))
        .await
        .unwrap();
    dispatcher
        .dispatch_pending_for_sandbox(sandbox_id, None, 20, |_m| async { true })
        .await
        .unwrap();
    dispatcher.ack_task(task.id, org_id, None).await.unwrap();

    let canceled = dispatcher
        .complete_task(
            task.id,
            org_id,
            CompletionReport {
                canceled: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(canceled.status, SandboxTaskStatus::Canceled);

    // A later "success" report cannot revive it.
    let after = dispatcher
        .complete_task(
            task.id,
            org_id,
            CompletionReport {
                success: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(after.status, SandboxTaskStatus::Canceled);

    // Nor can an ack.
    assert!(dispatcher.ack_task(task.id, org_id, None).await.is_err());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn dispatch_lease_scenario() {
    // S4: one task, max_attempts=2. Dispatch succeeds but the runner never
    // acks; the reaper requeues it. The second dispatch fails at send time
    // and terminally fails the task.
    let (pool, db_name) = create_test_db().await;
    let (org_id, sandbox_id) = sandbox_fixture(&pool).await;
    let dispatcher = SandboxDispatcher::new(pool.clone(), true, Some(2));

    let task = dispatcher
        .enqueue_task(EnqueueRequest::new(org_id, sandbox_id))
        .await
        .unwrap();

    let dispatched = dispatcher
        .dispatch_pending_for_sandbox(sandbox_id, None, 20, |_m| async { true })
        .await
        .unwrap();
    assert_eq!(dispatched, 1);

    // The lease expires (zero TTL stands in for the 300 s wait).
    let reaped = dispatcher
        .reap_stale_tasks(Duration::ZERO, Duration::from_secs(3600))
        .await
        .unwrap();
    assert_eq!(reaped, 1);

    let row = sibyl_db::queries::sandbox_tasks::get_task(&pool, task.id, org_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, SandboxTaskStatus::Retry);
    assert_eq!(row.attempt_count, 1);
    assert_eq!(row.error_message.as_deref(), Some("lease_expired_requeued"));

    // Second dispatch fails at send time; the attempt budget is spent.
    let dispatched = dispatcher
        .dispatch_pending_for_sandbox(sandbox_id, None, 20, |_m| async { false })
        .await
        .unwrap();
    assert_eq!(dispatched, 0);

    let row = sibyl_db::queries::sandbox_tasks::get_task(&pool, task.id, org_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, SandboxTaskStatus::Failed);
    assert_eq!(row.attempt_count, 2);
    assert_eq!(
        row.error_message.as_deref(),
        Some("dispatch_failed_max_attempts")
    );
    assert!(row.failed_at.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn reaper_honors_the_two_ttls() {
    // B4: a dispatched row uses the short TTL; an acked row needs the long
    // one to elapse.
    let (pool, db_name) = create_test_db().await;
    let (org_id, sandbox_id) = sandbox_fixture(&pool).await;
    let dispatcher = SandboxDispatcher::new(pool.clone(), true, None);

    let dispatched_task = dispatcher
        .enqueue_task(EnqueueRequest::new(org_id, sandbox_id))
        .await
        .unwrap();
    let acked_task = dispatcher
        .enqueue_task(EnqueueRequest::new(org_id, sandbox_id))
        .await
        .unwrap();

    dispatcher
        .dispatch_pending_for_sandbox(sandbox_id, None, 20, |_m| async { true })
        .await
        .unwrap();
    dispatcher.ack_task(acked_task.id, org_id, None).await.unwrap();

    // Short TTL elapsed, long TTL not: only the dispatched row is reaped.
    let reaped = dispatcher
        .reap_stale_tasks(Duration::ZERO, Duration::from_secs(3600))
        .await
        .unwrap();
    assert_eq!(reaped, 1);

    let acked_row = sibyl_db::queries::sandbox_tasks::get_task(&pool, acked_task.id, org_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(acked_row.status, SandboxTaskStatus::Acked);

    let dispatched_row =
        sibyl_db::queries::sandbox_tasks::get_task(&pool, dispatched_task.id, org_id)
            .await
            .unwrap()
            .unwrap();
    assert_eq!(dispatched_row.status, SandboxTaskStatus::Retry);

    // Long TTL elapsed too: now the acked row is reaped.
    let reaped = dispatcher
        .reap_stale_tasks(Duration::ZERO, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(reaped, 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn dispatch_order_is_created_at_asc() {
    let (pool, db_name) = create_test_db().await;
    let (org_id, sandbox_id) = sandbox_fixture(&pool).await;
    let dispatcher = SandboxDispatcher::new(pool.clone(), true, None);

    let mut ids = Vec::new();
    for i in 0..3 {
        let mut req = EnqueueRequest::new(org_id, sandbox_id);
        req.payload = serde_json::json!({"n": i});
        ids.push(dispatcher.enqueue_task(req).await.unwrap().id);
    }

    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_in_fn = std::sync::Arc::clone(&seen);
    dispatcher
        .dispatch_pending_for_sandbox(sandbox_id, None, 20, move |message| {
            let seen = std::sync::Arc::clone(&seen_in_fn);
            async move {
                let task_id = message
                    .get("task_id")
                    .and_then(serde_json::Value::as_str)
                    .unwrap()
                    .to_owned();
                seen.lock().unwrap().push(task_id);
                true
            }
        })
        .await
        .unwrap();

    let seen = seen.lock().unwrap().clone();
    let expected: Vec<String> = ids.iter().map(Uuid::to_string).collect();
    assert_eq!(seen, expected);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn fail_all_pending_drains_the_tenant_only() {
    let (pool, db_name) = create_test_db().await;
    let (org_a, sandbox_a) = sandbox_fixture(&pool).await;
    let (org_b, sandbox_b) = sandbox_fixture(&pool).await;
    let dispatcher = SandboxDispatcher::new(pool.clone(), true, None);

    let task_a = dispatcher
        .enqueue_task(EnqueueRequest::new(org_a, sandbox_a))
        .await
        .unwrap();
    let task_b = dispatcher
        .enqueue_task(EnqueueRequest::new(org_b, sandbox_b))
        .await
        .unwrap();

    let drained = dispatcher.fail_all_pending(org_a).await.unwrap();
    assert_eq!(drained, 1);

    let row_a = sibyl_db::queries::sandbox_tasks::get_task(&pool, task_a.id, org_a)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row_a.status, SandboxTaskStatus::Failed);
    assert_eq!(row_a.error_message.as_deref(), Some("admin_rollback"));

    // The other tenant's queue is untouched.
    let row_b = sibyl_db::queries::sandbox_tasks::get_task(&pool, task_b.id, org_b)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row_b.status, SandboxTaskStatus::Queued);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn disabled_dispatcher_fails_cleanly() {
    let (pool, db_name) = create_test_db().await;
    let (org_id, sandbox_id) = sandbox_fixture(&pool).await;
    let dispatcher = SandboxDispatcher::new(pool.clone(), false, None);

    assert!(dispatcher
        .enqueue_task(EnqueueRequest::new(org_id, sandbox_id))
        .await
        .is_err());

    static CALLS: AtomicUsize = AtomicUsize::new(0);
    let result = dispatcher
        .dispatch_pending_for_sandbox(sandbox_id, None, 20, |_m| async {
            CALLS.fetch_add(1, Ordering::SeqCst);
            true
        })
        .await;
    assert!(result.is_err());
    assert_eq!(CALLS.load(Ordering::SeqCst), 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}
