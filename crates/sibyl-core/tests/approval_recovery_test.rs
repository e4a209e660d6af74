//! Approval recovery integration tests: the durable rendezvous across a
//! simulated process crash.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use sibyl_core::approval::{ApprovalQueue, DEFAULT_EXPIRY};
use sibyl_core::bus::{KvBus, MemoryBus};
use sibyl_core::entity::graph::MemoryGraph;
use sibyl_core::entity::records::{
    AgentRecord, AgentType, ApprovalType, SpawnSource,
};
use sibyl_core::entity::store::EntityStore;

struct World {
    store: EntityStore,
    bus: Arc<dyn KvBus>,
}

async fn world() -> World {
    let store = EntityStore::new(Arc::new(MemoryGraph::new()), "org_1");
    store
        .create_sync(
            AgentRecord::new(
                "agent_1",
                "worker",
                "org_1",
                AgentType::Implementer,
                SpawnSource::User,
            )
            .into_entity(),
        )
        .await
        .unwrap();
    World {
        store,
        bus: Arc::new(MemoryBus::new()),
    }
}

/// An ApprovalQueue bound to the waiting agent's identity.
fn agent_queue(world: &World) -> ApprovalQueue {
    ApprovalQueue::new(
        world.store.clone(),
        Arc::clone(&world.bus),
        None,
        "proj_1",
        "agent_1",
        Some("task_1".to_owned()),
    )
}

/// An ApprovalQueue bound to the human-facing respond route. Its agent
/// context differs from the waiter's, so its pending-mirror cleanup
/// cannot touch the waiter's key -- exactly the crash-recovery topology.
fn responder_queue(world: &World) -> ApprovalQueue {
    ApprovalQueue::new(
        world.store.clone(),
        Arc::clone(&world.bus),
        None,
        "proj_1",
        "respond_route",
        None,
    )
}

#[tokio::test]
async fn crashed_waiter_reattaches_and_sees_response() {
    // S3: the agent enqueues approval A and starts waiting; the process
    // dies; a human responds while nothing is listening; a new worker
    // reattaches and must see the same payload.
    let world = world().await;
    let waiter = agent_queue(&world);

    let record = waiter
        .enqueue(
            ApprovalType::ToolUse,
            "Deploy to staging",
            "The agent wants to deploy",
            Map::new(),
            DEFAULT_EXPIRY,
        )
        .await
        .unwrap();

    // The waiter "crashes" here: no wait_for_response in flight, pending
    // mirror still present.
    assert_eq!(waiter.list_pending().await.unwrap().len(), 1);

    // Responder acts from its own context at t=30s.
    responder_queue(&world)
        .respond(&record.id, true, "ship it", "alice")
        .await
        .unwrap();

    // A new worker process reattaches at t=60s.
    let reattached = agent_queue(&world);
    let response = reattached
        .reattach_waiter(&record.id, Duration::from_secs(300))
        .await
        .unwrap()
        .expect("reattach should find the stored response");

    assert!(response.approved);
    assert_eq!(response.by, "alice");
    assert_eq!(response.message, "ship it");

    // Pending mirror is cleared by the reattach path.
    assert!(reattached.list_pending().await.unwrap().is_empty());

    // The graph record is terminal.
    let entity = world.store.get(&record.id).await.unwrap();
    assert_eq!(
        entity.metadata.get("status").and_then(Value::as_str),
        Some("approved")
    );
}

#[tokio::test]
async fn response_mirror_survives_missed_pubsub_event() {
    // P10: the responder writes the mirror before publishing; a waiter
    // that subscribes after the event still sees the payload.
    let world = world().await;
    let waiter = agent_queue(&world);

    let record = waiter
        .enqueue(ApprovalType::Question, "Q", "…", Map::new(), DEFAULT_EXPIRY)
        .await
        .unwrap();

    responder_queue(&world)
        .respond(&record.id, false, "not yet", "bob")
        .await
        .unwrap();

    // No subscription existed when the event fired; the wait must fall
    // back to the mirror immediately.
    let response = waiter
        .wait_for_response(&record.id, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(!response.approved);
    assert_eq!(response.by, "bob");
}

#[tokio::test]
async fn reattach_handles_expiry_during_downtime() {
    let world = world().await;
    let waiter = agent_queue(&world);

    // An approval that expires almost immediately.
    let record = waiter
        .enqueue(
            ApprovalType::Question,
            "Q",
            "…",
            Map::new(),
            Duration::from_millis(50),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;

    let response = waiter
        .reattach_waiter(&record.id, Duration::from_secs(300))
        .await
        .unwrap()
        .expect("expired approvals still produce a response");

    assert!(!response.approved);
    assert_eq!(response.by, "system");
    assert_eq!(response.message, "Expired during downtime");

    let entity = world.store.get(&record.id).await.unwrap();
    assert_eq!(
        entity.metadata.get("status").and_then(Value::as_str),
        Some("expired")
    );
}

#[tokio::test]
async fn expiry_timeout_shape_is_identical_local_and_recovered() {
    // B1 + §7: a local timeout and a post-restart discovery produce the
    // same synthetic denial shape.
    let world = world().await;
    let waiter = agent_queue(&world);

    let record = waiter
        .enqueue(ApprovalType::Question, "Q", "…", Map::new(), DEFAULT_EXPIRY)
        .await
        .unwrap();

    let local = waiter
        .wait_for_response(&record.id, Duration::from_millis(50))
        .await
        .unwrap();
    assert!(!local.approved);
    assert_eq!(local.by, "system");
    assert_eq!(local.message, "Approval request timed out");

    // After the timeout the record is expired and stays expired.
    let entity = world.store.get(&record.id).await.unwrap();
    assert_eq!(
        entity.metadata.get("status").and_then(Value::as_str),
        Some("expired")
    );
}
