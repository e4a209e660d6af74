//! Inter-agent message bus integration tests against real PostgreSQL.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use sibyl_core::bus::MemoryBus;
use sibyl_core::msgbus::MessageBus;
use sibyl_db::models::InterAgentMessageType;
use sibyl_test_utils::{create_test_db, drop_test_db};

fn bus_for(pool: &sqlx::PgPool, org: Uuid) -> MessageBus {
    MessageBus::new(pool.clone(), Arc::new(MemoryBus::new()), org)
}

#[tokio::test]
async fn respond_links_rows_and_stamps_original() {
    let (pool, db_name) = create_test_db().await;
    let org = Uuid::new_v4();
    let bus = bus_for(&pool, org);

    let query = bus
        .send(
            "agent_a",
            InterAgentMessageType::Query,
            "Need a decision",
            "Which fallback should I use?",
            sibyl_core::msgbus::SendOptions {
                to_agent_id: Some("agent_b".to_owned()),
                requires_response: true,
                priority: 5,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let response = bus
        .respond(query.id, "agent_b", "Use the cached value", None)
        .await
        .unwrap();

    assert_eq!(response.response_to_id, Some(query.id));
    assert_eq!(response.to_agent_id.as_deref(), Some("agent_a"));
    assert_eq!(response.subject, "Re: Need a decision");
    assert_eq!(response.priority, 5);

    // The original now carries responded_at.
    let conversation = bus.get_conversation("agent_a", "agent_b", 10).await.unwrap();
    assert_eq!(conversation.len(), 2);
    assert!(conversation[0].responded_at.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn blocking_query_sees_late_response() {
    let (pool, db_name) = create_test_db().await;
    let org = Uuid::new_v4();
    let bus = Arc::new(bus_for(&pool, org));

    // A responder that answers after ~700 ms, past the first poll.
    let responder = {
        let pool = pool.clone();
        let bus = Arc::new(bus_for(&pool, org));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(700)).await;
            let pending = bus.get_pending("agent_b").await.unwrap();
            let query = pending.first().expect("query should be pending");
            bus.respond(query.id, "agent_b", "here you go", None)
                .await
                .unwrap();
        })
    };

    let response = bus
        .query(
            "agent_a",
            "agent_b",
            "Blocking ask",
            "Please answer",
            Duration::from_secs(10),
        )
        .await
        .unwrap();

    responder.await.unwrap();
    let response = response.expect("should receive a response before the deadline");
    assert_eq!(response.content, "here you go");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn blocking_query_times_out_to_none() {
    let (pool, db_name) = create_test_db().await;
    let org = Uuid::new_v4();
    let bus = bus_for(&pool, org);

    let response = bus
        .query(
            "agent_a",
            "agent_b",
            "Anyone there?",
            "…",
            Duration::from_millis(600),
        )
        .await
        .unwrap();
    assert!(response.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn pending_orders_by_priority_and_read_clears() {
    let (pool, db_name) = create_test_db().await;
    let org = Uuid::new_v4();
    let bus = bus_for(&pool, org);

    bus.send_progress("agent_a", "half way", Some(50), Some("agent_b".to_owned()))
        .await
        .unwrap();
    bus.send(
        "agent_a",
        InterAgentMessageType::Blocker,
        "Stuck on migration",
        "The schema lock is held",
        sibyl_core::msgbus::SendOptions {
            to_agent_id: Some("agent_b".to_owned()),
            priority: 7,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let pending = bus.get_pending("agent_b").await.unwrap();
    assert_eq!(pending.len(), 2);
    // Blocker (priority 7) first.
    assert_eq!(pending[0].message_type, InterAgentMessageType::Blocker);

    assert!(bus.mark_read(pending[0].id).await.unwrap());
    // Second read is a no-op.
    assert!(!bus.mark_read(pending[0].id).await.unwrap());

    let pending = bus.get_pending("agent_b").await.unwrap();
    assert_eq!(pending.len(), 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn org_isolation_between_buses() {
    let (pool, db_name) = create_test_db().await;
    let org_a = Uuid::new_v4();
    let org_b = Uuid::new_v4();
    let bus_a = bus_for(&pool, org_a);
    let bus_b = bus_for(&pool, org_b);

    bus_a
        .send_blocker("agent_1", "blocked", "details", None)
        .await
        .unwrap();
    bus_a
        .send(
            "agent_1",
            InterAgentMessageType::Progress,
            "p",
            "c",
            sibyl_core::msgbus::SendOptions {
                to_agent_id: Some("agent_2".to_owned()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Org B sees none of org A's rows.
    assert!(bus_b.get_pending("agent_2").await.unwrap().is_empty());
    assert!(
        bus_b
            .get_conversation("agent_1", "agent_2", 10)
            .await
            .unwrap()
            .is_empty()
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}
