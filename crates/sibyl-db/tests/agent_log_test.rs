//! Message-log integration tests: strict `message_num` monotonicity per
//! agent, across simulated resumes, against real PostgreSQL.

use serde_json::json;
use uuid::Uuid;

use sibyl_db::models::{AgentMessageKind, AgentMessageRole};
use sibyl_db::queries::agent_log::{self, NewAgentMessage};
use sibyl_test_utils::{create_test_db, drop_test_db};

fn row(org: Uuid, agent_id: &str, content: &str) -> NewAgentMessage {
    NewAgentMessage {
        organization_id: org,
        agent_id: agent_id.to_owned(),
        role: AgentMessageRole::Assistant,
        kind: AgentMessageKind::Text,
        content: content.to_owned(),
        extra: json!({}),
    }
}

#[tokio::test]
async fn message_num_continues_across_resume() {
    // S6: 7 messages, a termination, then 5 more on resume. The log must
    // read 1..=12 with no gaps or duplicates.
    let (pool, db_name) = create_test_db().await;
    let org = Uuid::new_v4();

    for i in 0..7 {
        agent_log::append_message(&pool, &row(org, "agent_1", &format!("first {i}")))
            .await
            .unwrap();
    }
    assert_eq!(agent_log::max_message_num(&pool, "agent_1").await.unwrap(), 7);

    // "Termination and resume": a fresh writer just keeps appending; the
    // allocation lives inside the insert.
    for i in 0..5 {
        agent_log::append_message(&pool, &row(org, "agent_1", &format!("second {i}")))
            .await
            .unwrap();
    }

    let messages = agent_log::list_for_agent(&pool, org, "agent_1", 100)
        .await
        .unwrap();
    let nums: Vec<i32> = messages.iter().map(|m| m.message_num).collect();
    assert_eq!(nums, (1..=12).collect::<Vec<i32>>());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn message_num_is_per_agent() {
    let (pool, db_name) = create_test_db().await;
    let org = Uuid::new_v4();

    agent_log::append_message(&pool, &row(org, "agent_a", "a1")).await.unwrap();
    agent_log::append_message(&pool, &row(org, "agent_b", "b1")).await.unwrap();
    agent_log::append_message(&pool, &row(org, "agent_a", "a2")).await.unwrap();

    assert_eq!(agent_log::max_message_num(&pool, "agent_a").await.unwrap(), 2);
    assert_eq!(agent_log::max_message_num(&pool, "agent_b").await.unwrap(), 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn empty_log_reads_zero() {
    let (pool, db_name) = create_test_db().await;
    assert_eq!(agent_log::max_message_num(&pool, "ghost").await.unwrap(), 0);
    pool.close().await;
    drop_test_db(&db_name).await;
}
