//! Redis-backed [`KvBus`].
//!
//! Point operations go through a shared `ConnectionManager` (auto
//! reconnecting, multiplexed). Blocking and stateful operations -- BLPOP,
//! SCAN, SUBSCRIBE -- each use a dedicated connection so they cannot
//! stall the multiplexed one.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{KvBus, Subscription};

/// Redis implementation of the bus contract.
pub struct RedisBus {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisBus {
    /// Connect to Redis at the given URL (e.g. `redis://127.0.0.1:6379/1`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("invalid redis URL {url}"))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .with_context(|| format!("failed to connect to redis at {url}"))?;
        Ok(Self { client, manager })
    }
}

#[async_trait]
impl KvBus for RedisBus {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await.context("redis GET failed")?;
        Ok(value)
    }

    async fn setex(&self, key: &str, ttl: Duration, value: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let secs = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, secs)
            .await
            .context("redis SETEX failed")?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key).await.context("redis DEL failed")?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        // SCAN holds cursor state, so it gets its own connection.
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("failed to open redis connection for SCAN")?;
        let pattern = format!("{prefix}*");
        let mut iter = conn
            .scan_match::<_, String>(&pattern)
            .await
            .context("redis SCAN failed")?;
        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .context("redis PUBLISH failed")?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("failed to open redis pubsub connection")?;
        pubsub
            .subscribe(channel)
            .await
            .with_context(|| format!("failed to subscribe to {channel}"))?;

        let channel = channel.to_owned();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let payload: String = match message.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "undecodable pubsub payload");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    // Subscriber dropped; tear down the connection.
                    break;
                }
            }
            debug!(channel = %channel, "pubsub forwarder exiting");
        });

        Ok(Subscription::new(rx))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, ()>(&mut conn)
            .await
            .context("redis PING failed")?;
        Ok(())
    }

    async fn rpush(&self, queue: &str, value: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.rpush::<_, _, ()>(queue, value)
            .await
            .context("redis RPUSH failed")?;
        Ok(())
    }

    async fn blpop(&self, queue: &str, timeout: Duration) -> Result<Option<String>> {
        // BLPOP blocks its connection, so it cannot share the manager.
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("failed to open redis connection for BLPOP")?;
        let secs = timeout.as_secs_f64().max(0.1);
        let result: Option<(String, String)> = conn
            .blpop(queue, secs)
            .await
            .context("redis BLPOP failed")?;
        Ok(result.map(|(_, value)| value))
    }
}
