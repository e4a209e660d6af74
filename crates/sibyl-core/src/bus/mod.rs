//! The K/V + pub/sub bus contract.
//!
//! The production deployment talks to Redis ([`redis_impl::RedisBus`]);
//! tests and embedded runs use [`MemoryBus`]. The surface is the minimum
//! the core needs: GET/SETEX/DEL/SCAN for mirrors and sentinels,
//! PUBLISH/SUBSCRIBE for real-time events, and RPUSH/BLPOP for the job
//! queue.

pub mod redis_impl;

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

/// A live subscription to one channel. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::Receiver<String>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<String>) -> Self {
        Self { rx }
    }

    /// Next message on the channel, or `None` when the bus is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Minimum K/V + pub/sub surface the core requires.
#[async_trait]
pub trait KvBus: Send + Sync {
    /// GET. Expired keys read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// SETEX: set with a TTL.
    async fn setex(&self, key: &str, ttl: Duration, value: &str) -> Result<()>;

    /// DEL. Idempotent.
    async fn del(&self, key: &str) -> Result<()>;

    /// SCAN for keys with the given prefix.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// PUBLISH a payload to a channel. Fire-and-forget: no subscribers is
    /// not an error.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// SUBSCRIBE to a channel.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Liveness probe.
    async fn ping(&self) -> Result<()>;

    /// RPUSH onto a queue.
    async fn rpush(&self, queue: &str, value: &str) -> Result<()>;

    /// BLPOP with a deadline. `None` on timeout.
    async fn blpop(&self, queue: &str, timeout: Duration) -> Result<Option<String>>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn KvBus) {}
};

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Default)]
struct MemoryBusState {
    kv: HashMap<String, StoredValue>,
    channels: HashMap<String, broadcast::Sender<String>>,
    queues: HashMap<String, VecDeque<String>>,
}

/// In-process [`KvBus`] used by tests and embedded deployments.
///
/// TTLs are honored lazily: expired keys are filtered on read and pruned
/// opportunistically on write.
#[derive(Default)]
pub struct MemoryBus {
    state: Mutex<MemoryBusState>,
    queue_signal: tokio::sync::Notify,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel_sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut state = self.state.lock().expect("bus lock poisoned");
        state
            .channels
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

#[async_trait]
impl KvBus for MemoryBus {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut state = self.state.lock().expect("bus lock poisoned");
        if state.kv.get(key).is_some_and(StoredValue::is_expired) {
            state.kv.remove(key);
        }
        Ok(state.kv.get(key).map(|v| v.value.clone()))
    }

    async fn setex(&self, key: &str, ttl: Duration, value: &str) -> Result<()> {
        let mut state = self.state.lock().expect("bus lock poisoned");
        state.kv.retain(|_, v| !v.is_expired());
        state.kv.insert(
            key.to_owned(),
            StoredValue {
                value: value.to_owned(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().expect("bus lock poisoned");
        state.kv.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let state = self.state.lock().expect("bus lock poisoned");
        Ok(state
            .kv
            .iter()
            .filter(|(k, v)| k.starts_with(prefix) && !v.is_expired())
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let sender = self.channel_sender(channel);
        // No subscribers is fine; publish is fire-and-forget.
        let _ = sender.send(payload.to_owned());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut broadcast_rx = self.channel_sender(channel).subscribe();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(rx))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn rpush(&self, queue: &str, value: &str) -> Result<()> {
        {
            let mut state = self.state.lock().expect("bus lock poisoned");
            state
                .queues
                .entry(queue.to_owned())
                .or_default()
                .push_back(value.to_owned());
        }
        self.queue_signal.notify_waiters();
        Ok(())
    }

    async fn blpop(&self, queue: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().expect("bus lock poisoned");
                if let Some(q) = state.queues.get_mut(queue) {
                    if let Some(value) = q.pop_front() {
                        return Ok(Some(value));
                    }
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, self.queue_signal.notified()).await;
        }
    }
}
