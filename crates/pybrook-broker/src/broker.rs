//! The broker adapter contract (C1, §4.1): a thin contract over an append-only stream
//! bus plus a KV store. Every broker I/O call is a suspension point (§5).

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::BrokerError;

/// One entry read back from a stream: its broker-assigned id plus the field map it was
/// appended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub stream: String,
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// A receiver for a pub/sub subscription. Each broker implementation hands back a
/// `Subscription` backed by whatever channel primitive fits its transport; callers only
/// ever call [`Subscription::recv`].
pub struct Subscription {
    rx: tokio::sync::mpsc::Receiver<String>,
}

impl Subscription {
    pub fn new(rx: tokio::sync::mpsc::Receiver<String>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// The broker adapter trait (C1). Implementations must guarantee that messages
/// unacknowledged after a process crash are redelivered to some consumer in the same
/// group, and that consumer-group creation is idempotent.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Appends `fields` to `stream`, returning the broker-assigned entry id.
    async fn xadd(&self, stream: &str, fields: &[(&str, String)]) -> Result<String, BrokerError>;

    /// Creates `group` on `stream` if it does not already exist (idempotent).
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BrokerError>;

    /// Reads up to `count` new entries for `consumer` in `group`, blocking up to
    /// `block_ms` milliseconds if none are immediately available.
    async fn xreadgroup(
        &self,
        group: &str,
        consumer: &str,
        streams: &[&str],
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, BrokerError>;

    /// Acknowledges `id` on `stream` for `group`.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError>;

    /// Claims entries on `stream`/`group` idle for at least `min_idle_ms`, reassigning
    /// them to `consumer`. Used to recover work left pending by a crashed worker.
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
    ) -> Result<Vec<StreamEntry>, BrokerError>;

    /// Atomically increments the integer at `key` by one, returning the new value.
    async fn kv_incr(&self, key: &str) -> Result<i64, BrokerError>;

    async fn kv_get(&self, key: &str) -> Result<Option<String>, BrokerError>;

    async fn kv_set(&self, key: &str, value: &str) -> Result<(), BrokerError>;

    /// Sets the existence marker used for the splitter's idempotency check (§7.5),
    /// expiring after `ttl_secs`. Returns `true` if the key was newly set (i.e. this is
    /// the first time this idempotency key has been seen).
    async fn set_if_absent(&self, key: &str, ttl_secs: u64) -> Result<bool, BrokerError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), BrokerError>;

    /// Sets a TTL on `key` after which it (and, for a hash, all its fields) is no
    /// longer readable. Used to garbage-collect a generator or resolver's pending-join
    /// state when a dependency never arrives (§7.4: "pending state is garbage-collected
    /// after a TTL").
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), BrokerError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, BrokerError>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BrokerError>;

    /// Deletes the whole pending-state hash at `key`.
    async fn hdel_all(&self, key: &str) -> Result<(), BrokerError>;

    /// Atomically pushes `value` onto the head of the list at `key` and trims it to
    /// `max_len` entries (the bounded ring buffer used for history).
    async fn list_push_trim(&self, key: &str, value: &str, max_len: usize) -> Result<(), BrokerError>;

    /// Returns up to `count` most recent entries, most-recent-first.
    async fn list_range(&self, key: &str, count: usize) -> Result<Vec<String>, BrokerError>;

    async fn list_len(&self, key: &str) -> Result<usize, BrokerError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError>;
}
