//! An in-memory [`Broker`] used by worker-runtime tests. No network, no Redis instance:
//! streams, consumer-group cursors, the KV space, and pub/sub channels all live behind a
//! single mutex so tests can drive deterministic scenarios with `#[tokio::test]`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::broker::{Broker, StreamEntry, Subscription};
use crate::error::BrokerError;

#[derive(Default)]
struct StreamState {
    entries: Vec<(String, HashMap<String, String>)>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct GroupState {
    next_unread: usize,
    /// entry id -> consumer currently holding it
    pending: HashMap<String, String>,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, StreamState>,
    kv: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    subscribers: HashMap<String, Vec<tokio::sync::mpsc::Sender<String>>>,
    /// TTL deadlines set via `expire`/`set_if_absent`, checked lazily on read so a
    /// stuck pending-join hash or idempotency marker does not live forever.
    expirations: HashMap<String, Instant>,
}

impl Inner {
    /// Drops `key` from every map it could live in if its TTL has passed.
    fn purge_if_expired(&mut self, key: &str) {
        if let Some(&deadline) = self.expirations.get(key) {
            if Instant::now() >= deadline {
                self.kv.remove(key);
                self.hashes.remove(key);
                self.expirations.remove(key);
            }
        }
    }
}

/// In-memory stand-in for [`crate::redis_broker::RedisBroker`].
#[derive(Clone)]
pub struct FakeBroker {
    inner: Arc<Mutex<Inner>>,
    id_seq: Arc<AtomicU64>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            id_seq: Arc::new(AtomicU64::new(1)),
        }
    }

    fn next_id(&self) -> String {
        let n = self.id_seq.fetch_add(1, Ordering::SeqCst);
        format!("{n}-0")
    }
}

impl Default for FakeBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn xadd(&self, stream: &str, fields: &[(&str, String)]) -> Result<String, BrokerError> {
        let id = self.next_id();
        let mut inner = self.inner.lock().await;
        let map: HashMap<String, String> = fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        inner
            .streams
            .entry(stream.to_string())
            .or_default()
            .entries
            .push((id.clone(), map));
        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        let entries_len = inner.streams.entry(stream.to_string()).or_default().entries.len();
        let s = inner.streams.get_mut(stream).unwrap();
        s.groups.entry(group.to_string()).or_insert_with(|| GroupState {
            next_unread: entries_len,
            pending: HashMap::new(),
        });
        Ok(())
    }

    async fn xreadgroup(
        &self,
        group: &str,
        consumer: &str,
        streams: &[&str],
        count: usize,
        _block_ms: u64,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut inner = self.inner.lock().await;
        let mut out = Vec::new();
        for &stream in streams {
            let Some(state) = inner.streams.get_mut(stream) else {
                continue;
            };
            let Some(gs) = state.groups.get_mut(group) else {
                continue;
            };
            while gs.next_unread < state.entries.len() && out.len() < count {
                let (id, fields) = state.entries[gs.next_unread].clone();
                gs.next_unread += 1;
                gs.pending.insert(id.clone(), consumer.to_string());
                out.push(StreamEntry {
                    stream: stream.to_string(),
                    id,
                    fields,
                });
            }
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        if let Some(state) = inner.streams.get_mut(stream) {
            if let Some(gs) = state.groups.get_mut(group) {
                gs.pending.remove(id);
            }
        }
        Ok(())
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        _min_idle_ms: u64,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        // The fake has no clock-driven idle tracking: it reassigns every currently
        // pending entry to `consumer`, which is enough to exercise reclaim logic in
        // tests that simulate a crashed worker by dropping it without acking.
        let mut inner = self.inner.lock().await;
        let mut out = Vec::new();
        if let Some(state) = inner.streams.get_mut(stream) {
            let by_id: HashMap<String, HashMap<String, String>> = state.entries.iter().cloned().collect();
            if let Some(gs) = state.groups.get_mut(group) {
                let ids: Vec<String> = gs.pending.keys().cloned().collect();
                for id in ids {
                    gs.pending.insert(id.clone(), consumer.to_string());
                    if let Some(fields) = by_id.get(&id) {
                        out.push(StreamEntry {
                            stream: stream.to_string(),
                            id,
                            fields: fields.clone(),
                        });
                    }
                }
            }
        }
        Ok(out)
    }

    async fn kv_incr(&self, key: &str) -> Result<i64, BrokerError> {
        let mut inner = self.inner.lock().await;
        let entry = inner.kv.entry(key.to_string()).or_insert_with(|| "0".to_string());
        let next = entry.parse::<i64>().unwrap_or(0) + 1;
        *entry = next.to_string();
        Ok(next)
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut inner = self.inner.lock().await;
        inner.purge_if_expired(key);
        Ok(inner.kv.get(key).cloned())
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        inner.kv.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, ttl_secs: u64) -> Result<bool, BrokerError> {
        let mut inner = self.inner.lock().await;
        inner.purge_if_expired(key);
        if inner.kv.contains_key(key) {
            Ok(false)
        } else {
            inner.kv.insert(key.to_string(), "1".to_string());
            inner.expirations.insert(key.to_string(), Instant::now() + Duration::from_secs(ttl_secs));
            Ok(true)
        }
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        inner.expirations.insert(key.to_string(), Instant::now() + Duration::from_secs(ttl_secs));
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        inner.purge_if_expired(key);
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, BrokerError> {
        let mut inner = self.inner.lock().await;
        inner.purge_if_expired(key);
        Ok(inner.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BrokerError> {
        let mut inner = self.inner.lock().await;
        inner.purge_if_expired(key);
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hdel_all(&self, key: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        inner.hashes.remove(key);
        inner.expirations.remove(key);
        Ok(())
    }

    async fn list_push_trim(&self, key: &str, value: &str, max_len: usize) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        let list = inner.lists.entry(key.to_string()).or_default();
        list.push_front(value.to_string());
        while list.len() > max_len {
            list.pop_back();
        }
        Ok(())
    }

    async fn list_range(&self, key: &str, count: usize) -> Result<Vec<String>, BrokerError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .lists
            .get(key)
            .map(|l| l.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn list_len(&self, key: &str) -> Result<usize, BrokerError> {
        let inner = self.inner.lock().await;
        Ok(inner.lists.get(key).map(VecDeque::len).unwrap_or(0))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        if let Some(subs) = inner.subscribers.get_mut(channel) {
            let mut dead = HashSet::new();
            for (i, sub) in subs.iter().enumerate() {
                if sub.send(payload.to_string()).await.is_err() {
                    dead.insert(i);
                }
            }
            if !dead.is_empty() {
                let mut kept = Vec::new();
                for (i, sub) in subs.drain(..).enumerate() {
                    if !dead.contains(&i) {
                        kept.push(sub);
                    }
                }
                *subs = kept;
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        let (tx, rx) = tokio::sync::mpsc::channel(256);
        let mut inner = self.inner.lock().await;
        inner.subscribers.entry(channel.to_string()).or_default().push(tx);
        Ok(Subscription::new(rx))
    }
}
