//! Redis Streams implementation of the [`Broker`] trait.
//!
//! Consumer groups map to Redis consumer groups (`XGROUP`/`XREADGROUP`/`XACK`/
//! `XAUTOCLAIM`); the KV space maps to plain Redis keys, hashes, and lists (`INCR`,
//! `HSET`/`HGETALL`, `LPUSH`+`LTRIM`); pub/sub maps to Redis `PUBLISH`/`SUBSCRIBE`.

use std::collections::HashMap;

use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, warn};

use crate::broker::{Broker, StreamEntry, Subscription};
use crate::error::BrokerError;

/// A Redis-backed broker. Cheap to clone: [`ConnectionManager`] is itself a handle to a
/// multiplexed connection that reconnects transparently on transient failures.
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisBroker {
    /// Connects to `redis_url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(redis_url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn entry_from_reply(stream: &str, id: String, raw: HashMap<String, redis::Value>) -> StreamEntry {
    let mut fields = HashMap::with_capacity(raw.len());
    for (k, v) in raw {
        let s = match v {
            redis::Value::BulkString(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            redis::Value::SimpleString(s) => s,
            redis::Value::Int(i) => i.to_string(),
            other => format!("{other:?}"),
        };
        fields.insert(k, s);
    }
    StreamEntry {
        stream: stream.to_string(),
        id,
        fields,
    }
}

#[async_trait::async_trait]
impl Broker for RedisBroker {
    async fn xadd(&self, stream: &str, fields: &[(&str, String)]) -> Result<String, BrokerError> {
        let mut conn = self.conn();
        let items: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let id: String = conn.xadd(stream, "*", &items).await?;
        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let result: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "$").await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream, group, "consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn xreadgroup(
        &self,
        group: &str,
        consumer: &str,
        streams: &[&str],
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut conn = self.conn();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms as usize);
        let ids = vec![">"; streams.len()];
        let reply: StreamReadReply = conn.xread_options(streams, &ids, &opts).await?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                entries.push(entry_from_reply(&key.key, id.id, id.map));
            }
        }
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let _: i64 = conn.xack(stream, group, &[id]).await?;
        Ok(())
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut conn = self.conn();
        let reply: redis::streams::StreamAutoClaimReply = conn
            .xautoclaim(stream, group, consumer, min_idle_ms, "0-0")
            .await?;

        let entries = reply
            .claimed
            .into_iter()
            .map(|id| entry_from_reply(stream, id.id, id.map))
            .collect();
        Ok(entries)
    }

    async fn kv_incr(&self, key: &str) -> Result<i64, BrokerError> {
        let mut conn = self.conn();
        let v: i64 = conn.incr(key, 1).await?;
        Ok(v)
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.conn();
        let v: Option<String> = conn.get(key).await?;
        Ok(v)
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, ttl_secs: u64) -> Result<bool, BrokerError> {
        let mut conn = self.conn();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let _: bool = conn.expire(key, ttl_secs as i64).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.conn();
        let v: Option<String> = conn.hget(key, field).await?;
        Ok(v)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BrokerError> {
        let mut conn = self.conn();
        let v: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(v)
    }

    async fn hdel_all(&self, key: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn list_push_trim(&self, key: &str, value: &str, max_len: usize) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .atomic()
            .lpush(key, value)
            .ltrim(key, 0, max_len.saturating_sub(1) as isize)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn list_range(&self, key: &str, count: usize) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn();
        let v: Vec<String> = conn.lrange(key, 0, count.saturating_sub(1) as isize).await?;
        Ok(v)
    }

    async fn list_len(&self, key: &str) -> Result<usize, BrokerError> {
        let mut conn = self.conn();
        let v: usize = conn.llen(key).await?;
        Ok(v)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let _: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(256);
        let channel_owned = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, channel = %channel_owned, "dropping undecodable pub/sub payload");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });

        Ok(Subscription::new(rx))
    }
}
