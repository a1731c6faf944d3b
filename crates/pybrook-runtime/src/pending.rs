//! The pending-message join shared by the field generator (C3) and the output
//! aggregator (C4): both wait for a set of required fields to arrive for the same
//! message id before doing anything, and both park the partial state in the broker's
//! KV space between arrivals rather than in process memory, so any worker in the
//! consumer group can complete the join.

use std::collections::HashMap;
use std::sync::Arc;

use pybrook_broker::Broker;
use pybrook_core::FieldValue;

use crate::error::RuntimeError;

/// How long a partial join survives with no dependency ever completing it, e.g. because
/// a field generator's computation kept failing and landing in the DLQ instead of
/// publishing (§7.4). After this, the broker drops the pending hash on its own and the
/// join silently never fires - there is nothing left to garbage-collect.
const DEFAULT_PENDING_TTL_SECS: u64 = 6 * 3600;

pub struct PendingJoin {
    broker: Arc<dyn Broker>,
    ttl_secs: u64,
}

impl PendingJoin {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            ttl_secs: DEFAULT_PENDING_TTL_SECS,
        }
    }

    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    fn key(namespace: &str, message_id: &str) -> String {
        format!("pending:{namespace}:{message_id}")
    }

    /// Records that `field` arrived with `value` for `message_id`. Returns the full
    /// accumulated field map once every name in `required` has arrived (and clears the
    /// pending state), or `None` while the join is still incomplete.
    pub async fn record(
        &self,
        namespace: &str,
        message_id: &str,
        field: &str,
        value: &FieldValue,
        required: &[String],
    ) -> Result<Option<HashMap<String, FieldValue>>, RuntimeError> {
        let key = Self::key(namespace, message_id);
        let encoded = serde_json::to_string(value)?;
        self.broker.hset(&key, field, &encoded).await?;
        self.broker.expire(&key, self.ttl_secs).await?;

        let raw = self.broker.hgetall(&key).await?;
        if !required.iter().all(|f| raw.contains_key(f)) {
            return Ok(None);
        }

        let mut values = HashMap::with_capacity(raw.len());
        for (k, v) in raw {
            values.insert(k, serde_json::from_str(&v)?);
        }
        self.broker.hdel_all(&key).await?;
        Ok(Some(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pybrook_broker::FakeBroker;
    use serde_json::json;

    #[tokio::test]
    async fn fires_once_all_required_fields_arrived() {
        let join = PendingJoin::new(Arc::new(FakeBroker::new()));
        let required = vec!["lat".to_string(), "lon".to_string()];

        let partial = join.record("out:pos", "src-1", "lat", &json!(1.0), &required).await.unwrap();
        assert!(partial.is_none());

        let complete = join.record("out:pos", "src-1", "lon", &json!(2.0), &required).await.unwrap();
        let values = complete.expect("join should complete");
        assert_eq!(values.get("lat"), Some(&json!(1.0)));
        assert_eq!(values.get("lon"), Some(&json!(2.0)));
    }

    #[tokio::test]
    async fn pending_state_is_cleared_after_completion() {
        let join = PendingJoin::new(Arc::new(FakeBroker::new()));
        let required = vec!["a".to_string()];
        join.record("ns", "msg-1", "a", &json!(1), &required).await.unwrap().unwrap();

        // A second arrival for a field already satisfied starts a fresh pending entry
        // rather than re-completing a stale one.
        let again = join.record("ns", "msg-1", "b", &json!(2), &required).await.unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn a_join_that_never_completes_is_garbage_collected_after_its_ttl() {
        let broker = Arc::new(FakeBroker::new());
        let join = PendingJoin::new(broker.clone()).with_ttl_secs(0);
        let required = vec!["lat".to_string(), "lon".to_string()];

        let partial = join.record("out:pos", "src-1", "lat", &json!(1.0), &required).await.unwrap();
        assert!(partial.is_none());

        // `lon` never arrives; the broker itself should have expired the hash rather
        // than this join leaking forever.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let raw = broker.hgetall("pending:out:pos:src-1").await.unwrap();
        assert!(raw.is_empty(), "expired pending state must not still be readable");
    }
}
