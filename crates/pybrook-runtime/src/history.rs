//! The per-source-field history ring buffer (§3, §4.3): a bounded list in the broker's
//! KV space holding the last `K` values seen for one field on one source, where `K` is
//! the largest window any consumer declared for that field.
//!
//! A value is never shifted into the ring at the moment it is produced - only a strictly
//! *older* value can be, once something newer supersedes it. This is what keeps a
//! message's own value out of its own window (Invariant 4) regardless of whether the
//! push that produces it races ahead of, or lags behind, the read that consumes it: the
//! most recent value sits in a one-slot staging marker (`histlast:...`) tagged with its
//! seq, and `window` excludes that marker whenever its seq is not strictly before the
//! message being computed.

use std::sync::Arc;

use pybrook_broker::Broker;
use pybrook_core::FieldValue;
use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;

#[derive(Serialize, Deserialize)]
struct LastEntry {
    seq: u64,
    value: FieldValue,
}

pub struct HistoryStore {
    broker: Arc<dyn Broker>,
}

impl HistoryStore {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    fn last_key(source_id: &str, field_name: &str) -> String {
        format!("histlast:{source_id}:{field_name}")
    }

    fn ring_key(source_id: &str, field_name: &str) -> String {
        format!("hist:{source_id}:{field_name}")
    }

    /// Records `value` as the latest observation of `field_name` on `source_id` at
    /// `seq`, shifting whatever was previously the latest value into the ring (trimmed
    /// to `max_len`) now that it is no longer the newest. A no-op if `seq` is not
    /// strictly newer than what is already staged, so a redelivered or reclaimed entry
    /// cannot double-push the same value into the ring.
    pub async fn push(&self, field_name: &str, source_id: &str, seq: u64, value: &FieldValue, max_len: usize) -> Result<(), RuntimeError> {
        let last_key = Self::last_key(source_id, field_name);

        if let Some(raw) = self.broker.kv_get(&last_key).await? {
            let previous: LastEntry = serde_json::from_str(&raw)?;
            if previous.seq >= seq {
                return Ok(());
            }
            let ring_key = Self::ring_key(source_id, field_name);
            let encoded_previous = serde_json::to_string(&previous.value)?;
            self.broker.list_push_trim(&ring_key, &encoded_previous, max_len.max(1)).await?;
        }

        let encoded = serde_json::to_string(&LastEntry { seq, value: value.clone() })?;
        self.broker.kv_set(&last_key, &encoded).await?;
        Ok(())
    }

    /// Returns the oldest-first window of the last `k` values for `field_name`/
    /// `source_id` strictly preceding `before_seq`, left-padded with `None` when fewer
    /// than `k` qualifying values have been observed yet.
    pub async fn window(&self, field_name: &str, source_id: &str, before_seq: u64, k: usize) -> Result<Vec<Option<FieldValue>>, RuntimeError> {
        let last_key = Self::last_key(source_id, field_name);
        let last = match self.broker.kv_get(&last_key).await? {
            Some(raw) => Some(serde_json::from_str::<LastEntry>(&raw)?),
            None => None,
        };
        let last_qualifies = last.as_ref().is_some_and(|l| l.seq < before_seq);

        let ring_take = if last_qualifies { k.saturating_sub(1) } else { k };
        let ring_key = Self::ring_key(source_id, field_name);
        let raw_ring = self.broker.list_range(&ring_key, ring_take).await?;

        let mut values = Vec::with_capacity(raw_ring.len() + 1);
        for encoded in raw_ring.into_iter().rev() {
            values.push(Some(serde_json::from_str(&encoded)?));
        }
        if last_qualifies {
            values.push(Some(last.expect("checked above").value));
        }

        let missing = k.saturating_sub(values.len());
        let mut window = vec![None; missing];
        window.extend(values);
        Ok(window)
    }

    /// Current depth of the ring buffer for `field_name`/`source_id` - does not count
    /// the one staged "latest" value, which has not yet been shifted into the ring.
    pub async fn len(&self, field_name: &str, source_id: &str) -> Result<usize, RuntimeError> {
        let ring_key = Self::ring_key(source_id, field_name);
        Ok(self.broker.list_len(&ring_key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pybrook_broker::FakeBroker;
    use serde_json::json;

    #[tokio::test]
    async fn a_messages_own_value_never_appears_in_its_own_window() {
        let store = HistoryStore::new(Arc::new(FakeBroker::new()));
        store.push("speed", "car-1", 1, &json!(10), 5).await.unwrap();

        let window = store.window("speed", "car-1", 1, 1).await.unwrap();
        assert_eq!(window, vec![None]);
    }

    #[tokio::test]
    async fn pads_short_history_with_none() {
        let store = HistoryStore::new(Arc::new(FakeBroker::new()));
        store.push("speed", "car-1", 1, &json!(10), 5).await.unwrap();
        store.push("speed", "car-1", 2, &json!(20), 5).await.unwrap();

        let window = store.window("speed", "car-1", 3, 4).await.unwrap();
        assert_eq!(window, vec![None, None, Some(json!(10)), Some(json!(20))]);
    }

    #[tokio::test]
    async fn trims_to_max_len_and_orders_oldest_first() {
        let store = HistoryStore::new(Arc::new(FakeBroker::new()));
        for (seq, v) in [1, 2, 3, 4, 5].into_iter().enumerate() {
            store.push("speed", "car-1", (seq + 1) as u64, &json!(v), 3).await.unwrap();
        }

        let window = store.window("speed", "car-1", 6, 3).await.unwrap();
        assert_eq!(window, vec![Some(json!(3)), Some(json!(4)), Some(json!(5))]);
        assert_eq!(store.len("speed", "car-1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn a_push_racing_ahead_of_its_own_read_is_still_excluded() {
        // The splitter's write for seq 2 completes before the generator gets around to
        // reading seq 1's pre-message window; seq 1's own value must still not appear.
        let store = HistoryStore::new(Arc::new(FakeBroker::new()));
        store.push("speed", "car-1", 1, &json!(10), 5).await.unwrap();
        store.push("speed", "car-1", 2, &json!(20), 5).await.unwrap();

        let window = store.window("speed", "car-1", 1, 1).await.unwrap();
        assert_eq!(window, vec![None]);
    }

    #[tokio::test]
    async fn a_redelivered_push_for_the_same_seq_does_not_duplicate_the_ring() {
        let store = HistoryStore::new(Arc::new(FakeBroker::new()));
        store.push("speed", "car-1", 1, &json!(10), 5).await.unwrap();
        store.push("speed", "car-1", 2, &json!(20), 5).await.unwrap();
        // Redelivery of seq 2's input reprocesses the same message a second time.
        store.push("speed", "car-1", 2, &json!(20), 5).await.unwrap();

        let window = store.window("speed", "car-1", 3, 3).await.unwrap();
        assert_eq!(window, vec![None, Some(json!(10)), Some(json!(20))]);
    }
}
