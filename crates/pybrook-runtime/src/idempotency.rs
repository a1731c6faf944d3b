//! The splitter's idempotency guard (§7.5): at-least-once delivery means the same
//! broker entry can be redelivered after a crash and re-ack, which would otherwise mint
//! a second `MessageId` for one physical report. Each (stream, entry id) pair is only
//! ever let through once, for `ttl_secs` - long enough to outlast the entry's own
//! consumer-group pending window.

use std::sync::Arc;

use pybrook_broker::Broker;

use crate::error::RuntimeError;

pub struct IdempotencyGuard {
    broker: Arc<dyn Broker>,
    ttl_secs: u64,
}

impl IdempotencyGuard {
    pub fn new(broker: Arc<dyn Broker>, ttl_secs: u64) -> Self {
        Self { broker, ttl_secs }
    }

    /// Returns `true` the first time this `(stream, entry_id)` pair is seen, `false` on
    /// every redelivery.
    pub async fn first_time(&self, stream: &str, entry_id: &str) -> Result<bool, RuntimeError> {
        let key = format!("seen:{stream}:{entry_id}");
        Ok(self.broker.set_if_absent(&key, self.ttl_secs).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pybrook_broker::FakeBroker;

    #[tokio::test]
    async fn redelivery_of_the_same_entry_is_suppressed() {
        let guard = IdempotencyGuard::new(Arc::new(FakeBroker::new()), 3600);
        assert!(guard.first_time("veh:report", "1-0").await.unwrap());
        assert!(!guard.first_time("veh:report", "1-0").await.unwrap());
        assert!(guard.first_time("veh:report", "2-0").await.unwrap());
    }
}
