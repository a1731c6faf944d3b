//! The dead-letter queue (§7.4): a message that fails a non-retryable way - a decode
//! error, a user computation panic-equivalent - is appended here with enough context to
//! replay or inspect it by hand, instead of being silently dropped or retried forever.

use std::sync::Arc;

use chrono::Utc;
use pybrook_broker::Broker;
use tracing::warn;

use crate::error::RuntimeError;

pub struct DeadLetterQueue {
    broker: Arc<dyn Broker>,
}

impl DeadLetterQueue {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Appends a failure record to `dlq_stream`, naming the message id, the field or
    /// report that failed, the error that caused it, and the wall-clock time the
    /// failure was recorded (for triage, not for replay ordering).
    pub async fn record(
        &self,
        dlq_stream: &str,
        message_id: &str,
        failed_at: &str,
        error: &RuntimeError,
    ) -> Result<(), RuntimeError> {
        warn!(stream = dlq_stream, %message_id, failed_at, %error, "routing message to dead-letter queue");
        self.broker
            .xadd(
                dlq_stream,
                &[
                    ("_msg", message_id.to_string()),
                    ("_failed_at", failed_at.to_string()),
                    ("_error", error.to_string()),
                    ("_recorded_at", Utc::now().to_rfc3339()),
                ],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pybrook_broker::FakeBroker;

    #[tokio::test]
    async fn records_failure_context_on_the_dlq_stream() {
        let broker = Arc::new(FakeBroker::new());
        let dlq = DeadLetterQueue::new(broker.clone());
        let err = RuntimeError::UnknownTarget("speed".to_string());

        dlq.record("veh:_dlq", "car-1-7", "speed", &err).await.unwrap();

        broker.create_group("veh:_dlq", "inspect").await.unwrap();
        let entries = broker.xreadgroup("inspect", "c1", &["veh:_dlq"], 10, 0).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fields.get("_msg").unwrap(), "car-1-7");
        assert!(entries[0].fields.contains_key("_recorded_at"));
    }
}
