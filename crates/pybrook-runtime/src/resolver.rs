//! The output aggregator (C4): joins every required field for one output report and
//! assembles, appends, and publishes the finished record. Terminal - nothing downstream
//! depends on an output report's own stream. Message-ids complete and publish in
//! whatever order their dependencies happen to arrive in; there is no ordering
//! guarantee across message-ids (§4.4).

use std::collections::HashMap;
use std::sync::Arc;

use pybrook_broker::{Broker, StreamEntry};
use pybrook_core::{Engine, FieldValue, MessageId};
use tracing::warn;

use crate::dlq::DeadLetterQueue;
use crate::error::RuntimeError;
use crate::pending::PendingJoin;

pub struct OutputAggregator {
    broker: Arc<dyn Broker>,
    engine: Arc<Engine>,
    report_name: String,
    consumer: String,
    pending: PendingJoin,
    dlq: DeadLetterQueue,
}

impl OutputAggregator {
    pub fn new(broker: Arc<dyn Broker>, engine: Arc<Engine>, report_name: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            pending: PendingJoin::new(broker.clone()),
            dlq: DeadLetterQueue::new(broker.clone()),
            broker,
            engine,
            report_name: report_name.into(),
            consumer: consumer.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.report_name
    }

    fn report(&self) -> &pybrook_core::OutputReportDef {
        self.engine
            .output_report(&self.report_name)
            .expect("aggregator constructed for a report the engine does not know")
    }

    fn required_streams(&self) -> Vec<String> {
        self.report()
            .required_fields
            .iter()
            .map(|f| self.engine.stream_of(f).expect("compiled model guarantees known fields"))
            .collect()
    }

    /// Creates the consumer group on every required field's stream. Must be called
    /// once before the first `run_once`.
    pub async fn prepare(&self) -> Result<(), RuntimeError> {
        let group = self.report().consumer_group();
        for stream in self.required_streams() {
            self.broker.create_group(&stream, &group).await?;
        }
        Ok(())
    }

    pub async fn run_once(&self, count: usize, block_ms: u64) -> Result<usize, RuntimeError> {
        let report = self.report();
        let group = report.consumer_group();
        let streams = self.required_streams();
        let stream_refs: Vec<&str> = streams.iter().map(String::as_str).collect();

        let entries = self
            .broker
            .xreadgroup(&group, &self.consumer, &stream_refs, count, block_ms)
            .await?;

        let mut processed = 0;
        for entry in &entries {
            if let Err(e) = self.handle_entry(entry).await {
                warn!(report = %self.report_name, stream = %entry.stream, id = %entry.id, error = %e, "output aggregator failed on entry");
                let report = self.report();
                let rendered = entry.fields.get("_msg").cloned().unwrap_or_default();
                let _ = self.dlq.record(&format!("{}:_dlq", report.name), &rendered, &report.name, &e).await;
            }
            self.broker.ack(&entry.stream, &group, &entry.id).await?;
            processed += 1;
        }
        Ok(processed)
    }

    /// Claims and reprocesses entries left pending by a worker that crashed before
    /// acking, i.e. idle for at least `min_idle_ms`, across every required-field stream.
    pub async fn reclaim(&self, min_idle_ms: u64) -> Result<usize, RuntimeError> {
        let group = self.report().consumer_group();
        let mut processed = 0;
        for stream in self.required_streams() {
            let entries = self.broker.claim_stale(&stream, &group, &self.consumer, min_idle_ms).await?;
            for entry in &entries {
                if let Err(e) = self.handle_entry(entry).await {
                    warn!(report = %self.report_name, stream = %entry.stream, id = %entry.id, error = %e, "output aggregator failed on reclaimed entry");
                    let report = self.report();
                    let rendered = entry.fields.get("_msg").cloned().unwrap_or_default();
                    let _ = self.dlq.record(&format!("{}:_dlq", report.name), &rendered, &report.name, &e).await;
                }
                self.broker.ack(&entry.stream, &group, &entry.id).await?;
                processed += 1;
            }
        }
        Ok(processed)
    }

    async fn handle_entry(&self, entry: &StreamEntry) -> Result<(), RuntimeError> {
        let field_name = stream_to_field_name(&entry.stream);
        let raw_msg = entry
            .fields
            .get("_msg")
            .ok_or_else(|| RuntimeError::MissingField {
                stream: entry.stream.clone(),
                field: "_msg".to_string(),
            })?;
        let message_id = MessageId::parse(raw_msg, self.engine.sep)
            .ok_or_else(|| RuntimeError::MalformedMessageId(raw_msg.clone()))?;
        let raw_value = entry.fields.get("value").ok_or_else(|| RuntimeError::MissingField {
            stream: entry.stream.clone(),
            field: "value".to_string(),
        })?;
        let value: FieldValue = serde_json::from_str(raw_value)?;

        let report = self.report();
        let joined = self
            .pending
            .record(&report.consumer_group(), raw_msg, &field_name, &value, &report.required_fields)
            .await?;

        let Some(fields) = joined else {
            return Ok(());
        };

        self.publish(&message_id, raw_msg, fields).await
    }

    async fn publish(&self, message_id: &MessageId, rendered_id: &str, fields: HashMap<String, FieldValue>) -> Result<(), RuntimeError> {
        let report = self.report();
        let mut record = serde_json::Map::with_capacity(fields.len() + 2);
        for (k, v) in fields {
            record.insert(k, v);
        }
        record.insert("_msg".to_string(), FieldValue::String(rendered_id.to_string()));
        record.insert("_source".to_string(), FieldValue::String(message_id.source_id.clone()));

        let payload = serde_json::to_string(&FieldValue::Object(record))?;
        self.broker
            .xadd(report.output_stream(), &[("_msg", rendered_id.to_string()), ("record", payload.clone())])
            .await?;
        self.broker.publish(report.output_stream(), &payload).await?;
        Ok(())
    }
}

fn stream_to_field_name(stream: &str) -> String {
    stream.rsplit(':').next().unwrap_or(stream).to_string()
}
