//! The field generator (C3): joins the current-dependency values of one artificial
//! field, reads its historical-dependency windows, invokes the user computation, and
//! publishes the result to the field's own sub-stream - becoming an input to any field
//! or output report that in turn depends on it. One generator instance serves one
//! artificial field; the worker runtime launches a consumer-group member per configured
//! concurrency.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use pybrook_broker::{Broker, StreamEntry};
use pybrook_core::{Engine, FieldContext, FieldValue, MessageId};
use tracing::warn;

use crate::dlq::DeadLetterQueue;
use crate::error::RuntimeError;
use crate::history::HistoryStore;
use crate::pending::PendingJoin;

/// How many user computations this generator instance will have in flight at once.
/// Bounds memory and downstream broker load while still letting a handful of slow
/// (e.g. cooperative/async) computations overlap instead of serializing a whole batch
/// behind the slowest one (§5: "off-load CPU-bound user computations to a bounded
/// worker pool").
const DEFAULT_COMPUTE_CONCURRENCY: usize = 16;

pub struct FieldGenerator {
    broker: Arc<dyn Broker>,
    engine: Arc<Engine>,
    field_name: String,
    consumer: String,
    pending: PendingJoin,
    history: HistoryStore,
    dlq: DeadLetterQueue,
    compute_concurrency: usize,
}

impl FieldGenerator {
    pub fn new(broker: Arc<dyn Broker>, engine: Arc<Engine>, field_name: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            pending: PendingJoin::new(broker.clone()),
            history: HistoryStore::new(broker.clone()),
            dlq: DeadLetterQueue::new(broker.clone()),
            broker,
            engine,
            field_name: field_name.into(),
            consumer: consumer.into(),
            compute_concurrency: DEFAULT_COMPUTE_CONCURRENCY,
        }
    }

    /// Overrides how many user computations this instance runs concurrently; the
    /// default suits I/O-light computations, but a field whose function calls out to
    /// another service may want a smaller pool to bound outstanding requests.
    pub fn with_compute_concurrency(mut self, concurrency: usize) -> Self {
        self.compute_concurrency = concurrency.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.field_name
    }

    fn field(&self) -> &pybrook_core::ArtificialFieldDef {
        self.engine
            .artificial_field(&self.field_name)
            .expect("generator constructed for a field the engine does not know")
    }

    fn current_dep_streams(&self) -> Vec<String> {
        self.field()
            .current_deps
            .iter()
            .map(|d| self.engine.stream_of(d).expect("compiled model guarantees known deps"))
            .collect()
    }

    /// Creates the consumer group on every current-dependency stream this field joins
    /// over. Must be called once before the first `run_once`.
    pub async fn prepare(&self) -> Result<(), RuntimeError> {
        let group = self.field().consumer_group();
        for stream in self.current_dep_streams() {
            self.broker.create_group(&stream, &group).await?;
        }
        Ok(())
    }

    pub async fn run_once(&self, count: usize, block_ms: u64) -> Result<usize, RuntimeError> {
        let field = self.field();
        let group = field.consumer_group();
        let streams = self.current_dep_streams();
        let stream_refs: Vec<&str> = streams.iter().map(String::as_str).collect();

        let entries = self
            .broker
            .xreadgroup(&group, &self.consumer, &stream_refs, count, block_ms)
            .await?;

        self.process_batch(&entries, &group).await
    }

    /// Claims and reprocesses entries left pending by a worker that crashed before
    /// acking, i.e. idle for at least `min_idle_ms`, across every current-dependency
    /// stream this field joins over.
    pub async fn reclaim(&self, min_idle_ms: u64) -> Result<usize, RuntimeError> {
        let group = self.field().consumer_group();
        let mut processed = 0;
        for stream in self.current_dep_streams() {
            let entries = self.broker.claim_stale(&stream, &group, &self.consumer, min_idle_ms).await?;
            processed += self.process_batch(&entries, &group).await?;
        }
        Ok(processed)
    }

    /// Runs `handle_entry` over a batch with at most `compute_concurrency` in flight at
    /// once, then acks each as it finishes, rather than serializing the whole batch
    /// behind whichever entry's computation is slowest.
    async fn process_batch(&self, entries: &[StreamEntry], group: &str) -> Result<usize, RuntimeError> {
        let results: Vec<Result<(), RuntimeError>> = stream::iter(entries.iter().map(|entry| async move {
            if let Err(e) = self.handle_entry(entry).await {
                warn!(field = %self.field_name, stream = %entry.stream, id = %entry.id, error = %e, "field generator failed on entry");
            }
            self.broker.ack(&entry.stream, group, &entry.id).await?;
            Ok(())
        }))
        .buffer_unordered(self.compute_concurrency)
        .collect()
        .await;

        let mut processed = 0;
        for result in results {
            result?;
            processed += 1;
        }
        Ok(processed)
    }

    async fn handle_entry(&self, entry: &StreamEntry) -> Result<(), RuntimeError> {
        let dep_field = self
            .engine
            .field(&stream_to_field_name(&entry.stream))
            .map(|f| f.name.clone())
            .ok_or_else(|| RuntimeError::UnknownTarget(entry.stream.clone()))?;

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

        let field = self.field();
        let namespace = field.consumer_group();
        let joined = self
            .pending
            .record(&namespace, raw_msg, &dep_field, &value, &field.current_deps)
            .await?;

        let Some(current) = joined else {
            return Ok(());
        };

        if let Err(e) = self.compute_and_publish(&message_id, raw_msg, &current).await {
            let report_like_dlq = format!("{}:_dlq", field.namespace);
            self.dlq.record(&report_like_dlq, raw_msg, &field.name, &e).await?;
        }
        Ok(())
    }

    async fn compute_and_publish(
        &self,
        message_id: &MessageId,
        rendered_id: &str,
        current: &HashMap<String, FieldValue>,
    ) -> Result<(), RuntimeError> {
        let field = self.field();

        let mut history = HashMap::with_capacity(field.hist_deps.len());
        for (dep, k) in &field.hist_deps {
            let window = self.history.window(dep, &message_id.source_id, message_id.seq, *k).await?;
            history.insert(dep.clone(), window);
        }

        let ctx = FieldContext {
            message_id,
            current,
            history: &history,
        };
        let result = field
            .compute
            .compute(&ctx)
            .await
            .map_err(|source| RuntimeError::Computation {
                field: field.name.clone(),
                source,
            })?;

        let encoded = serde_json::to_string(&result)?;
        self.broker
            .xadd(&field.stream_name(), &[("_msg", rendered_id.to_string()), ("value", encoded)])
            .await?;

        if let Some(window) = self.engine.max_history.get(&field.name) {
            self.history.push(&field.name, &message_id.source_id, message_id.seq, &result, *window).await?;
        }
        Ok(())
    }
}

/// Recovers the field name from a `<namespace>:<field>` sub-stream name. Field names
/// themselves never contain `:`, which `ModelBuilder::compile` does not currently
/// enforce but every constructor in this workspace upholds.
fn stream_to_field_name(stream: &str) -> String {
    stream.rsplit(':').next().unwrap_or(stream).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pybrook_broker::FakeBroker;
    use pybrook_core::{ArtificialFieldDef, ComputeFn, FieldDef, InputReportDef, ModelBuilder};
    use serde_json::json;

    struct Sum;
    #[async_trait::async_trait]
    impl ComputeFn for Sum {
        async fn compute(&self, ctx: &FieldContext<'_>) -> anyhow::Result<FieldValue> {
            let lat = ctx.current("lat").and_then(FieldValue::as_f64).unwrap_or(0.0);
            let lon = ctx.current("lon").and_then(FieldValue::as_f64).unwrap_or(0.0);
            Ok(json!(lat + lon))
        }
    }

    fn engine() -> Arc<Engine> {
        Arc::new(
            ModelBuilder::new()
                .input_report(InputReportDef {
                    name: "vehicle".to_string(),
                    id_field: "vehicle_id".to_string(),
                    fields: vec![
                        FieldDef::new("vehicle_id", "vehicle", "string"),
                        FieldDef::new("lat", "vehicle", "number"),
                        FieldDef::new("lon", "vehicle", "number"),
                    ],
                })
                .artificial_field(
                    ArtificialFieldDef::new("sum", "vehicle", Arc::new(Sum))
                        .depends_on_current("lat")
                        .depends_on_current("lon"),
                )
                .compile()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn waits_for_both_current_deps_before_computing() {
        let broker = Arc::new(FakeBroker::new());
        let engine = engine();
        let gen = FieldGenerator::new(broker.clone(), engine.clone(), "sum", "c1");
        gen.prepare().await.unwrap();

        broker
            .xadd("vehicle:lat", &[("_msg", "V1-1".to_string()), ("value", "1.0".to_string())])
            .await
            .unwrap();
        let n = gen.run_once(10, 0).await.unwrap();
        assert_eq!(n, 1);

        broker.create_group("vehicle:sum", "inspect").await.unwrap();
        let none_yet = broker.xreadgroup("inspect", "c1", &["vehicle:sum"], 10, 0).await.unwrap();
        assert!(none_yet.is_empty(), "sum should not publish until lon arrives too");

        broker
            .xadd("vehicle:lon", &[("_msg", "V1-1".to_string()), ("value", "2.0".to_string())])
            .await
            .unwrap();
        gen.run_once(10, 0).await.unwrap();

        let results = broker.xreadgroup("inspect", "c1", &["vehicle:sum"], 10, 0).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].fields.get("value").unwrap(), "3.0");
    }
}
