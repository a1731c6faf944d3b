//! End-to-end coverage for the data-model properties the unit tests in each module don't
//! individually exercise: a field's own value never leaking into its own history window,
//! per-source isolation, self-history sequencing, DLQ routing on compute failure, crash
//! redelivery not duplicating a history push, and current-dependency cycle rejection.
//! Everything below runs against `FakeBroker`; no component here talks to a real broker.

use std::sync::Arc;

use async_trait::async_trait;
use pybrook_broker::{Broker, FakeBroker};
use pybrook_core::{
    ArtificialFieldDef, CompileError, ComputeFn, Engine, FieldContext, FieldDef, FieldValue,
    InputReportDef, ModelBuilder, OutputReportDef,
};
use pybrook_runtime::{FieldGenerator, HistoryStore, OutputAggregator, Splitter};
use serde_json::json;

async fn split_vehicle(broker: &Arc<FakeBroker>, splitter: &Splitter, source_id: &str, fields: &[(&str, String)]) {
    let mut record = vec![("vehicle_id", format!("\"{source_id}\""))];
    record.extend(fields.iter().map(|(k, v)| (*k, v.clone())));
    broker.xadd("vehicle", &record).await.unwrap();
    splitter.run_once(10, 0).await.unwrap();
}

struct Direction;
#[async_trait]
impl ComputeFn for Direction {
    async fn compute(&self, ctx: &FieldContext<'_>) -> anyhow::Result<FieldValue> {
        let lat = ctx.current("lat").and_then(FieldValue::as_f64).unwrap_or(0.0);
        let lon = ctx.current("lon").and_then(FieldValue::as_f64).unwrap_or(0.0);
        let prev_lat = ctx.history("lat").last().and_then(|v| v.as_ref()).and_then(FieldValue::as_f64);
        let prev_lon = ctx.history("lon").last().and_then(|v| v.as_ref()).and_then(FieldValue::as_f64);

        match (prev_lat, prev_lon) {
            (Some(plat), Some(plon)) => Ok(json!((lon - plon).atan2(lat - plat).to_degrees())),
            _ => Ok(FieldValue::Null),
        }
    }
}

fn direction_engine() -> Arc<Engine> {
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
                ArtificialFieldDef::new("direction", "vehicle", Arc::new(Direction))
                    .depends_on_current("lat")
                    .depends_on_current("lon")
                    .depends_on_history("lat", 1)
                    .depends_on_history("lon", 1),
            )
            .compile()
            .unwrap(),
    )
}

#[tokio::test]
async fn a_field_never_sees_its_own_value_in_its_own_history_window() {
    let broker = Arc::new(FakeBroker::new());
    let engine = direction_engine();
    let splitter = Splitter::new(broker.clone(), engine.clone(), "vehicle", "split-1");
    splitter.prepare().await.unwrap();
    let gen = FieldGenerator::new(broker.clone(), engine.clone(), "direction", "gen-1");
    gen.prepare().await.unwrap();

    // Current deps (lat, lon) land on the stream in that order within one split; reading
    // one entry at a time keeps the join deterministic instead of letting both land in the
    // same concurrently-processed batch.
    split_vehicle(&broker, &splitter, "V1", &[("lat", "1.0".to_string()), ("lon", "1.0".to_string())]).await;
    gen.run_once(1, 0).await.unwrap();
    gen.run_once(1, 0).await.unwrap();

    split_vehicle(&broker, &splitter, "V1", &[("lat", "1.0".to_string()), ("lon", "2.0".to_string())]).await;
    gen.run_once(1, 0).await.unwrap();
    gen.run_once(1, 0).await.unwrap();

    broker.create_group("vehicle:direction", "inspect").await.unwrap();
    let entries = broker.xreadgroup("inspect", "r1", &["vehicle:direction"], 10, 0).await.unwrap();
    assert_eq!(entries.len(), 2);

    let first: serde_json::Value = serde_json::from_str(entries[0].fields.get("value").unwrap()).unwrap();
    assert!(first.is_null(), "first message must see an empty history window, got {first:?}");

    let second: f64 = serde_json::from_str(entries[1].fields.get("value").unwrap()).unwrap();
    assert!((second - 90.0).abs() < 1e-9, "expected ~90 degrees, got {second}");
}

struct PrevSpeed;
#[async_trait]
impl ComputeFn for PrevSpeed {
    async fn compute(&self, ctx: &FieldContext<'_>) -> anyhow::Result<FieldValue> {
        let prev = ctx.history("speed").last().and_then(|v| v.clone());
        Ok(prev.unwrap_or(FieldValue::Null))
    }
}

fn prev_speed_engine() -> Arc<Engine> {
    Arc::new(
        ModelBuilder::new()
            .input_report(InputReportDef {
                name: "vehicle".to_string(),
                id_field: "vehicle_id".to_string(),
                fields: vec![
                    FieldDef::new("vehicle_id", "vehicle", "string"),
                    FieldDef::new("speed", "vehicle", "number"),
                ],
            })
            .artificial_field(
                ArtificialFieldDef::new("prev_speed", "vehicle", Arc::new(PrevSpeed))
                    .depends_on_current("speed")
                    .depends_on_history("speed", 1),
            )
            .compile()
            .unwrap(),
    )
}

#[tokio::test]
async fn two_sources_interleaved_keep_independent_history_and_sequence_numbers() {
    let broker = Arc::new(FakeBroker::new());
    let engine = prev_speed_engine();
    let splitter = Splitter::new(broker.clone(), engine.clone(), "vehicle", "split-1");
    splitter.prepare().await.unwrap();
    let gen = FieldGenerator::new(broker.clone(), engine.clone(), "prev_speed", "gen-1");
    gen.prepare().await.unwrap();

    for (source, speed) in [("V1", 10.0), ("V2", 100.0), ("V1", 20.0), ("V2", 200.0)] {
        split_vehicle(&broker, &splitter, source, &[("speed", speed.to_string())]).await;
        gen.run_once(10, 0).await.unwrap();
    }

    broker.create_group("vehicle:prev_speed", "inspect").await.unwrap();
    let entries = broker.xreadgroup("inspect", "r1", &["vehicle:prev_speed"], 10, 0).await.unwrap();
    assert_eq!(entries.len(), 4);

    let at = |msg: &str| -> serde_json::Value {
        let e = entries.iter().find(|e| e.fields.get("_msg").map(String::as_str) == Some(msg)).unwrap();
        serde_json::from_str(e.fields.get("value").unwrap()).unwrap()
    };
    assert!(at("V1-1").is_null());
    assert!(at("V2-1").is_null());
    assert_eq!(at("V1-2"), json!(10.0), "V1's own prior speed, never V2's");
    assert_eq!(at("V2-2"), json!(100.0), "V2's own prior speed, never V1's");

    broker.create_group("vehicle:_id", "inspect-id").await.unwrap();
    let id_entries = broker.xreadgroup("inspect-id", "r1", &["vehicle:_id"], 10, 0).await.unwrap();
    let seq_of = |msg: &str| -> String {
        id_entries
            .iter()
            .find(|e| e.fields.get("_msg").map(String::as_str) == Some(msg))
            .unwrap()
            .fields
            .get("seq")
            .unwrap()
            .clone()
    };
    assert_eq!(seq_of("V1-1"), "1");
    assert_eq!(seq_of("V2-1"), "1");
    assert_eq!(seq_of("V1-2"), "2");
    assert_eq!(seq_of("V2-2"), "2");
}

struct Counter;
#[async_trait]
impl ComputeFn for Counter {
    async fn compute(&self, ctx: &FieldContext<'_>) -> anyhow::Result<FieldValue> {
        let prev = ctx.history("counter").last().and_then(|v| v.as_ref()).and_then(FieldValue::as_i64);
        Ok(json!(prev.map(|p| p + 1).unwrap_or(0)))
    }
}

fn counter_engine() -> Arc<Engine> {
    Arc::new(
        ModelBuilder::new()
            .input_report(InputReportDef {
                name: "vehicle".to_string(),
                id_field: "vehicle_id".to_string(),
                fields: vec![
                    FieldDef::new("vehicle_id", "vehicle", "string"),
                    FieldDef::new("tick", "vehicle", "string"),
                ],
            })
            .artificial_field(
                ArtificialFieldDef::new("counter", "vehicle", Arc::new(Counter))
                    .depends_on_current("tick")
                    .depends_on_history("counter", 1),
            )
            .compile()
            .unwrap(),
    )
}

#[tokio::test]
async fn a_self_history_field_counts_up_independently_per_source() {
    let broker = Arc::new(FakeBroker::new());
    let engine = counter_engine();
    let splitter = Splitter::new(broker.clone(), engine.clone(), "vehicle", "split-1");
    splitter.prepare().await.unwrap();
    let gen = FieldGenerator::new(broker.clone(), engine.clone(), "counter", "gen-1");
    gen.prepare().await.unwrap();

    for source in ["V1", "V2", "V1", "V2", "V1", "V2"] {
        split_vehicle(&broker, &splitter, source, &[("tick", "\"x\"".to_string())]).await;
        gen.run_once(10, 0).await.unwrap();
    }

    broker.create_group("vehicle:counter", "inspect").await.unwrap();
    let entries = broker.xreadgroup("inspect", "r1", &["vehicle:counter"], 10, 0).await.unwrap();
    let value_of = |msg: &str| -> i64 {
        let e = entries.iter().find(|e| e.fields.get("_msg").map(String::as_str) == Some(msg)).unwrap();
        e.fields.get("value").unwrap().parse().unwrap()
    };
    assert_eq!(value_of("V1-1"), 0);
    assert_eq!(value_of("V1-2"), 1);
    assert_eq!(value_of("V1-3"), 2);
    assert_eq!(value_of("V2-1"), 0);
    assert_eq!(value_of("V2-2"), 1);
    assert_eq!(value_of("V2-3"), 2);
}

struct FailsOnNegative;
#[async_trait]
impl ComputeFn for FailsOnNegative {
    async fn compute(&self, ctx: &FieldContext<'_>) -> anyhow::Result<FieldValue> {
        let lat = ctx.current("lat").and_then(FieldValue::as_f64).unwrap_or(0.0);
        if lat < 0.0 {
            anyhow::bail!("negative lat is not a valid position");
        }
        Ok(json!(lat * 2.0))
    }
}

fn dlq_engine() -> Arc<Engine> {
    Arc::new(
        ModelBuilder::new()
            .input_report(InputReportDef {
                name: "vehicle".to_string(),
                id_field: "vehicle_id".to_string(),
                fields: vec![
                    FieldDef::new("vehicle_id", "vehicle", "string"),
                    FieldDef::new("lat", "vehicle", "number"),
                ],
            })
            .artificial_field(ArtificialFieldDef::new("risky", "vehicle", Arc::new(FailsOnNegative)).depends_on_current("lat"))
            .output_report(OutputReportDef {
                name: "positions".to_string(),
                required_fields: vec!["risky".to_string()],
            })
            .compile()
            .unwrap(),
    )
}

#[tokio::test]
async fn a_compute_failure_routes_to_the_dlq_and_the_message_never_produces_output() {
    let broker = Arc::new(FakeBroker::new());
    let engine = dlq_engine();
    let splitter = Splitter::new(broker.clone(), engine.clone(), "vehicle", "split-1");
    splitter.prepare().await.unwrap();
    let gen = FieldGenerator::new(broker.clone(), engine.clone(), "risky", "gen-1");
    gen.prepare().await.unwrap();
    let agg = OutputAggregator::new(broker.clone(), engine.clone(), "positions", "agg-1");
    agg.prepare().await.unwrap();

    for lat in [5.0, -1.0, 7.0] {
        split_vehicle(&broker, &splitter, "V1", &[("lat", lat.to_string())]).await;
        gen.run_once(10, 0).await.unwrap();
        agg.run_once(10, 0).await.unwrap();
    }

    broker.create_group("vehicle:_dlq", "inspect").await.unwrap();
    let dlq_entries = broker.xreadgroup("inspect", "r1", &["vehicle:_dlq"], 10, 0).await.unwrap();
    assert_eq!(dlq_entries.len(), 1);
    assert_eq!(dlq_entries[0].fields.get("_msg").unwrap(), "V1-2");
    assert_eq!(dlq_entries[0].fields.get("_failed_at").unwrap(), "risky");
    assert!(dlq_entries[0].fields.get("_error").unwrap().contains("negative"));

    broker.create_group("vehicle:risky", "inspect2").await.unwrap();
    let risky_entries = broker.xreadgroup("inspect2", "r1", &["vehicle:risky"], 10, 0).await.unwrap();
    let ids: Vec<&str> = risky_entries.iter().filter_map(|e| e.fields.get("_msg").map(String::as_str)).collect();
    assert_eq!(ids, vec!["V1-1", "V1-3"], "the failed message must never reach its own sub-stream");

    broker.create_group("positions", "inspect3").await.unwrap();
    let output_entries = broker.xreadgroup("inspect3", "r1", &["positions"], 10, 0).await.unwrap();
    let output_ids: Vec<&str> = output_entries.iter().filter_map(|e| e.fields.get("_msg").map(String::as_str)).collect();
    assert_eq!(output_ids, vec!["V1-1", "V1-3"], "no output report may reference the failed message");
}

struct Double;
#[async_trait]
impl ComputeFn for Double {
    async fn compute(&self, ctx: &FieldContext<'_>) -> anyhow::Result<FieldValue> {
        let lat = ctx.current("lat").and_then(FieldValue::as_f64).unwrap_or(0.0);
        Ok(json!(lat * 2.0))
    }
}

struct Noop;
#[async_trait]
impl ComputeFn for Noop {
    async fn compute(&self, _ctx: &FieldContext<'_>) -> anyhow::Result<FieldValue> {
        Ok(json!(null))
    }
}

fn redelivery_engine() -> Arc<Engine> {
    Arc::new(
        ModelBuilder::new()
            .input_report(InputReportDef {
                name: "vehicle".to_string(),
                id_field: "vehicle_id".to_string(),
                fields: vec![
                    FieldDef::new("vehicle_id", "vehicle", "string"),
                    FieldDef::new("lat", "vehicle", "number"),
                ],
            })
            .artificial_field(ArtificialFieldDef::new("double", "vehicle", Arc::new(Double)).depends_on_current("lat"))
            .artificial_field(
                ArtificialFieldDef::new("double_echo", "vehicle", Arc::new(Noop)).depends_on_history("double", 2),
            )
            .compile()
            .unwrap(),
    )
}

#[tokio::test]
async fn a_redelivered_entry_recomputes_without_duplicating_the_history_push() {
    let broker = Arc::new(FakeBroker::new());
    let engine = redelivery_engine();
    let gen = FieldGenerator::new(broker.clone(), engine.clone(), "double", "gen-1");
    gen.prepare().await.unwrap();

    broker.xadd("vehicle:lat", &[("_msg", "V1-1".to_string()), ("value", "5".to_string())]).await.unwrap();
    gen.run_once(10, 0).await.unwrap();

    broker.xadd("vehicle:lat", &[("_msg", "V1-2".to_string()), ("value", "7".to_string())]).await.unwrap();
    gen.run_once(10, 0).await.unwrap();

    // The worker crashes after computing V1-2 but before its ack reaches the broker; the
    // entry is redelivered and the generator processes it a second time.
    broker.xadd("vehicle:lat", &[("_msg", "V1-2".to_string()), ("value", "7".to_string())]).await.unwrap();
    gen.run_once(10, 0).await.unwrap();

    let history = HistoryStore::new(broker.clone());
    let window = history.window("double", "V1", 3, 3).await.unwrap();
    assert_eq!(window, vec![None, Some(json!(10.0)), Some(json!(14.0))], "seq 2's value must not appear twice");

    broker.create_group("vehicle:double", "inspect").await.unwrap();
    let entries = broker.xreadgroup("inspect", "r1", &["vehicle:double"], 10, 0).await.unwrap();
    let redelivered_values: Vec<&str> = entries
        .iter()
        .filter(|e| e.fields.get("_msg").map(String::as_str) == Some("V1-2"))
        .filter_map(|e| e.fields.get("value").map(String::as_str))
        .collect();
    assert!(redelivered_values.iter().all(|v| *v == "14.0"), "recomputing a redelivered entry must be idempotent");
}

#[test]
fn a_current_dependency_cycle_is_rejected_naming_both_fields() {
    struct ConstFn;
    #[async_trait]
    impl ComputeFn for ConstFn {
        async fn compute(&self, _ctx: &FieldContext<'_>) -> anyhow::Result<FieldValue> {
            Ok(json!(0.0))
        }
    }

    let err = ModelBuilder::new()
        .input_report(InputReportDef {
            name: "vehicle".to_string(),
            id_field: "vehicle_id".to_string(),
            fields: vec![FieldDef::new("vehicle_id", "vehicle", "string")],
        })
        .artificial_field(ArtificialFieldDef::new("a", "vehicle", Arc::new(ConstFn)).depends_on_current("b"))
        .artificial_field(ArtificialFieldDef::new("b", "vehicle", Arc::new(ConstFn)).depends_on_current("a"))
        .compile()
        .unwrap_err();

    match err {
        CompileError::DependencyCycle { cycle } => {
            assert!(cycle.contains(&"a".to_string()));
            assert!(cycle.contains(&"b".to_string()));
        }
        other => panic!("expected a dependency cycle error, got {other:?}"),
    }
}
