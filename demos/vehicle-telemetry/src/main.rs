//! # Vehicle Telemetry Demo
//!
//! A small end-to-end model: vehicles report `lat`/`lon`, a derived `bearing` field is
//! computed from the current position plus the immediately preceding one, and a
//! `positions` output report republishes `lat`, `lon`, and `bearing` together.
//!
//! ```bash
//! REDIS_URL=redis://127.0.0.1:6379 DEFAULT_WORKERS=2 cargo run --bin vehicle-telemetry-demo
//! ```
//!
//! This binary only wires up the model and launches workers; producing input records
//! and serving `/pybrook-schema.json` / the output WebSocket are the external HTTP
//! layer's job, not this crate's.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use pybrook_broker::RedisBroker;
use pybrook_core::{ArtificialFieldDef, ComputeFn, FieldContext, FieldDef, FieldValue, InputReportDef, ModelBuilder, OutputReportDef, SchemaDescriptor};
use pybrook_runtime::{default_worker_count, OutputAggregator, Splitter, WorkerConfig, WorkerRuntime};
use serde_json::json;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Bearing in degrees from the previous fix to the current one, 0 if there is no
/// previous fix yet.
struct Bearing;

#[async_trait]
impl ComputeFn for Bearing {
    async fn compute(&self, ctx: &FieldContext<'_>) -> anyhow::Result<FieldValue> {
        let lat = ctx.current("lat").and_then(FieldValue::as_f64).unwrap_or(0.0);
        let lon = ctx.current("lon").and_then(FieldValue::as_f64).unwrap_or(0.0);

        let prev_lat = ctx.history("lat").last().and_then(|v| v.as_ref()).and_then(FieldValue::as_f64);
        let prev_lon = ctx.history("lon").last().and_then(|v| v.as_ref()).and_then(FieldValue::as_f64);

        let bearing = match (prev_lat, prev_lon) {
            (Some(plat), Some(plon)) => {
                let dy = lat - plat;
                let dx = lon - plon;
                dy.atan2(dx).to_degrees().rem_euclid(360.0)
            }
            _ => 0.0,
        };
        Ok(json!(bearing))
    }
}

fn build_model() -> Result<pybrook_core::Engine> {
    let engine = ModelBuilder::new()
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
            ArtificialFieldDef::new("bearing", "vehicle", Arc::new(Bearing))
                .depends_on_current("lat")
                .depends_on_current("lon")
                .depends_on_history("lat", 1)
                .depends_on_history("lon", 1)
                .json_type("number"),
        )
        .output_report(OutputReportDef {
            name: "positions".to_string(),
            required_fields: vec!["lat".to_string(), "lon".to_string(), "bearing".to_string()],
        })
        .compile()?;
    Ok(engine)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let engine = Arc::new(build_model()?);

    let schema = SchemaDescriptor::build(&engine, Some("lat"), Some("lon"), None, Some("vehicle_id"), Some("bearing"));
    tracing::info!(schema = %serde_json::to_string(&schema)?, "compiled model");

    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let broker: Arc<dyn pybrook_broker::Broker> = Arc::new(RedisBroker::connect(&redis_url).await?);

    let workers = default_worker_count();
    tracing::info!(redis_url, workers, "starting vehicle-telemetry workers");

    let config = WorkerConfig::default();
    let mut runtime = WorkerRuntime::new();

    runtime.spawn(workers, config, {
        let broker = broker.clone();
        let engine = engine.clone();
        move |i| Splitter::new(broker.clone(), engine.clone(), "vehicle", format!("split-{i}"))
    });
    runtime.spawn(workers, config, {
        let broker = broker.clone();
        let engine = engine.clone();
        move |i| pybrook_runtime::FieldGenerator::new(broker.clone(), engine.clone(), "bearing", format!("bearing-{i}"))
    });
    runtime.spawn(workers, config, {
        let broker = broker.clone();
        let engine = engine.clone();
        move |i| OutputAggregator::new(broker.clone(), engine.clone(), "positions", format!("positions-{i}"))
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("received Ctrl-C, shutting down");
            runtime.shutdown();
        }
    }
    runtime.join_all().await;
    Ok(())
}
