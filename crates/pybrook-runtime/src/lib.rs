//! # PyBrook Runtime - Splitter, Field Generator, Output Aggregator, Workers
//!
//! This crate implements the three consumer-group roles a compiled [`pybrook_core::Engine`]
//! describes and the supervision that launches and gracefully shuts them down:
//!
//! - [`Splitter`] (C2): fans a raw input report out to per-field sub-streams.
//! - [`FieldGenerator`] (C3): joins an artificial field's dependencies and computes it.
//! - [`OutputAggregator`] (C4): joins an output report's required fields and publishes it.
//! - [`WorkerRuntime`] (C5): spawns configured replicas of each role and stops them on
//!   cancellation.
//!
//! [`PendingJoin`] and [`HistoryStore`] factor out the join-state and ring-buffer
//! bookkeeping shared by the generator and the aggregator.

pub mod backoff;
pub mod dlq;
pub mod error;
pub mod generator;
pub mod history;
pub mod idempotency;
pub mod pending;
pub mod resolver;
pub mod splitter;
pub mod worker;

pub use backoff::Backoff;
pub use dlq::DeadLetterQueue;
pub use error::RuntimeError;
pub use generator::FieldGenerator;
pub use history::HistoryStore;
pub use idempotency::IdempotencyGuard;
pub use pending::PendingJoin;
pub use resolver::OutputAggregator;
pub use splitter::Splitter;
pub use worker::{default_worker_count, run_worker_loop, StreamWorker, WorkerConfig, WorkerRuntime};
