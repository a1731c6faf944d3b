//! # PyBrook Core - Field, Report, and Dependency Model
//!
//! This crate provides the foundational types for declaring a PyBrook dataflow model
//! and the model compiler that turns a declaration into a compiled [`Engine`]: the
//! consumer-group graph the worker runtime launches.
//!
//! ## Key Components
//!
//! - **Message identity**: [`MessageId`], the `<source-id><sep><seq>` identifier shared
//!   by every component.
//! - **Field & report model**: [`FieldDef`], [`InputReportDef`], [`OutputReportDef`].
//! - **Dependency declaration**: [`Dependency`], current or historical.
//! - **Model compiler**: [`ModelBuilder`] accumulates a declaration; `compile()` produces
//!   an [`Engine`], failing fast on an unknown field reference, a dependency cycle, or a
//!   missing `id_field`.

pub mod dependency;
pub mod error;
pub mod field;
pub mod ids;
pub mod model;
pub mod report;
pub mod schema;

pub use dependency::Dependency;
pub use error::CompileError;
pub use field::{FieldDef, FieldOrigin, FieldValue};
pub use ids::MessageId;
pub use model::{ArtificialFieldDef, ComputeFn, Engine, FieldContext, ModelBuilder, SyncFn};
pub use report::{InputReportDef, OutputReportDef};
pub use schema::SchemaDescriptor;
