//! # PyBrook Broker - Stream and KV Transport
//!
//! The [`Broker`] trait (C1) is the only interface the rest of PyBrook has onto the
//! outside world: append-only streams with consumer groups for at-least-once delivery,
//! a flat KV/hash space for counters and pending-join state, bounded lists for history
//! ring buffers, and pub/sub for the output fan-out.
//!
//! [`RedisBroker`] backs it with Redis Streams; [`FakeBroker`] backs it with an
//! in-memory mock for tests that don't need a live Redis instance.

pub mod broker;
pub mod error;
pub mod fake;
pub mod redis_broker;

pub use broker::{Broker, StreamEntry, Subscription};
pub use error::BrokerError;
pub use fake::FakeBroker;
pub use redis_broker::RedisBroker;
