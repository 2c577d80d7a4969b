//! Scenario tests for Taproom.
//!
//! Everything runs in process against [`MemoryBroker`](crate::MemoryBroker)
//! and [`MemoryRequestStore`](crate::MemoryRequestStore):
//!
//! - `harness.rs`    - Test commands, wiring helpers, polling helpers
//! - `dispatcher.rs` - Pool bound, admission backpressure, shutdown drain,
//!                     status publishing around execution
//! - `consumer.rs`   - Ack/reject/leave decisions, terminal republish,
//!                     reconnect with backoff
//! - `client.rs`     - Self-reference without deadlock, parent defaulting,
//!                     parent-completed guard, error raising
//! - `end_to_end.rs` - Client to store to broker to worker and back, admin
//!                     queue, graceful stop

mod client;
mod consumer;

#[allow(unused_imports)]
pub use harness::{Gauge, TestHarness};
