//! Taproom: serve a handler's methods as broker-delivered commands and
//! invoke them from anywhere as if they were local calls.
//!
//! # Architecture
//!
//! ```text
//! RpcClient -> RequestStore -> Broker queue -> RequestConsumer
//!                   ^                               |
//!                   |                               v
//!             StatusPublisher <- Dispatcher <- RequestProcessor
//! ```
//!
//! # Core Invariants
//!
//! 1. **Forward-only status**: persisted transitions follow
//!    `CREATED < IN_PROGRESS < terminal`, and terminal statuses never change.
//! 2. **Bounded pool**: at most `max_concurrent` commands execute at once;
//!    the pool never grows.
//! 3. **No self-deadlock**: a command calling back into its own worker runs
//!    inline, without a pool slot.
//! 4. **Bounded retries**: every retry loop stops after `max_attempts`.
//! 5. **No children of finished parents**: checked before any I/O.

pub mod backoff;
pub mod broker;
pub mod client;
pub mod config;
pub mod consumer;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod http_store;
pub mod protocol;
pub mod publisher;
pub mod redis_broker;
pub mod registry;
pub mod request;
pub mod status;
pub mod store;
pub mod worker;

#[cfg(test)]
mod tests;

pub use backoff::BackoffPolicy;
pub use broker::{Broker, Delivery, MemoryBroker};
pub use client::{InvokeOptions, RpcClient, RpcClientConfig};
pub use config::WorkerConfig;
pub use consumer::{ConsumerConfig, ConsumerHandle, Disposition, RequestConsumer, RequestProcessor};
pub use context::{CurrentInvocation, WorkerIdentity};
pub use dispatcher::{Dispatcher, DispatcherConfig, Ticket};
pub use error::{CommandError, ErrorKind, TaproomError, TaproomResult};
pub use http_store::HttpRequestStore;
pub use protocol::{queue_key, InvocationMessage, MessageHeaders, QueueKind};
pub use publisher::{NoopUpdater, StatusPublisher, StatusUpdater};
pub use redis_broker::{RedisBroker, RedisBrokerConfig};
pub use registry::{
    CommandDescriptor, CommandHandler, CommandRegistry, Invocation, ParameterKind, ParameterSpec,
};
pub use request::{CommandType, OutputType, Parameters, Request, RequestId, Target, LATEST_VERSION};
pub use status::{RequestStatus, StatusMachine, StatusTransitionError};
pub use store::{MemoryRequestStore, RequestQuery, RequestStore, StatusUpdate, VersionResolver};
pub use worker::{Worker, WorkerHandle, WorkerState};
