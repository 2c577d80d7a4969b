//! Runnable worker process: two consumers, two dispatchers, one publisher.
//!
//! The request queue carries user commands and publishes status through the
//! configured [`StatusUpdater`]. The admin queue carries `start`, `stop` and
//! `status` on a single-slot pool and publishes nothing.

use crate::broker::Broker;
use crate::config::WorkerConfig;
use crate::consumer::{ConsumerConfig, ConsumerHandle, RequestConsumer, RequestProcessor};
use crate::context::WorkerIdentity;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::error::TaproomResult;
use crate::publisher::{NoopUpdater, StatusUpdater};
use crate::registry::{CommandDescriptor, CommandRegistry, Invocation};
use crate::request::CommandType;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Lifecycle state reported by the `status` admin command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Initializing,
    Running,
    Stopping,
    Stopped,
}

struct WorkerShared {
    state: Mutex<WorkerState>,
    stop_tx: watch::Sender<bool>,
}

impl WorkerShared {
    fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock() = state;
    }
}

/// A configured worker that has not started consuming yet.
pub struct Worker {
    config: WorkerConfig,
    registry: CommandRegistry,
    updater: Arc<dyn StatusUpdater>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        registry: CommandRegistry,
        updater: Arc<dyn StatusUpdater>,
    ) -> TaproomResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry,
            updater,
        })
    }

    /// Start consuming the request queue from `request_broker` and the
    /// admin queue from `admin_broker`.
    pub fn start<R, A>(self, request_broker: R, admin_broker: A) -> TaproomResult<WorkerHandle>
    where
        R: Broker + 'static,
        A: Broker + 'static,
    {
        let identity = Arc::new(self.config.identity());
        let request_config = self.consumer_config(self.config.request_queue());
        let admin_config = self.consumer_config(self.config.admin_queue());
        let (stop_tx, _) = watch::channel(false);
        let shared = Arc::new(WorkerShared {
            state: Mutex::new(WorkerState::Initializing),
            stop_tx,
        });

        let dispatcher = Dispatcher::new(
            self.config.dispatcher_config(),
            self.registry,
            identity.clone(),
            self.updater.clone(),
        )?;
        let admin_dispatcher = Dispatcher::new(
            DispatcherConfig {
                max_concurrent: 1,
                queue_capacity: 8,
            },
            admin_registry(shared.clone(), dispatcher.clone())?,
            identity.clone(),
            Arc::new(NoopUpdater),
        )?;

        let request = RequestConsumer::new(
            request_broker,
            request_config,
            RequestProcessor::new(dispatcher, self.updater),
        )
        .start();
        let admin = RequestConsumer::new(
            admin_broker,
            admin_config,
            RequestProcessor::new(admin_dispatcher, Arc::new(NoopUpdater)),
        )
        .start();

        shared.set_state(WorkerState::Running);
        info!(
            worker = %identity,
            request_queue = %request.queue_key(),
            admin_queue = %admin.queue_key(),
            max_concurrent = self.config.max_concurrent,
            "Worker started"
        );

        Ok(WorkerHandle {
            identity,
            shared,
            request,
            admin,
        })
    }

    fn consumer_config(&self, queue_key: String) -> ConsumerConfig {
        ConsumerConfig {
            queue_key,
            block: self.config.block_timeout,
            reconnect: self.config.backoff,
        }
    }
}

fn admin_registry(shared: Arc<WorkerShared>, requests: Dispatcher) -> TaproomResult<CommandRegistry> {
    let mut builder = CommandRegistry::builder();

    let on_start = shared.clone();
    builder.register(
        CommandDescriptor::new("start", move |_inv: Invocation| {
            let shared = on_start.clone();
            async move {
                if shared.state() == WorkerState::Initializing {
                    shared.set_state(WorkerState::Running);
                }
                Ok(json!(shared.state()))
            }
        })
        .with_description("Mark the worker as running")
        .with_command_type(CommandType::Admin),
    )?;

    let on_stop = shared.clone();
    builder.register(
        CommandDescriptor::new("stop", move |_inv: Invocation| {
            let shared = on_stop.clone();
            async move {
                info!("Stop requested through admin queue");
                shared.stop_tx.send_replace(true);
                Ok(json!(WorkerState::Stopping))
            }
        })
        .with_description("Ask the worker to shut down")
        .with_command_type(CommandType::Admin),
    )?;

    builder.register(
        CommandDescriptor::new("status", move |inv: Invocation| {
            let shared = shared.clone();
            let requests = requests.clone();
            async move {
                let identity = inv.context.identity();
                Ok(json!({
                    "name": identity.unique_name(),
                    "namespace": identity.namespace,
                    "state": shared.state(),
                    "in_flight": requests.in_flight(),
                    "queued": requests.queued(),
                }))
            }
        })
        .with_description("Heartbeat")
        .with_command_type(CommandType::Admin),
    )?;

    Ok(builder.build())
}

/// Handle to a started [`Worker`].
pub struct WorkerHandle {
    identity: Arc<WorkerIdentity>,
    shared: Arc<WorkerShared>,
    request: ConsumerHandle,
    admin: ConsumerHandle,
}

impl WorkerHandle {
    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// Dispatcher serving the request queue.
    pub fn dispatcher(&self) -> &Dispatcher {
        self.request.dispatcher()
    }

    /// Ask the worker to stop; [`wait`](Self::wait) then resolves.
    pub fn request_stop(&self) {
        self.shared.stop_tx.send_replace(true);
    }

    /// Resolve when a stop was requested or a consumer failed, returning the
    /// first fatal consumer error.
    pub async fn wait(&mut self) -> TaproomResult<()> {
        let mut stop_rx = self.shared.stop_tx.subscribe();
        tokio::select! {
            _ = stop_requested(&mut stop_rx) => Ok(()),
            result = self.request.finished() => result,
            result = self.admin.finished() => result,
        }
    }

    /// Stop both consumers and drain both dispatchers.
    pub async fn stop(self) -> TaproomResult<()> {
        self.shared.set_state(WorkerState::Stopping);
        info!(worker = %self.identity, "Stopping worker");

        let request = self.request.stop().await;
        let admin = self.admin.stop().await;

        self.shared.set_state(WorkerState::Stopped);
        info!(worker = %self.identity, "Worker stopped");
        request.and(admin)
    }
}

async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
