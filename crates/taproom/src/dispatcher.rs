//! Bounded worker pool that executes registered commands.
//!
//! At most `max_concurrent` commands run at once. [`Dispatcher::submit`]
//! admits work into a queue of `queue_capacity` waiting items and returns as
//! soon as the item is accepted; [`Dispatcher::execute`] waits for the
//! result. Self-referencing calls bypass the pool through
//! [`Dispatcher::run_inline`].

use crate::context::{self, CurrentInvocation, WorkerIdentity};
use crate::error::{TaproomError, TaproomResult};
use crate::publisher::StatusUpdater;
use crate::registry::{CommandRegistry, Invocation};
use crate::request::Request;
use crate::status::{RequestStatus, StatusTransitionError};
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Commands executing at once.
    pub max_concurrent: usize,
    /// Accepted commands waiting for a pool slot.
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            queue_capacity: 64,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> TaproomResult<()> {
        if self.max_concurrent == 0 {
            return Err(TaproomError::Config(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(TaproomError::Config(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Handle to a submitted command.
pub struct Ticket {
    request_id: String,
    rx: oneshot::Receiver<Request>,
}

impl Ticket {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the finished request.
    ///
    /// Fails with [`TaproomError::ShutDown`] if the item was abandoned
    /// because the dispatcher shut down before it started.
    pub async fn wait(self) -> TaproomResult<Request> {
        self.rx.await.map_err(|_| {
            TaproomError::ShutDown(format!(
                "request {} was abandoned before it started",
                self.request_id
            ))
        })
    }
}

struct DispatcherInner {
    registry: CommandRegistry,
    identity: Arc<WorkerIdentity>,
    updater: Arc<dyn StatusUpdater>,
    max_concurrent: usize,
    slots: Arc<Semaphore>,
    admission: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    in_flight: AtomicUsize,
    queued: AtomicUsize,
}

/// Executes commands from a [`CommandRegistry`]. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        registry: CommandRegistry,
        identity: Arc<WorkerIdentity>,
        updater: Arc<dyn StatusUpdater>,
    ) -> TaproomResult<Self> {
        config.validate()?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(DispatcherInner {
                registry,
                identity,
                updater,
                max_concurrent: config.max_concurrent,
                slots: Arc::new(Semaphore::new(config.max_concurrent)),
                admission: Arc::new(Semaphore::new(config.queue_capacity)),
                shutdown_tx,
                in_flight: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
            }),
        })
    }

    pub fn identity(&self) -> &Arc<WorkerIdentity> {
        &self.inner.identity
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.inner.registry
    }

    /// Commands currently executing on the pool.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Commands accepted but not yet started.
    pub fn queued(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    fn ensure_accepting(&self) -> TaproomResult<()> {
        if self.is_shut_down() {
            return Err(TaproomError::ShutDown(
                "dispatcher no longer accepts work".to_string(),
            ));
        }
        Ok(())
    }

    /// Run `request` on the pool and wait for the finished request.
    pub async fn execute(&self, request: Request) -> TaproomResult<Request> {
        ensure_runnable(&request)?;
        self.ensure_accepting()?;
        let slot = self
            .inner
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TaproomError::ShutDown("dispatcher pool closed".to_string()))?;
        self.ensure_accepting()?;
        Ok(self.run_on_slot(request, slot).await)
    }

    /// Accept `request` for execution, waiting while the queue is full.
    ///
    /// Returns once the item is admitted. The returned [`Ticket`] resolves
    /// when it finishes.
    pub async fn submit(&self, mut request: Request) -> TaproomResult<Ticket> {
        ensure_runnable(&request)?;
        self.ensure_accepting()?;
        let request_id = request.ensure_id().to_string();

        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let admission = tokio::select! {
            _ = stopped(&mut shutdown_rx) => {
                return Err(TaproomError::ShutDown(
                    "dispatcher shut down while waiting for admission".to_string(),
                ));
            }
            permit = self.inner.admission.clone().acquire_owned() => {
                permit.map_err(|_| TaproomError::ShutDown("dispatcher queue closed".to_string()))?
            }
        };

        self.inner.queued.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let slot = tokio::select! {
                biased;
                _ = stopped(&mut shutdown_rx) => None,
                slot = dispatcher.inner.slots.clone().acquire_owned() => slot.ok(),
            };
            drop(admission);
            dispatcher.inner.queued.fetch_sub(1, Ordering::SeqCst);

            let slot = match slot {
                Some(slot) if !dispatcher.is_shut_down() => slot,
                _ => {
                    debug!(request_id = %request.id_or_unassigned(), "Abandoning queued request on shutdown");
                    return;
                }
            };
            let finished = dispatcher.run_on_slot(request, slot).await;
            let _ = tx.send(finished);
        });

        Ok(Ticket { request_id, rx })
    }

    /// Run `request` on the calling task without a pool slot and without
    /// publishing status updates.
    pub async fn run_inline(&self, request: Request) -> TaproomResult<Request> {
        ensure_runnable(&request)?;
        Ok(self.process(request, false).await)
    }

    /// Stop admitting work and wait for executing commands to finish.
    ///
    /// Accepted commands that have not started are abandoned.
    pub async fn shutdown(&self) {
        if self.inner.shutdown_tx.send_replace(true) {
            return;
        }
        info!(
            worker = %self.inner.identity.unique_name(),
            in_flight = self.in_flight(),
            queued = self.queued(),
            "Dispatcher shutting down"
        );
        let max = u32::try_from(self.inner.max_concurrent).unwrap_or(u32::MAX);
        if let Ok(all) = self.inner.slots.acquire_many(max).await {
            drop(all);
        }
        self.inner.slots.close();
        self.inner.admission.close();
        info!(worker = %self.inner.identity.unique_name(), "Dispatcher drained");
    }

    async fn run_on_slot(&self, request: Request, slot: OwnedSemaphorePermit) -> Request {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let finished = self.process(request, true).await;
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        drop(slot);
        finished
    }

    async fn process(&self, mut request: Request, publish: bool) -> Request {
        request.ensure_id();
        let span = info_span!(
            "invocation",
            request_id = %request.id_or_unassigned(),
            command = %request.command,
        );
        async move {
            let previous = request.status;

            let descriptor = match self.inner.registry.get(&request.command) {
                Some(descriptor) => descriptor,
                None => {
                    let message = format!("Unknown command '{}'", request.command);
                    warn!(error = %message, "Rejecting request");
                    request.fail(RequestStatus::Invalid, message, "UnknownCommand");
                    if publish {
                        let _ = self.inner.updater.update(&request, Some(previous)).await;
                    }
                    return request;
                }
            };
            let parameters = match descriptor.bind(&request.parameters) {
                Ok(parameters) => parameters,
                Err(message) => {
                    warn!(error = %message, "Rejecting request");
                    request.fail(RequestStatus::Invalid, message, "InvalidParameters");
                    if publish {
                        let _ = self.inner.updater.update(&request, Some(previous)).await;
                    }
                    return request;
                }
            };

            request.set_status(RequestStatus::InProgress);
            if publish {
                match self.inner.updater.update(&request, Some(previous)).await {
                    Err(TaproomError::NotFound(what)) => {
                        warn!(missing = %what, "Request unknown to the store, running it anyway");
                    }
                    Err(e) if e.is_validation() => {
                        warn!(error = %e, "Request already finished elsewhere, not running it");
                        request.set_status(previous);
                        return request;
                    }
                    Err(e) => warn!(error = %e, "Running without a published IN_PROGRESS status"),
                    Ok(()) => {}
                }
            }

            let current = Arc::new(CurrentInvocation::new(
                request.clone(),
                self.inner.identity.clone(),
                self.clone(),
            ));
            let invocation = Invocation {
                request: request.clone(),
                parameters,
                context: current.clone(),
            };
            let handler = context::scope(current.clone(), descriptor.call(invocation));
            let outcome = tokio::spawn(handler.in_current_span()).await;

            match outcome {
                Ok(Ok(output)) => {
                    request.succeed(output);
                    info!("Command completed");
                }
                Ok(Err(e)) => {
                    error!(error = %e, class = %e.class(), "Command failed");
                    request.fail(RequestStatus::Error, e.message(), e.class());
                }
                Err(join) if join.is_panic() => {
                    let message = panic_message(join.into_panic());
                    error!(error = %message, "Command panicked");
                    request.fail(RequestStatus::Error, message, "Panic");
                }
                Err(_) => {
                    warn!("Command cancelled");
                    request.fail(RequestStatus::Canceled, "Command was cancelled", "Cancelled");
                }
            }
            current.set_status(request.status);

            if publish {
                let _ = self
                    .inner
                    .updater
                    .update(&request, Some(RequestStatus::InProgress))
                    .await;
            }
            request
        }
        .instrument(span)
        .await
    }
}

/// Finished requests are never run again.
fn ensure_runnable(request: &Request) -> TaproomResult<()> {
    if request.is_terminal() {
        return Err(StatusTransitionError::FromTerminal {
            from: request.status,
            to: RequestStatus::InProgress,
        }
        .into());
    }
    Ok(())
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "command panicked".to_string()
    }
}
