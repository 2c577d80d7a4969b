//! Broker consumer.
//!
//! The consumer owns its broker connection and feeds each delivery to a
//! [`RequestProcessor`], which decides whether the message is acknowledged,
//! rejected, or left pending. Messages are acknowledged once the dispatcher
//! has accepted the work, not when it finishes.

use crate::backoff::BackoffPolicy;
use crate::broker::{Broker, Delivery};
use crate::context::WorkerIdentity;
use crate::dispatcher::Dispatcher;
use crate::error::{TaproomError, TaproomResult};
use crate::protocol::InvocationMessage;
use crate::publisher::StatusUpdater;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What to do with a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Discard without requeueing.
    Reject(String),
    /// Neither ack nor reject; the broker may redeliver it.
    Leave,
}

/// Turns deliveries into dispatcher work.
pub struct RequestProcessor {
    dispatcher: Dispatcher,
    updater: Arc<dyn StatusUpdater>,
}

impl RequestProcessor {
    pub fn new(dispatcher: Dispatcher, updater: Arc<dyn StatusUpdater>) -> Self {
        Self {
            dispatcher,
            updater,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn identity(&self) -> &WorkerIdentity {
        self.dispatcher.identity()
    }

    pub async fn process(&self, delivery: &Delivery) -> Disposition {
        let message = match InvocationMessage::decode(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                error!(message_id = %delivery.id, error = %e, "Discarding undecodable message");
                return Disposition::Reject(e.to_string());
            }
        };
        let request = message.request;

        if !self.identity().matches(&request.target()) {
            let reason = format!(
                "Request {} is addressed to {}, this worker is {}",
                request.id_or_unassigned(),
                request,
                self.identity()
            );
            warn!(message_id = %delivery.id, request_id = %request.id_or_unassigned(), "{}", reason);
            return Disposition::Reject(reason);
        }

        if request.is_terminal() {
            info!(
                request_id = %request.id_or_unassigned(),
                status = %request.status,
                "Request already finished, republishing status"
            );
            return match self.updater.update(&request, None).await {
                Ok(()) => Disposition::Ack,
                Err(e) if e.is_validation() => Disposition::Ack,
                Err(_) => Disposition::Leave,
            };
        }

        match self.dispatcher.submit(request).await {
            Ok(ticket) => {
                debug!(
                    request_id = %ticket.request_id(),
                    retry_attempt = message.headers.retry_attempt,
                    "Accepted request"
                );
                Disposition::Ack
            }
            Err(TaproomError::ShutDown(reason)) => {
                info!(message_id = %delivery.id, reason = %reason, "Not accepting message during shutdown");
                Disposition::Leave
            }
            Err(e) => {
                error!(message_id = %delivery.id, error = %e, "Failed to accept message");
                Disposition::Leave
            }
        }
    }
}

/// Consumer settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub queue_key: String,
    /// How long a single read blocks.
    pub block: Duration,
    pub reconnect: BackoffPolicy,
}

impl ConsumerConfig {
    pub fn new(queue_key: impl Into<String>) -> Self {
        Self {
            queue_key: queue_key.into(),
            block: Duration::from_secs(1),
            reconnect: BackoffPolicy::default(),
        }
    }
}

/// Reads one queue and hands deliveries to a [`RequestProcessor`].
pub struct RequestConsumer<B> {
    broker: B,
    config: ConsumerConfig,
    processor: RequestProcessor,
}

impl<B: Broker + 'static> RequestConsumer<B> {
    pub fn new(broker: B, config: ConsumerConfig, processor: RequestProcessor) -> Self {
        Self {
            broker,
            config,
            processor,
        }
    }

    /// Spawn the consume loop.
    pub fn start(self) -> ConsumerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = self.processor.dispatcher().clone();
        let queue_key = self.config.queue_key.clone();
        let join = tokio::spawn(self.run(shutdown_rx));
        ConsumerHandle {
            queue_key,
            shutdown_tx,
            join: Some(join),
            dispatcher,
        }
    }

    /// Consume until `shutdown` flips to true or reconnecting is exhausted.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> TaproomResult<()> {
        info!(queue = %self.config.queue_key, "Starting consumer");
        let mut unusable = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let read = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    // Handle dropped.
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                read = self.broker.read_next(&self.config.queue_key, self.config.block) => read,
            };

            match read {
                Ok(None) => unusable = 0,
                Ok(Some(delivery)) => {
                    unusable = 0;
                    self.handle(delivery).await?;
                }
                Err(e) if e.is_transient() => {
                    warn!(queue = %self.config.queue_key, error = %e, "Read failed");
                    self.reconnect().await?;
                }
                Err(e) => {
                    unusable = unusable.saturating_add(1);
                    let delay = self.config.reconnect.delay_for(unusable);
                    error!(
                        queue = %self.config.queue_key,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Read returned an unusable message"
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!(queue = %self.config.queue_key, "Consumer stopped");
        Ok(())
    }

    async fn handle(&mut self, delivery: Delivery) -> TaproomResult<()> {
        let settled = match self.processor.process(&delivery).await {
            Disposition::Ack => self.broker.ack(&delivery).await,
            Disposition::Reject(reason) => self.broker.reject(&delivery, &reason).await,
            Disposition::Leave => Ok(()),
        };
        match settled {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => {
                warn!(message_id = %delivery.id, error = %e, "Settling message failed");
                self.reconnect().await
            }
            Err(e) => {
                error!(message_id = %delivery.id, error = %e, "Settling message failed");
                Ok(())
            }
        }
    }

    async fn reconnect(&mut self) -> TaproomResult<()> {
        let policy = self.config.reconnect;
        let max_attempts = policy.max_attempts.max(1);
        let mut last = None;

        for attempt in 1..=max_attempts {
            let delay = policy.delay_for(attempt);
            warn!(
                queue = %self.config.queue_key,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to broker"
            );
            tokio::time::sleep(delay).await;

            match self.broker.reconnect().await {
                Ok(()) => {
                    info!(queue = %self.config.queue_key, attempt = attempt, "Reconnected to broker");
                    return Ok(());
                }
                Err(e) => last = Some(e),
            }
        }

        let last = last.unwrap_or_else(|| TaproomError::Transport("reconnect failed".into()));
        error!(
            queue = %self.config.queue_key,
            attempts = max_attempts,
            error = %last,
            "FATAL: giving up reconnecting to broker"
        );
        Err(TaproomError::RetriesExhausted {
            operation: "reconnect".into(),
            attempts: max_attempts,
            last: Box::new(last),
        })
    }
}

/// Handle to a running consumer.
pub struct ConsumerHandle {
    queue_key: String,
    shutdown_tx: watch::Sender<bool>,
    join: Option<JoinHandle<TaproomResult<()>>>,
    dispatcher: Dispatcher,
}

impl ConsumerHandle {
    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Ask the consume loop to stop without waiting.
    pub fn request_stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Wait for the consume loop to exit. Cancel safe.
    pub async fn finished(&mut self) -> TaproomResult<()> {
        let Some(join) = self.join.as_mut() else {
            return Ok(());
        };
        let result = join.await;
        self.join = None;
        match result {
            Ok(result) => result,
            Err(e) => Err(TaproomError::ShutDown(format!("consumer task failed: {e}"))),
        }
    }

    /// Stop consuming, drain the dispatcher, and return the loop's result.
    pub async fn stop(mut self) -> TaproomResult<()> {
        self.request_stop();
        self.dispatcher.shutdown().await;
        self.finished().await
    }
}
