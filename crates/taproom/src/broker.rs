//! Broker abstraction and the in-memory broker.
//!
//! A [`Broker`] is owned by exactly one consumer; all methods take `&mut self`.
//! Delivery guarantees are whatever the backing broker provides. Messages
//! read but neither acked nor rejected stay pending.

use crate::error::{TaproomError, TaproomResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// A message read from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned message id (a stream entry id for Redis).
    pub id: String,
    pub queue_key: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait Broker: Send {
    /// Append `payload` to `queue_key`, returning the message id.
    async fn publish(&mut self, queue_key: &str, payload: &[u8]) -> TaproomResult<String>;

    /// Wait up to `block` for the next message on `queue_key`.
    ///
    /// Returns `None` when nothing arrived in time.
    async fn read_next(&mut self, queue_key: &str, block: Duration)
        -> TaproomResult<Option<Delivery>>;

    /// Mark a delivery as handled.
    async fn ack(&mut self, delivery: &Delivery) -> TaproomResult<()>;

    /// Discard a delivery without requeueing it.
    async fn reject(&mut self, delivery: &Delivery, reason: &str) -> TaproomResult<()>;

    /// Re-establish the connection after a transport failure.
    async fn reconnect(&mut self) -> TaproomResult<()>;
}

/// A rejected delivery and the reason given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedDelivery {
    pub delivery: Delivery,
    pub reason: String,
}

#[derive(Default)]
struct Faults {
    reads: u32,
    publishes: u32,
    reconnects: u32,
}

#[derive(Default)]
struct MemoryBrokerState {
    queues: Mutex<HashMap<String, VecDeque<Delivery>>>,
    pending: Mutex<HashMap<String, Delivery>>,
    acked: Mutex<Vec<Delivery>>,
    rejected: Mutex<Vec<RejectedDelivery>>,
    faults: Mutex<Faults>,
    next_id: AtomicU64,
    reconnects: AtomicU64,
    notify: Notify,
}

/// In-process broker.
///
/// Clones share the same queues, so one clone can be handed to a consumer
/// while tests publish and inspect through another. Transport failures can
/// be injected with the `fail_next_*` methods.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<MemoryBrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting on `queue_key` (not yet read).
    pub fn queue_len(&self, queue_key: &str) -> usize {
        self.state
            .queues
            .lock()
            .get(queue_key)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Messages read but neither acked nor rejected.
    pub fn pending_count(&self) -> usize {
        self.state.pending.lock().len()
    }

    pub fn acked(&self) -> Vec<Delivery> {
        self.state.acked.lock().clone()
    }

    pub fn rejected(&self) -> Vec<RejectedDelivery> {
        self.state.rejected.lock().clone()
    }

    /// Number of successful reconnects.
    pub fn reconnect_count(&self) -> u64 {
        self.state.reconnects.load(Ordering::SeqCst)
    }

    pub fn fail_next_reads(&self, count: u32) {
        self.state.faults.lock().reads = count;
    }

    pub fn fail_next_publishes(&self, count: u32) {
        self.state.faults.lock().publishes = count;
    }

    pub fn fail_next_reconnects(&self, count: u32) {
        self.state.faults.lock().reconnects = count;
    }

    fn take_fault(&self, pick: impl FnOnce(&mut Faults) -> &mut u32) -> bool {
        let mut faults = self.state.faults.lock();
        let remaining = pick(&mut faults);
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }

    fn pop(&self, queue_key: &str) -> Option<Delivery> {
        let delivery = self
            .state
            .queues
            .lock()
            .get_mut(queue_key)
            .and_then(VecDeque::pop_front)?;
        self.state
            .pending
            .lock()
            .insert(delivery.id.clone(), delivery.clone());
        Some(delivery)
    }

    fn settle(&self, delivery: &Delivery) -> TaproomResult<Delivery> {
        self.state
            .pending
            .lock()
            .remove(&delivery.id)
            .ok_or_else(|| TaproomError::NotFound(format!("delivery {}", delivery.id)))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&mut self, queue_key: &str, payload: &[u8]) -> TaproomResult<String> {
        if self.take_fault(|f| &mut f.publishes) {
            return Err(TaproomError::Transport("injected publish failure".into()));
        }
        let seq = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("{seq}-0");
        self.state
            .queues
            .lock()
            .entry(queue_key.to_string())
            .or_default()
            .push_back(Delivery {
                id: id.clone(),
                queue_key: queue_key.to_string(),
                payload: payload.to_vec(),
            });
        self.state.notify.notify_waiters();
        debug!(queue = %queue_key, message_id = %id, "Published message");
        Ok(id)
    }

    async fn read_next(
        &mut self,
        queue_key: &str,
        block: Duration,
    ) -> TaproomResult<Option<Delivery>> {
        if self.take_fault(|f| &mut f.reads) {
            return Err(TaproomError::Transport("injected read failure".into()));
        }
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let notified = self.state.notify.notified();
            if let Some(delivery) = self.pop(queue_key) {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> TaproomResult<()> {
        let settled = self.settle(delivery)?;
        self.state.acked.lock().push(settled);
        Ok(())
    }

    async fn reject(&mut self, delivery: &Delivery, reason: &str) -> TaproomResult<()> {
        let settled = self.settle(delivery)?;
        self.state.rejected.lock().push(RejectedDelivery {
            delivery: settled,
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn reconnect(&mut self) -> TaproomResult<()> {
        if self.take_fault(|f| &mut f.reconnects) {
            return Err(TaproomError::Transport("injected reconnect failure".into()));
        }
        self.state.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
