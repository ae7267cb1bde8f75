//! Per-execution event fan-out.
//!
//! One producer (the execution runner) broadcasts to any number of live
//! subscribers. Buffers are bounded; when a subscriber's buffer is full
//! that event is dropped for that subscriber only and the producer never
//! blocks. The durable store stays authoritative for history.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::storage::ExecutionEvent;

/// Buffered events per subscriber before drops set in.
const SUBSCRIBER_BUFFER: usize = 100;

/// A live subscription to one execution's event stream.
///
/// Dropping the subscription without unsubscribing leaves a dead sender in
/// the table until [`EventStreamer::unsubscribe`] or table cleanup; sends
/// to it fail silently, matching the drop policy.
pub struct Subscription {
    id: u64,
    execution_id: Uuid,
    receiver: mpsc::Receiver<ExecutionEvent>,
}

impl Subscription {
    /// Receive the next event; `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<ExecutionEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<ExecutionEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }
}

struct SubscriberSlot {
    id: u64,
    sender: mpsc::Sender<ExecutionEvent>,
}

/// Fan-out hub from execution runners to live observers.
pub struct EventStreamer {
    subscribers: RwLock<HashMap<Uuid, Vec<SubscriberSlot>>>,
    next_id: AtomicU64,
}

impl EventStreamer {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a new subscriber for an execution.
    pub async fn subscribe(&self, execution_id: Uuid) -> Subscription {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.subscribers
            .write()
            .await
            .entry(execution_id)
            .or_default()
            .push(SubscriberSlot { id, sender });

        Subscription {
            id,
            execution_id,
            receiver,
        }
    }

    /// Remove a subscriber and close its channel. Idempotent.
    pub async fn unsubscribe(&self, subscription: &Subscription) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(slots) = subscribers.get_mut(&subscription.execution_id) {
            slots.retain(|slot| slot.id != subscription.id);
            if slots.is_empty() {
                subscribers.remove(&subscription.execution_id);
            }
        }
    }

    /// Deliver an event to every current subscriber of the execution.
    ///
    /// Non-blocking: a subscriber whose buffer is full misses this event;
    /// all others still receive it. Never fails.
    pub async fn broadcast(&self, execution_id: Uuid, event: &ExecutionEvent) {
        let subscribers = self.subscribers.read().await;
        if let Some(slots) = subscribers.get(&execution_id) {
            for slot in slots {
                if slot.sender.try_send(event.clone()).is_err() {
                    tracing::trace!(
                        execution_id = %execution_id,
                        subscriber = slot.id,
                        event_type = %event.event_type,
                        "Subscriber buffer full, event dropped"
                    );
                }
            }
        }
    }

    /// Number of live subscribers for an execution.
    pub async fn subscriber_count(&self, execution_id: Uuid) -> usize {
        self.subscribers
            .read()
            .await
            .get(&execution_id)
            .map(|slots| slots.len())
            .unwrap_or(0)
    }
}

impl Default for EventStreamer {
    fn default() -> Self {
        Self::new()
    }
}
