//! Seam to the signaling relay.
//!
//! Inbound messages are fanned out to explicit per-event subscriptions.
//! A [`Subscription`] detaches itself when dropped, so replacing a consumer
//! never leaves a stale listener behind.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use duet_protocol::{EventKind, SignalingMessage};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TransportError;

/// Persistent, authenticated, auto-reconnecting channel to the relay.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Hand one message to the relay. Resolves once the message was written
    /// to the socket, or fails if the channel is down.
    async fn send(&self, message: SignalingMessage) -> Result<(), TransportError>;

    /// Whether the underlying socket is currently up.
    fn is_connected(&self) -> bool;

    /// Receive every inbound message whose event is in `events`.
    fn subscribe(&self, events: &[EventKind]) -> Subscription;
}

type Listener = (u64, mpsc::UnboundedSender<SignalingMessage>);

#[derive(Default)]
struct Table {
    next_id: u64,
    by_event: HashMap<EventKind, Vec<Listener>>,
}

/// Subscription list keyed by event name.
#[derive(Clone, Default)]
pub struct Subscribers {
    table: Arc<Mutex<Table>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, events: &[EventKind]) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.next_id += 1;
        let id = table.next_id;
        for event in events {
            table
                .by_event
                .entry(*event)
                .or_default()
                .push((id, tx.clone()));
        }
        Subscription {
            id,
            events: events.to_vec(),
            table: Arc::downgrade(&self.table),
            rx,
        }
    }

    /// Deliver an inbound message to every subscriber of its event.
    /// Returns the number of subscribers reached.
    pub fn publish(&self, message: &SignalingMessage) -> usize {
        let kind = message.kind();
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let Some(listeners) = table.by_event.get_mut(&kind) else {
            debug!(event = %kind, "No subscriber for inbound event");
            return 0;
        };
        listeners.retain(|(_, tx)| tx.send(message.clone()).is_ok());
        listeners.len()
    }

    pub fn count(&self, event: EventKind) -> usize {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.by_event.get(&event).map_or(0, Vec::len)
    }
}

/// Receiving end of a subscription.
pub struct Subscription {
    id: u64,
    events: Vec<EventKind>,
    table: Weak<Mutex<Table>>,
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SignalingMessage> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut table = table.lock().unwrap_or_else(|e| e.into_inner());
        for event in &self.events {
            if let Some(listeners) = table.by_event.get_mut(event) {
                listeners.retain(|(id, _)| *id != self.id);
            }
        }
    }
}
