//! Outbound side of a session: transfers and acquire results.

use crate::messaging::{DeliveryToken, Message, RangeSet};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One message sent to a destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub sequence: u64,
    pub token: DeliveryToken,
    pub queue: String,
    pub message: Message,
    /// Set when the message has been delivered before.
    pub redelivered: bool,
    /// Whether the session already holds the message acquired.
    pub acquired: bool,
}

impl Delivery {
    pub fn destination(&self) -> &str {
        &self.token.destination
    }
}

/// Writes session output to the peer.
///
/// Only transfers and acquire results leave a message-class session; other
/// commands complete without a response body.
pub trait Proxy: Send {
    fn transfer(&mut self, delivery: &Delivery);

    fn acquired(&mut self, transfers: &RangeSet);
}

/// What a proxy was asked to send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProxyEvent {
    Transfer(Delivery),
    Acquired { transfers: Vec<u64> },
}

impl ProxyEvent {
    pub fn as_transfer(&self) -> Option<&Delivery> {
        match self {
            ProxyEvent::Transfer(delivery) => Some(delivery),
            ProxyEvent::Acquired { .. } => None,
        }
    }
}

/// Proxy that keeps every event in memory. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct RecordingProxy {
    events: Arc<Mutex<Vec<ProxyEvent>>>,
}

impl RecordingProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProxyEvent> {
        self.events.lock().clone()
    }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<ProxyEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn transfers(&self) -> Vec<Delivery> {
        self.events
            .lock()
            .iter()
            .filter_map(ProxyEvent::as_transfer)
            .cloned()
            .collect()
    }
}

impl Proxy for RecordingProxy {
    fn transfer(&mut self, delivery: &Delivery) {
        self.events.lock().push(ProxyEvent::Transfer(delivery.clone()));
    }

    fn acquired(&mut self, transfers: &RangeSet) {
        self.events.lock().push(ProxyEvent::Acquired {
            transfers: crate::messaging::encode_ranges(transfers),
        });
    }
}

/// Proxy that forwards events to a tokio channel, for a connection writer
/// task to pick up.
#[derive(Debug, Clone)]
pub struct ChannelProxy {
    tx: mpsc::UnboundedSender<ProxyEvent>,
}

impl ChannelProxy {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProxyEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: ProxyEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("proxy receiver closed; dropping event");
        }
    }
}

impl Proxy for ChannelProxy {
    fn transfer(&mut self, delivery: &Delivery) {
        self.send(ProxyEvent::Transfer(delivery.clone()));
    }

    fn acquired(&mut self, transfers: &RangeSet) {
        self.send(ProxyEvent::Acquired {
            transfers: crate::messaging::encode_ranges(transfers),
        });
    }
}
