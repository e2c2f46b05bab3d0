//! Queue collaborator contract and an in-memory implementation.
//!
//! Queues are shared by every session that consumes from them and outlive
//! any single subscription, so sessions only hold a cloneable
//! [`QueueHandle`]. Implementations synchronize internally; each operation on
//! an entry (take, acquire, release, reject, dequeue) is atomic with respect
//! to other sessions.
//!
//! Entries are identified by their queue position. An entry is either
//! available or acquired; releasing puts it back in place with the
//! redelivered flag set.

use crate::messaging::dispatch::{DispatchReason, DispatchRequest, DispatchSender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Opaque key/value table carried through from the wire (subscription
/// filters, message headers).
pub type FieldTable = BTreeMap<String, String>;

/// Shared reference to a queue.
pub type QueueHandle = Arc<dyn Queue>;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Message content as stored by a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub headers: FieldTable,
    /// Session that published the message, for no-local consumers.
    #[serde(default)]
    pub origin: Option<String>,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_origin(mut self, session_id: impl Into<String>) -> Self {
        self.origin = Some(session_id.into());
        self
    }

    /// Size used for byte credit accounting.
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Header match: every filter entry must be present with the same value.
    /// An empty filter matches everything.
    pub fn matches(&self, filter: &FieldTable) -> bool {
        filter
            .iter()
            .all(|(key, value)| self.headers.get(key) == Some(value))
    }
}

/// A message at a queue position, as handed out by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub position: u64,
    pub message: Message,
    pub redelivered: bool,
}

impl QueuedMessage {
    pub fn size(&self) -> u64 {
        self.message.size()
    }
}

// ---------------------------------------------------------------------------
// Queue contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue {0} has an exclusive consumer")]
    ExclusivelyHeld(String),
    #[error("queue {0} already has consumers; cannot grant exclusive access")]
    ConsumersPresent(String),
}

/// A session-side consumer registered with a queue.
#[derive(Debug, Clone)]
pub struct QueueListener {
    /// Unique across sessions (session id plus consumer tag).
    pub id: String,
    pub sender: DispatchSender,
}

/// Operations a session needs from a queue.
pub trait Queue: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Append a message and wake listeners. Returns its position.
    fn enqueue(&self, message: Message) -> u64;

    /// Register a consumer, enforcing exclusivity.
    fn add_consumer(&self, listener: QueueListener, exclusive: bool) -> Result<(), QueueError>;

    /// Deregister a consumer by listener id. Unknown ids are ignored.
    fn remove_consumer(&self, listener_id: &str);

    /// Listener id of the exclusive consumer, if the queue is held.
    fn exclusive_holder(&self) -> Option<String>;

    /// Acquire the first available entry that `accept` agrees to take.
    fn take_next(&self, accept: &mut dyn FnMut(&QueuedMessage) -> bool)
        -> Option<QueuedMessage>;

    /// Peek the first available entry after `after` that `accept` agrees to
    /// see, leaving it available to others.
    fn browse_next(
        &self,
        after: Option<u64>,
        accept: &mut dyn FnMut(&QueuedMessage) -> bool,
    ) -> Option<QueuedMessage>;

    /// Acquire a specific entry. False if it is gone or held elsewhere.
    fn acquire(&self, position: u64) -> bool;

    /// Make an acquired entry available again. Callers trigger dispatch.
    fn release(&self, position: u64) -> bool;

    /// Remove an entry permanently, handing it to dead-letter handling.
    fn reject(&self, position: u64, code: u16, text: &str) -> bool;

    /// Remove an acknowledged entry.
    fn dequeue(&self, position: u64) -> bool;

    /// Ask every listening session to attempt delivery.
    fn request_dispatch(&self, reason: DispatchReason);

    /// Entries currently available for delivery.
    fn depth(&self) -> usize;

    fn consumer_count(&self) -> usize;
}

// ---------------------------------------------------------------------------
// In-memory queue
// ---------------------------------------------------------------------------

/// A rejected message with the diagnostics supplied by the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub position: u64,
    pub message: Message,
    pub code: u16,
    pub text: String,
}

#[derive(Debug)]
struct Entry {
    position: u64,
    message: Message,
    acquired: bool,
    redelivered: bool,
}

impl Entry {
    fn snapshot(&self) -> QueuedMessage {
        QueuedMessage {
            position: self.position,
            message: self.message.clone(),
            redelivered: self.redelivered,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryQueueInner {
    entries: VecDeque<Entry>,
    next_position: u64,
    listeners: Vec<QueueListener>,
    exclusive: bool,
    dead_letters: Vec<DeadLetter>,
}

impl MemoryQueueInner {
    fn index_of(&self, position: u64) -> Option<usize> {
        // Positions are assigned in increasing order.
        self.entries
            .binary_search_by_key(&position, |e| e.position)
            .ok()
    }
}

/// Mutex-protected in-memory queue.
#[derive(Debug)]
pub struct MemoryQueue {
    name: String,
    inner: Mutex<MemoryQueueInner>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(MemoryQueueInner {
                next_position: 1,
                ..MemoryQueueInner::default()
            }),
        }
    }

    /// Messages rejected so far.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.lock().dead_letters.clone()
    }

    /// Total entries, acquired or not.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn is_acquired(&self, position: u64) -> Option<bool> {
        let inner = self.inner.lock();
        inner.index_of(position).map(|idx| inner.entries[idx].acquired)
    }
}

impl Queue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn enqueue(&self, message: Message) -> u64 {
        let position = {
            let mut inner = self.inner.lock();
            let position = inner.next_position;
            inner.next_position += 1;
            inner.entries.push_back(Entry {
                position,
                message,
                acquired: false,
                redelivered: false,
            });
            position
        };
        self.request_dispatch(DispatchReason::Enqueued);
        position
    }

    fn add_consumer(&self, listener: QueueListener, exclusive: bool) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if inner.exclusive {
            return Err(QueueError::ExclusivelyHeld(self.name.clone()));
        }
        if exclusive && !inner.listeners.is_empty() {
            return Err(QueueError::ConsumersPresent(self.name.clone()));
        }
        inner.exclusive = exclusive;
        inner.listeners.push(listener);
        Ok(())
    }

    fn remove_consumer(&self, listener_id: &str) {
        let mut inner = self.inner.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|l| l.id != listener_id);
        if inner.listeners.len() != before {
            // Only one consumer can exist while the queue is held exclusively.
            inner.exclusive = false;
        }
    }

    fn exclusive_holder(&self) -> Option<String> {
        let inner = self.inner.lock();
        if inner.exclusive {
            inner.listeners.first().map(|l| l.id.clone())
        } else {
            None
        }
    }

    fn take_next(
        &self,
        accept: &mut dyn FnMut(&QueuedMessage) -> bool,
    ) -> Option<QueuedMessage> {
        let mut inner = self.inner.lock();
        for entry in inner.entries.iter_mut().filter(|e| !e.acquired) {
            let candidate = entry.snapshot();
            if accept(&candidate) {
                entry.acquired = true;
                return Some(candidate);
            }
        }
        None
    }

    fn browse_next(
        &self,
        after: Option<u64>,
        accept: &mut dyn FnMut(&QueuedMessage) -> bool,
    ) -> Option<QueuedMessage> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .filter(|e| !e.acquired && after.map_or(true, |after| e.position > after))
            .map(Entry::snapshot)
            .find(|candidate| accept(candidate))
    }

    fn acquire(&self, position: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.index_of(position) {
            Some(idx) if !inner.entries[idx].acquired => {
                inner.entries[idx].acquired = true;
                true
            }
            _ => false,
        }
    }

    fn release(&self, position: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.index_of(position) {
            Some(idx) if inner.entries[idx].acquired => {
                let entry = &mut inner.entries[idx];
                entry.acquired = false;
                entry.redelivered = true;
                true
            }
            _ => false,
        }
    }

    fn reject(&self, position: u64, code: u16, text: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(idx) = inner.index_of(position) else {
            return false;
        };
        if let Some(entry) = inner.entries.remove(idx) {
            tracing::debug!(queue = %self.name, position, code, text, "message dead-lettered");
            inner.dead_letters.push(DeadLetter {
                position,
                message: entry.message,
                code,
                text: text.to_string(),
            });
            return true;
        }
        false
    }

    fn dequeue(&self, position: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.index_of(position) {
            Some(idx) => inner.entries.remove(idx).is_some(),
            None => false,
        }
    }

    fn request_dispatch(&self, reason: DispatchReason) {
        let mut inner = self.inner.lock();
        inner.listeners.retain(|listener| !listener.sender.is_closed());
        for listener in &inner.listeners {
            listener.sender.send(DispatchRequest {
                queue: self.name.clone(),
                reason,
            });
        }
    }

    fn depth(&self) -> usize {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| !e.acquired)
            .count()
    }

    fn consumer_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Process-wide name to queue map shared by all sessions.
#[derive(Debug, Default)]
pub struct QueueRegistry {
    queues: RwLock<HashMap<String, QueueHandle>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an in-memory queue, or return the existing one.
    pub fn declare(&self, name: &str) -> QueueHandle {
        let mut queues = self.queues.write();
        queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::new(name)))
            .clone()
    }

    /// Register an externally implemented queue, replacing any previous one.
    pub fn insert(&self, queue: QueueHandle) {
        self.queues.write().insert(queue.name().to_string(), queue);
    }

    pub fn resolve(&self, name: &str) -> Option<QueueHandle> {
        self.queues.read().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<QueueHandle> {
        self.queues.write().remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::dispatch::dispatch_channel;

    fn listener(id: &str) -> (QueueListener, crate::messaging::dispatch::DispatchReceiver) {
        let (sender, rx) = dispatch_channel();
        (
            QueueListener {
                id: id.to_string(),
                sender,
            },
            rx,
        )
    }

    #[test]
    fn test_take_marks_acquired() {
        let queue = MemoryQueue::new("q");
        let p1 = queue.enqueue(Message::new("a"));
        let p2 = queue.enqueue(Message::new("b"));

        let taken = queue.take_next(&mut |_| true).unwrap();
        assert_eq!(taken.position, p1);
        assert_eq!(queue.depth(), 1);
        assert_eq!(queue.is_acquired(p1), Some(true));

        // Second take skips the acquired head.
        assert_eq!(queue.take_next(&mut |_| true).unwrap().position, p2);
        assert!(queue.take_next(&mut |_| true).is_none());
    }

    #[test]
    fn test_browse_leaves_entry_available() {
        let queue = MemoryQueue::new("q");
        let p1 = queue.enqueue(Message::new("a"));
        let p2 = queue.enqueue(Message::new("b"));

        assert_eq!(queue.browse_next(None, &mut |_| true).unwrap().position, p1);
        assert_eq!(queue.browse_next(Some(p1), &mut |_| true).unwrap().position, p2);
        assert!(queue.browse_next(Some(p2), &mut |_| true).is_none());
        assert_eq!(queue.depth(), 2);
    }

    #[test]
    fn test_acquire_is_exclusive() {
        let queue = MemoryQueue::new("q");
        let p = queue.enqueue(Message::new("a"));
        assert!(queue.acquire(p));
        assert!(!queue.acquire(p));
        assert!(queue.release(p));
        assert!(queue.acquire(p));
    }

    #[test]
    fn test_release_sets_redelivered() {
        let queue = MemoryQueue::new("q");
        queue.enqueue(Message::new("a"));
        let taken = queue.take_next(&mut |_| true).unwrap();
        assert!(!taken.redelivered);
        queue.release(taken.position);
        assert!(queue.take_next(&mut |_| true).unwrap().redelivered);
    }

    #[test]
    fn test_reject_dead_letters() {
        let queue = MemoryQueue::new("q");
        let p = queue.enqueue(Message::new("a"));
        assert!(queue.reject(p, 7, "bad payload"));
        assert!(queue.is_empty());
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].code, 7);
        assert_eq!(dead[0].text, "bad payload");
        assert!(!queue.reject(p, 7, "again"));
    }

    #[test]
    fn test_filter_match() {
        let msg = Message::new("x").with_header("colour", "red");
        let mut filter = FieldTable::new();
        assert!(msg.matches(&filter));
        filter.insert("colour".into(), "red".into());
        assert!(msg.matches(&filter));
        filter.insert("size".into(), "big".into());
        assert!(!msg.matches(&filter));
    }

    #[test]
    fn test_exclusive_consumers() {
        let queue = MemoryQueue::new("q");
        let (a, _rx_a) = listener("s1/a");
        let (b, _rx_b) = listener("s1/b");
        let (c, _rx_c) = listener("s2/c");

        queue.add_consumer(a, false).unwrap();
        assert_eq!(
            queue.add_consumer(b.clone(), true),
            Err(QueueError::ConsumersPresent("q".into()))
        );
        assert_eq!(queue.exclusive_holder(), None);
        queue.remove_consumer("s1/a");
        queue.add_consumer(b, true).unwrap();
        assert_eq!(queue.exclusive_holder().as_deref(), Some("s1/b"));
        assert_eq!(
            queue.add_consumer(c.clone(), false),
            Err(QueueError::ExclusivelyHeld("q".into()))
        );
        queue.remove_consumer("s1/b");
        assert_eq!(queue.exclusive_holder(), None);
        queue.add_consumer(c, false).unwrap();
        assert_eq!(queue.consumer_count(), 1);
    }

    #[test]
    fn test_enqueue_wakes_listeners() {
        let queue = MemoryQueue::new("q");
        let (a, mut rx) = listener("s1/a");
        queue.add_consumer(a, false).unwrap();
        queue.enqueue(Message::new("a"));
        let requests = rx.drain();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].reason, DispatchReason::Enqueued);
    }

    #[test]
    fn test_closed_listeners_pruned() {
        let queue = MemoryQueue::new("q");
        let (a, rx) = listener("s1/a");
        queue.add_consumer(a, false).unwrap();
        drop(rx);
        queue.request_dispatch(DispatchReason::Enqueued);
        assert_eq!(queue.consumer_count(), 0);
    }

    #[test]
    fn test_registry_declare_is_idempotent() {
        let registry = QueueRegistry::new();
        let q1 = registry.declare("orders");
        q1.enqueue(Message::new("a"));
        let q2 = registry.declare("orders");
        assert_eq!(q2.depth(), 1);
        assert!(registry.resolve("missing").is_none());
        assert_eq!(registry.names(), vec!["orders".to_string()]);
    }
}
