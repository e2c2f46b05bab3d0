//! Dispatch signalling between queues and sessions.
//!
//! A dispatch request is a hint that a queue may now be able to push messages
//! to one of its consumers. Requests travel over an unbounded tokio channel
//! from the queue to every session listening on it; the session drains them
//! on its own thread of control and runs the delivery pass. Nothing waits on
//! the outcome.

use crate::messaging::queue::Queue;
use tokio::sync::mpsc;

/// Why a dispatch attempt was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchReason {
    /// A subscription was added.
    NewConsumer,
    /// A consumer received credit or had its flow mode changed.
    CreditGranted,
    /// Messages were released back to the queue.
    Released,
    /// `recover` requeued acquired messages.
    Recovered,
    /// A producer enqueued a message.
    Enqueued,
}

impl DispatchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchReason::NewConsumer => "new_consumer",
            DispatchReason::CreditGranted => "credit_granted",
            DispatchReason::Released => "released",
            DispatchReason::Recovered => "recovered",
            DispatchReason::Enqueued => "enqueued",
        }
    }
}

/// A queue asking a session to run a delivery pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    pub queue: String,
    pub reason: DispatchReason,
}

/// Sending half handed to queues as a listener.
#[derive(Debug, Clone)]
pub struct DispatchSender {
    tx: mpsc::UnboundedSender<DispatchRequest>,
}

impl DispatchSender {
    /// Fire-and-forget. Returns false once the session side has gone away.
    pub fn send(&self, request: DispatchRequest) -> bool {
        match self.tx.send(request) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(queue = %err.0.queue, "dispatch receiver closed; dropping request");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half owned by a session.
#[derive(Debug)]
pub struct DispatchReceiver {
    rx: mpsc::UnboundedReceiver<DispatchRequest>,
}

impl DispatchReceiver {
    /// Take every pending request without waiting, one per queue, in arrival
    /// order.
    pub fn drain(&mut self) -> Vec<DispatchRequest> {
        let mut pending: Vec<DispatchRequest> = Vec::new();
        while let Ok(request) = self.rx.try_recv() {
            if !pending.iter().any(|p| p.queue == request.queue) {
                pending.push(request);
            }
        }
        pending
    }

    /// Wait for the next request.
    pub async fn recv(&mut self) -> Option<DispatchRequest> {
        self.rx.recv().await
    }
}

/// Create a connected sender/receiver pair.
pub fn dispatch_channel() -> (DispatchSender, DispatchReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DispatchSender { tx }, DispatchReceiver { rx })
}

/// Decides when a session asks a queue for a dispatch attempt.
///
/// Stateless apart from the session identity used in logs.
#[derive(Debug, Clone)]
pub struct DeliveryDispatcher {
    session_id: String,
}

impl DeliveryDispatcher {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }

    pub fn trigger(&self, queue: &dyn Queue, reason: DispatchReason) {
        tracing::trace!(
            session = %self.session_id,
            queue = %queue.name(),
            reason = reason.as_str(),
            "requesting dispatch"
        );
        queue.request_dispatch(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_coalesces_per_queue() {
        let (tx, mut rx) = dispatch_channel();
        for (queue, reason) in [
            ("q1", DispatchReason::NewConsumer),
            ("q2", DispatchReason::Enqueued),
            ("q1", DispatchReason::Released),
        ] {
            assert!(tx.send(DispatchRequest {
                queue: queue.into(),
                reason,
            }));
        }

        let drained = rx.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].queue, "q1");
        assert_eq!(drained[0].reason, DispatchReason::NewConsumer);
        assert_eq!(drained[1].queue, "q2");
        assert!(rx.drain().is_empty());
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (tx, rx) = dispatch_channel();
        drop(rx);
        assert!(tx.is_closed());
        assert!(!tx.send(DispatchRequest {
            queue: "q".into(),
            reason: DispatchReason::Enqueued,
        }));
    }

    #[tokio::test]
    async fn test_recv_waits_for_request() {
        let (tx, mut rx) = dispatch_channel();
        let handle = tokio::spawn(async move { rx.recv().await });
        tx.send(DispatchRequest {
            queue: "q".into(),
            reason: DispatchReason::CreditGranted,
        });
        let got = handle.await.unwrap().unwrap();
        assert_eq!(got.reason, DispatchReason::CreditGranted);
    }
}
