//! Consumer-side state of one AMQP session.
//!
//! A [`Session`] composes the consumer registry, credit ledger, prefetch
//! window and acquisition tracker, and runs delivery passes against the
//! shared queues. It is driven by a single thread of control: every method
//! takes `&mut self` and nothing inside is locked. Queues are the only shared
//! state and synchronize themselves.
//!
//! Arguments arrive already validated (typed modes, decoded ranges); see
//! [`MessageHandler`](super::MessageHandler) for the wire-level checks.

use super::delivery::{Delivery, Proxy};
use super::errors::{SessionError, SessionResult};
use crate::core::SessionConfig;
use crate::messaging::{
    dispatch_channel, AcquireMode, AcquisitionState, AcquisitionTracker, Completed,
    ConfirmMode, ConsumerRegistry, CreditLedger, CreditState, CreditUnit, DeliveryDispatcher,
    DeliveryRecord, DeliveryToken, DispatchReason, DispatchReceiver, DispatchSender, FieldTable,
    FlowMode, PrefetchLimits, PrefetchWindow, QueueHandle, QueueListener, QueueRegistry,
    QueuedMessage, RangeSet, Subscription,
};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Validated arguments of a `subscribe` command.
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub queue: String,
    /// Empty asks the session to generate a tag.
    pub destination: String,
    pub no_local: bool,
    pub confirm_mode: ConfirmMode,
    pub acquire_mode: AcquireMode,
    pub exclusive: bool,
    pub filter: FieldTable,
}

impl SubscribeRequest {
    pub fn new(queue: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            destination: destination.into(),
            no_local: false,
            confirm_mode: ConfirmMode::Required,
            acquire_mode: AcquireMode::PreAcquired,
            exclusive: false,
            filter: FieldTable::new(),
        }
    }
}

pub struct Session {
    id: String,
    config: SessionConfig,
    queues: Arc<QueueRegistry>,
    consumers: ConsumerRegistry,
    credit: CreditLedger,
    prefetch: PrefetchWindow,
    tracker: AcquisitionTracker,
    dispatcher: DeliveryDispatcher,
    dispatch_tx: DispatchSender,
    dispatch_rx: DispatchReceiver,
    proxy: Box<dyn Proxy>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("consumers", &self.consumers.len())
            .field("records", &self.tracker.len())
            .finish()
    }
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        config: SessionConfig,
        queues: Arc<QueueRegistry>,
        proxy: Box<dyn Proxy>,
    ) -> Self {
        let id = id.into();
        let (dispatch_tx, dispatch_rx) = dispatch_channel();
        Self {
            consumers: ConsumerRegistry::new(config.tag_prefix.clone()),
            credit: CreditLedger::new(),
            prefetch: PrefetchWindow::new(config.prefetch_limits()),
            tracker: AcquisitionTracker::new(),
            dispatcher: DeliveryDispatcher::new(id.clone()),
            dispatch_tx,
            dispatch_rx,
            id,
            config,
            queues,
            proxy,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn consumers(&self) -> &ConsumerRegistry {
        &self.consumers
    }

    pub fn subscription(&self, tag: &str) -> Option<&Subscription> {
        self.consumers.get(tag)
    }

    pub fn credit(&self, tag: &str) -> Option<&CreditState> {
        self.credit.state(tag)
    }

    pub fn tracker(&self) -> &AcquisitionTracker {
        &self.tracker
    }

    pub fn prefetch(&self) -> &PrefetchWindow {
        &self.prefetch
    }

    pub fn record(&self, sequence: u64) -> Option<&DeliveryRecord> {
        self.tracker.get(sequence)
    }

    // -----------------------------------------------------------------------
    // Consumers
    // -----------------------------------------------------------------------

    /// Register a consumer. Returns the tag it was registered under.
    pub fn subscribe(&mut self, request: SubscribeRequest) -> SessionResult<String> {
        let queue = self.resolve(&request.queue)?;
        let tag = if request.destination.is_empty() {
            self.consumers.generate_tag()
        } else if self.consumers.contains(&request.destination) {
            return Err(SessionError::ConflictingConsumer(request.destination));
        } else {
            request.destination
        };

        let listener_id = format!("{}/{}", self.id, tag);
        queue.add_consumer(
            QueueListener {
                id: listener_id.clone(),
                sender: self.dispatch_tx.clone(),
            },
            request.exclusive,
        )?;

        let subscription = Subscription {
            tag: tag.clone(),
            queue: queue.clone(),
            listener_id: listener_id.clone(),
            token: DeliveryToken::new(
                tag.clone(),
                request.confirm_mode.code(),
                request.acquire_mode.code(),
            ),
            acquire_mode: request.acquire_mode,
            confirm_mode: request.confirm_mode,
            exclusive: request.exclusive,
            no_local: request.no_local,
            filter: request.filter,
            browse_cursor: None,
        };
        if let Err(err) = self.consumers.insert(subscription) {
            queue.remove_consumer(&listener_id);
            return Err(err.into());
        }
        self.credit.open(&tag);
        self.credit
            .set_mode(&tag, self.config.default_flow_mode.flow_mode())?;

        info!(
            session = %self.id,
            destination = %tag,
            queue = %queue.name(),
            acquire_mode = request.acquire_mode.code(),
            confirm_mode = request.confirm_mode.code(),
            exclusive = request.exclusive,
            "consumer subscribed"
        );
        self.dispatcher
            .trigger(queue.as_ref(), DispatchReason::NewConsumer);
        Ok(tag)
    }

    /// Remove a consumer. Unknown tags are ignored.
    ///
    /// Messages the consumer saw without acquiring are released; acquired
    /// ones stay tracked until acknowledged, released or recovered.
    pub fn cancel(&mut self, tag: &str) {
        let Some(subscription) = self.consumers.remove(tag) else {
            debug!(session = %self.id, destination = %tag, "cancel for unknown destination");
            return;
        };
        subscription.queue.remove_consumer(&subscription.listener_id);
        self.credit.close(tag);
        let released = self.tracker.release_destination(tag, true);
        info!(
            session = %self.id,
            destination = %tag,
            queue = %subscription.queue.name(),
            released = released.len(),
            "consumer cancelled"
        );
        self.complete(released, DispatchReason::Released);
    }

    /// One-shot pull of a single message, pre-acquired.
    ///
    /// Ignores subscription credit. Returns whether a message was sent.
    /// A queue held exclusively by another session refuses the pull.
    pub fn get(&mut self, queue: &str, destination: &str, no_ack: bool) -> SessionResult<bool> {
        let queue = self.resolve(queue)?;
        if let Some(holder) = queue.exclusive_holder() {
            if !self.owns_listener(&holder) {
                return Err(SessionError::ResourceLocked(format!(
                    "queue {} has an exclusive consumer",
                    queue.name()
                )));
            }
        }
        if !no_ack && !self.has_record_room() {
            debug!(session = %self.id, destination, "get refused: delivery record cap reached");
            return Ok(false);
        }
        let Some(queued) = queue.take_next(&mut |_| true) else {
            return Ok(false);
        };

        let token = DeliveryToken::new(
            destination,
            if no_ack { 0 } else { 1 },
            AcquireMode::PreAcquired.code(),
        );
        let sequence = self.tracker.allocate_sequence();
        if no_ack {
            queue.dequeue(queued.position);
        } else {
            self.prefetch.record_delivery(queued.size());
            self.tracker.track(DeliveryRecord {
                sequence,
                token: token.clone(),
                queue: queue.clone(),
                position: queued.position,
                message: queued.message.clone(),
                state: AcquisitionState::Acquired,
                confirm_required: true,
                delivery_count: 1,
            });
        }
        self.send(Delivery {
            sequence,
            token,
            queue: queue.name().to_string(),
            message: queued.message,
            redelivered: queued.redelivered,
            acquired: true,
        });
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Flow control
    // -----------------------------------------------------------------------

    pub fn flow(&mut self, destination: &str, unit: CreditUnit, value: u32) -> SessionResult<()> {
        let queue = self.queue_of(destination)?;
        self.credit.grant(destination, unit, value)?;
        trace!(session = %self.id, destination, ?unit, value, "credit granted");
        self.dispatcher
            .trigger(queue.as_ref(), DispatchReason::CreditGranted);
        Ok(())
    }

    pub fn set_flow_mode(&mut self, destination: &str, mode: FlowMode) -> SessionResult<()> {
        let queue = self.queue_of(destination)?;
        self.credit.set_mode(destination, mode)?;
        debug!(session = %self.id, destination, mode = mode.as_str(), "flow mode changed");
        self.dispatcher
            .trigger(queue.as_ref(), DispatchReason::CreditGranted);
        Ok(())
    }

    /// Deliver whatever current credit allows, then drop the rest.
    pub fn flush(&mut self, destination: &str) -> SessionResult<usize> {
        self.queue_of(destination)?;
        let mut delivered = 0;
        while self.deliver_one(destination) {
            delivered += 1;
        }
        self.credit.exhaust(destination)?;
        debug!(session = %self.id, destination, delivered, "destination flushed");
        Ok(delivered)
    }

    pub fn stop(&mut self, destination: &str) -> SessionResult<()> {
        self.queue_of(destination)?;
        self.credit.stop(destination)?;
        debug!(session = %self.id, destination, "destination stopped");
        Ok(())
    }

    /// Replace the session prefetch window.
    pub fn qos(&mut self, limits: PrefetchLimits) {
        self.prefetch.set_limits(limits);
        debug!(
            session = %self.id,
            prefetch_count = limits.count,
            prefetch_size = limits.size,
            "prefetch limits updated"
        );
        for queue in self.subscribed_queues() {
            self.dispatcher
                .trigger(queue.as_ref(), DispatchReason::CreditGranted);
        }
    }

    // -----------------------------------------------------------------------
    // Acquisition
    // -----------------------------------------------------------------------

    /// Acquire delivered-unacquired messages and report the result to the
    /// peer.
    pub fn acquire(&mut self, transfers: &RangeSet) -> RangeSet {
        let (acquired, completed) = self.tracker.acquire(transfers);
        debug!(session = %self.id, requested = %transfers, acquired = %acquired, "acquire");
        self.complete(completed, DispatchReason::CreditGranted);
        self.proxy.acquired(&acquired);
        acquired
    }

    pub fn release(&mut self, transfers: &RangeSet) {
        let released = self.tracker.release(transfers);
        debug!(session = %self.id, transfers = %transfers, released = released.len(), "release");
        self.complete(released, DispatchReason::Released);
    }

    pub fn reject(&mut self, transfers: &RangeSet, code: u16, text: &str) {
        let rejected = self.tracker.reject(transfers, code, text);
        debug!(
            session = %self.id,
            transfers = %transfers,
            rejected = rejected.len(),
            code,
            text,
            "reject"
        );
        self.complete(rejected, DispatchReason::CreditGranted);
    }

    /// Complete deliveries: acquired messages leave their queues, browsed
    /// ones are forgotten. Either way the window reopens.
    pub fn acknowledge(&mut self, transfers: &RangeSet) {
        let acknowledged = self.tracker.acknowledge(transfers);
        trace!(session = %self.id, transfers = %transfers, acknowledged = acknowledged.len(), "acknowledge");
        self.complete(acknowledged, DispatchReason::CreditGranted);
    }

    /// Requeue every acquired message, or send each one again marked
    /// redelivered.
    pub fn recover(&mut self, requeue: bool) {
        if requeue {
            let released = self.tracker.release_acquired();
            info!(session = %self.id, released = released.len(), "recover with requeue");
            self.complete(released, DispatchReason::Recovered);
            return;
        }

        let acquired = self.tracker.acquired();
        info!(session = %self.id, resent = acquired.len(), "recover");
        for sequence in acquired {
            let Some(record) = self.tracker.mark_redelivered(sequence) else {
                continue;
            };
            let delivery = Delivery {
                sequence,
                token: record.token.clone(),
                queue: record.queue.name().to_string(),
                message: record.message.clone(),
                redelivered: true,
                acquired: true,
            };
            self.send(delivery);
        }
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    /// Run a delivery pass for every queue that asked for one since the last
    /// call. Returns the number of messages sent.
    pub fn dispatch_pending(&mut self) -> usize {
        self.dispatch_rx
            .drain()
            .into_iter()
            .map(|request| self.deliver_from(&request.queue))
            .sum()
    }

    /// Wait for a dispatch request, then run every pending pass.
    pub async fn next_dispatch(&mut self) -> Option<usize> {
        let request = self.dispatch_rx.recv().await?;
        let delivered = self.deliver_from(&request.queue);
        Some(delivered + self.dispatch_pending())
    }

    /// Round-robin delivery to this session's consumers on `queue` until
    /// none of them can take another message.
    pub fn deliver_from(&mut self, queue: &str) -> usize {
        let tags = self.consumers.tags_for_queue(queue);
        let mut delivered = 0;
        loop {
            let mut progressed = false;
            for tag in &tags {
                if self.deliver_one(tag) {
                    delivered += 1;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        if delivered > 0 {
            trace!(session = %self.id, queue, delivered, "delivery pass");
        }
        delivered
    }

    /// Try to send one message to `tag`.
    fn deliver_one(&mut self, tag: &str) -> bool {
        // Re-read the registry: a cancelled tag never receives anything.
        let Some(subscription) = self.consumers.get(tag) else {
            return false;
        };
        let queue = subscription.queue.clone();
        let token = subscription.token.clone();
        let pre_acquired = subscription.acquire_mode == AcquireMode::PreAcquired;
        let confirm_required = subscription.confirm_mode.is_required();
        let tracked = !pre_acquired || confirm_required;
        if tracked && !self.has_record_room() {
            return false;
        }

        let queued = {
            let credit = &self.credit;
            let prefetch = &self.prefetch;
            let session_id = self.id.as_str();
            let mut accept = |candidate: &QueuedMessage| {
                let message = &candidate.message;
                message.matches(&subscription.filter)
                    && !(subscription.no_local && message.origin.as_deref() == Some(session_id))
                    && credit.can_deliver(tag, candidate.size())
                    && (!tracked || prefetch.admits(candidate.size()))
            };
            if pre_acquired {
                queue.take_next(&mut accept)
            } else {
                queue.browse_next(subscription.browse_cursor, &mut accept)
            }
        };
        let Some(queued) = queued else {
            return false;
        };

        let size = queued.size();
        if !self.credit.try_consume(tag, size) {
            if pre_acquired {
                queue.release(queued.position);
            }
            return false;
        }
        if !pre_acquired {
            if let Some(subscription) = self.consumers.get_mut(tag) {
                subscription.browse_cursor = Some(queued.position);
            }
        }

        let sequence = self.tracker.allocate_sequence();
        if tracked {
            self.prefetch.record_delivery(size);
            self.tracker.track(DeliveryRecord {
                sequence,
                token: token.clone(),
                queue: queue.clone(),
                position: queued.position,
                message: queued.message.clone(),
                state: if pre_acquired {
                    AcquisitionState::Acquired
                } else {
                    AcquisitionState::DeliveredUnacquired
                },
                confirm_required,
                delivery_count: 1,
            });
        } else {
            // Pre-acquired without confirmation: complete on send.
            queue.dequeue(queued.position);
            self.credit.replenish(tag, size);
        }

        debug!(
            session = %self.id,
            destination = %tag,
            queue = %queue.name(),
            sequence,
            position = queued.position,
            redelivered = queued.redelivered,
            "message delivered"
        );
        self.send(Delivery {
            sequence,
            token,
            queue: queue.name().to_string(),
            message: queued.message,
            redelivered: queued.redelivered,
            acquired: pre_acquired,
        });
        true
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Detach from every queue and release everything still tracked.
    ///
    /// Safe to call more than once.
    pub fn close(&mut self) {
        for tag in self.consumers.tags() {
            if let Some(subscription) = self.consumers.remove(&tag) {
                subscription.queue.remove_consumer(&subscription.listener_id);
                self.credit.close(&tag);
            }
        }
        let released = self.tracker.release_all();
        if !released.is_empty() {
            info!(session = %self.id, released = released.len(), "session closed with outstanding deliveries");
        }
        self.complete(released, DispatchReason::Released);
        self.prefetch.reset();
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn resolve(&self, queue: &str) -> SessionResult<QueueHandle> {
        self.queues
            .resolve(queue)
            .ok_or_else(|| SessionError::NotFound(format!("queue {queue}")))
    }

    fn queue_of(&self, destination: &str) -> SessionResult<QueueHandle> {
        self.consumers
            .get(destination)
            .map(|s| s.queue.clone())
            .ok_or_else(|| SessionError::NotFound(format!("destination {destination}")))
    }

    fn subscribed_queues(&self) -> Vec<QueueHandle> {
        let mut queues: Vec<QueueHandle> = Vec::new();
        for tag in self.consumers.tags() {
            if let Some(subscription) = self.consumers.get(&tag) {
                if !queues.iter().any(|q| q.name() == subscription.queue.name()) {
                    queues.push(subscription.queue.clone());
                }
            }
        }
        queues
    }

    /// Listener ids are `<session>/<tag>`.
    fn owns_listener(&self, listener_id: &str) -> bool {
        listener_id
            .strip_prefix(self.id.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }

    fn has_record_room(&self) -> bool {
        self.config.max_delivery_records == 0
            || self.tracker.len() < self.config.max_delivery_records
    }

    fn send(&mut self, delivery: Delivery) {
        self.proxy.transfer(&delivery);
    }

    /// Return credit for records that left the outstanding set and wake the
    /// queues they came from.
    fn complete(&mut self, completed: Completed, reason: DispatchReason) {
        let mut queues: Vec<QueueHandle> = Vec::new();
        for (record, completion) in completed {
            self.prefetch.record_completion(record.size());
            self.credit.replenish(record.destination(), record.size());
            trace!(
                session = %self.id,
                sequence = record.sequence,
                destination = %record.destination(),
                ?completion,
                "delivery completed"
            );
            if !queues.iter().any(|q| q.name() == record.queue.name()) {
                queues.push(record.queue);
            }
        }
        for queue in queues {
            self.dispatcher.trigger(queue.as_ref(), reason);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
