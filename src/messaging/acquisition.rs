//! Per-session delivery records and their acquisition lifecycle.
//!
//! Every message handed to a consumer gets a session sequence number and a
//! [`DeliveryRecord`]:
//!
//! ```text
//! DeliveredUnacquired -> Acquired -> (Released | Rejected | acknowledged)
//!          \-------------------------^
//! ```
//!
//! Released and rejected records are removed immediately. Bulk operations
//! take a [`RangeSet`]; sequence numbers without a record in a suitable state
//! are skipped, since concurrent consumers routinely race on the same
//! ranges.

use crate::messaging::consumers::DeliveryToken;
use crate::messaging::queue::{Message, QueueHandle};
use crate::messaging::ranges::RangeSet;
use std::collections::BTreeMap;
use std::fmt;

/// Acquisition state of a tracked delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    /// Sent to the consumer; the queue still offers it to others.
    DeliveredUnacquired,
    /// Owned by this session until acknowledged, released or rejected.
    Acquired,
}

/// How a record left the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Released,
    Rejected,
    Acknowledged,
}

/// One message handed to one consumer.
#[derive(Clone)]
pub struct DeliveryRecord {
    pub sequence: u64,
    /// Token the message was sent with; `recover` re-sends through it.
    pub token: DeliveryToken,
    pub queue: QueueHandle,
    pub position: u64,
    pub message: Message,
    pub state: AcquisitionState,
    /// Whether removal waits for an acknowledgement.
    pub confirm_required: bool,
    pub delivery_count: u32,
}

impl fmt::Debug for DeliveryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryRecord")
            .field("sequence", &self.sequence)
            .field("destination", &self.token.destination)
            .field("queue", &self.queue.name())
            .field("position", &self.position)
            .field("state", &self.state)
            .finish()
    }
}

impl DeliveryRecord {
    pub fn destination(&self) -> &str {
        &self.token.destination
    }

    pub fn size(&self) -> u64 {
        self.message.size()
    }
}

/// Records removed by a bulk operation, with how each one completed.
pub type Completed = Vec<(DeliveryRecord, Completion)>;

/// Delivery records owned by a session, keyed by sequence number.
#[derive(Debug, Default)]
pub struct AcquisitionTracker {
    records: BTreeMap<u64, DeliveryRecord>,
    next_sequence: u64,
}

impl AcquisitionTracker {
    pub fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            next_sequence: 1,
        }
    }

    /// Reserve the next sequence number.
    ///
    /// Deliveries that complete at once (pre-acquired, no confirmation) use
    /// a number without ever creating a record.
    pub fn allocate_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    /// Track a delivery under a sequence number from
    /// [`allocate_sequence`](Self::allocate_sequence).
    pub fn track(&mut self, record: DeliveryRecord) {
        self.records.insert(record.sequence, record);
    }

    pub fn get(&self, sequence: u64) -> Option<&DeliveryRecord> {
        self.records.get(&sequence)
    }

    pub fn state(&self, sequence: u64) -> Option<AcquisitionState> {
        self.records.get(&sequence).map(|r| r.state)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sequence numbers currently acquired, ascending.
    pub fn acquired(&self) -> Vec<u64> {
        self.records
            .values()
            .filter(|r| r.state == AcquisitionState::Acquired)
            .map(|r| r.sequence)
            .collect()
    }

    pub fn records_for<'a>(
        &'a self,
        destination: &'a str,
    ) -> impl Iterator<Item = &'a DeliveryRecord> {
        self.records
            .values()
            .filter(move |r| r.destination() == destination)
    }

    /// Acquire every delivered-unacquired record in `ranges`.
    ///
    /// Returns the normalized set actually acquired, and the records that
    /// completed immediately because no confirmation was required.
    pub fn acquire(&mut self, ranges: &RangeSet) -> (RangeSet, Completed) {
        let mut acquired = RangeSet::new();
        let mut completed = Vec::new();

        for seq in self.matching(ranges, |r| r.state == AcquisitionState::DeliveredUnacquired) {
            let Some(record) = self.records.get_mut(&seq) else {
                continue;
            };
            if !record.queue.acquire(record.position) {
                // Another consumer won the race for this message.
                continue;
            }
            record.state = AcquisitionState::Acquired;
            acquired.insert(seq);

            if !record.confirm_required {
                if let Some(record) = self.records.remove(&seq) {
                    record.queue.dequeue(record.position);
                    completed.push((record, Completion::Acknowledged));
                }
            }
        }

        (acquired, completed)
    }

    /// Release tracked records in `ranges` back to their queues.
    pub fn release(&mut self, ranges: &RangeSet) -> Completed {
        self.matching(ranges, |_| true)
            .into_iter()
            .filter_map(|seq| self.release_one(seq))
            .collect()
    }

    /// Reject tracked records in `ranges`; the queue dead-letters them.
    pub fn reject(&mut self, ranges: &RangeSet, code: u16, text: &str) -> Completed {
        let mut completed = Vec::new();
        for seq in self.matching(ranges, |_| true) {
            let Some(record) = self.records.get(&seq) else {
                continue;
            };
            if record.state == AcquisitionState::DeliveredUnacquired
                && !record.queue.acquire(record.position)
            {
                // Held elsewhere; not ours to reject.
                continue;
            }
            if let Some(record) = self.records.remove(&seq) {
                record.queue.reject(record.position, code, text);
                completed.push((record, Completion::Rejected));
            }
        }
        completed
    }

    /// Complete tracked records in `ranges`.
    ///
    /// Acquired records are removed from their queues. Unacquired ones are
    /// only forgotten: the message stays with the queue (or with whichever
    /// session acquired it), but its window and prefetch share come back.
    pub fn acknowledge(&mut self, ranges: &RangeSet) -> Completed {
        let mut completed = Vec::new();
        for seq in self.matching(ranges, |_| true) {
            if let Some(record) = self.records.remove(&seq) {
                if record.state == AcquisitionState::Acquired {
                    record.queue.dequeue(record.position);
                }
                completed.push((record, Completion::Acknowledged));
            }
        }
        completed
    }

    /// Release every acquired record.
    pub fn release_acquired(&mut self) -> Completed {
        self.acquired()
            .into_iter()
            .filter_map(|seq| self.release_one(seq))
            .collect()
    }

    /// Release records belonging to `destination`. With `unacquired_only`,
    /// acquired records stay tracked.
    pub fn release_destination(&mut self, destination: &str, unacquired_only: bool) -> Completed {
        let targets: Vec<u64> = self
            .records_for(destination)
            .filter(|r| !unacquired_only || r.state == AcquisitionState::DeliveredUnacquired)
            .map(|r| r.sequence)
            .collect();
        targets
            .into_iter()
            .filter_map(|seq| self.release_one(seq))
            .collect()
    }

    /// Release everything (session teardown).
    pub fn release_all(&mut self) -> Completed {
        let targets: Vec<u64> = self.records.keys().copied().collect();
        targets
            .into_iter()
            .filter_map(|seq| self.release_one(seq))
            .collect()
    }

    /// Bump the delivery count of a record being sent again.
    pub fn mark_redelivered(&mut self, sequence: u64) -> Option<&DeliveryRecord> {
        let record = self.records.get_mut(&sequence)?;
        record.delivery_count = record.delivery_count.saturating_add(1);
        Some(record)
    }

    fn release_one(&mut self, seq: u64) -> Option<(DeliveryRecord, Completion)> {
        let record = self.records.remove(&seq)?;
        if record.state == AcquisitionState::Acquired {
            record.queue.release(record.position);
        }
        Some((record, Completion::Released))
    }

    /// Tracked sequence numbers inside `ranges` whose record satisfies `pred`.
    fn matching(&self, ranges: &RangeSet, pred: impl Fn(&DeliveryRecord) -> bool) -> Vec<u64> {
        let mut seqs = Vec::new();
        for range in ranges.ranges() {
            seqs.extend(
                self.records
                    .range(range.start()..=range.end())
                    .filter(|(_, r)| pred(r))
                    .map(|(seq, _)| *seq),
            );
        }
        seqs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::queue::{MemoryQueue, Message, Queue};
    use crate::messaging::ranges::decode_ranges;
    use std::sync::Arc;

    struct Fixture {
        queue: Arc<MemoryQueue>,
        tracker: AcquisitionTracker,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                queue: Arc::new(MemoryQueue::new("q")),
                tracker: AcquisitionTracker::new(),
            }
        }

        /// Browse-deliver one new message, not acquired.
        fn deliver_unacquired(&mut self, confirm_required: bool) -> u64 {
            let position = self.queue.enqueue(Message::new("m"));
            self.track(position, AcquisitionState::DeliveredUnacquired, confirm_required)
        }

        /// Take-deliver one new message, pre-acquired.
        fn deliver_acquired(&mut self) -> u64 {
            let position = self.queue.enqueue(Message::new("m"));
            assert!(self.queue.acquire(position));
            self.track(position, AcquisitionState::Acquired, true)
        }

        fn track(&mut self, position: u64, state: AcquisitionState, confirm_required: bool) -> u64 {
            let sequence = self.tracker.allocate_sequence();
            self.tracker.track(DeliveryRecord {
                sequence,
                token: DeliveryToken::new("c1", u8::from(confirm_required), 0),
                queue: self.queue.clone(),
                position,
                message: Message::new("m"),
                state,
                confirm_required,
                delivery_count: 1,
            });
            sequence
        }
    }

    fn ranges(flat: &[u64]) -> RangeSet {
        decode_ranges(flat).unwrap()
    }

    #[test]
    fn test_acquire_returns_only_transitioned() {
        let mut fx = Fixture::new();
        let s1 = fx.deliver_acquired();
        let s2 = fx.deliver_unacquired(true);
        let s3 = fx.deliver_unacquired(true);
        assert_eq!((s1, s2, s3), (1, 2, 3));

        let (acquired, completed) = fx.tracker.acquire(&ranges(&[1, 4]));
        assert_eq!(acquired, ranges(&[2, 3]));
        assert!(completed.is_empty());
        assert_eq!(fx.tracker.state(2), Some(AcquisitionState::Acquired));
    }

    #[test]
    fn test_acquire_is_idempotent() {
        let mut fx = Fixture::new();
        fx.deliver_unacquired(true);
        let (first, _) = fx.tracker.acquire(&ranges(&[1, 1]));
        assert_eq!(first.len(), 1);
        let (second, _) = fx.tracker.acquire(&ranges(&[1, 1]));
        assert!(second.is_empty());
    }

    #[test]
    fn test_acquire_loses_race_to_other_session() {
        let mut fx = Fixture::new();
        let seq = fx.deliver_unacquired(true);
        let position = fx.tracker.get(seq).unwrap().position;
        // Someone else takes it first.
        assert!(fx.queue.acquire(position));

        let (acquired, _) = fx.tracker.acquire(&ranges(&[seq, seq]));
        assert!(acquired.is_empty());
        assert_eq!(
            fx.tracker.state(seq),
            Some(AcquisitionState::DeliveredUnacquired)
        );
    }

    #[test]
    fn test_acquire_without_confirmation_completes() {
        let mut fx = Fixture::new();
        let seq = fx.deliver_unacquired(false);
        let (acquired, completed) = fx.tracker.acquire(&ranges(&[seq, seq]));
        assert!(acquired.contains(seq));
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].1, Completion::Acknowledged);
        assert!(fx.tracker.is_empty());
        assert!(fx.queue.is_empty());
    }

    #[test]
    fn test_release_returns_acquired_to_queue() {
        let mut fx = Fixture::new();
        let seq = fx.deliver_acquired();
        assert_eq!(fx.queue.depth(), 0);

        let released = fx.tracker.release(&ranges(&[seq, seq, 40, 50]));
        assert_eq!(released.len(), 1);
        assert_eq!(fx.queue.depth(), 1);
        assert!(fx.tracker.get(seq).is_none());
    }

    #[test]
    fn test_reject_is_terminal() {
        let mut fx = Fixture::new();
        let seq = fx.deliver_unacquired(true);
        let rejected = fx.tracker.reject(&ranges(&[seq, seq]), 3, "poison");
        assert_eq!(rejected.len(), 1);
        assert_eq!(fx.queue.dead_letters().len(), 1);

        let (acquired, _) = fx.tracker.acquire(&ranges(&[seq, seq]));
        assert!(acquired.is_empty());
    }

    #[test]
    fn test_reject_skips_message_held_elsewhere() {
        let mut fx = Fixture::new();
        let seq = fx.deliver_unacquired(true);
        let position = fx.tracker.get(seq).unwrap().position;
        assert!(fx.queue.acquire(position));

        assert!(fx.tracker.reject(&ranges(&[seq, seq]), 0, "").is_empty());
        assert!(fx.queue.dead_letters().is_empty());
    }

    #[test]
    fn test_acknowledge_dequeues_acquired_and_forgets_unacquired() {
        let mut fx = Fixture::new();
        let acquired = fx.deliver_acquired();
        let unacquired = fx.deliver_unacquired(true);

        let done = fx.tracker.acknowledge(&ranges(&[1, 2]));
        assert_eq!(done.len(), 2);
        assert_eq!(done[0].0.sequence, acquired);
        assert_eq!(done[1].0.sequence, unacquired);
        assert!(fx.tracker.is_empty());
        // Only the acquired entry left the queue.
        assert_eq!(fx.queue.len(), 1);
        assert_eq!(fx.queue.depth(), 1);
    }

    #[test]
    fn test_release_destination_keeps_acquired() {
        let mut fx = Fixture::new();
        let acquired = fx.deliver_acquired();
        fx.deliver_unacquired(true);

        let released = fx.tracker.release_destination("c1", true);
        assert_eq!(released.len(), 1);
        assert_eq!(fx.tracker.acquired(), vec![acquired]);

        assert_eq!(fx.tracker.release_all().len(), 1);
        assert!(fx.tracker.is_empty());
        assert_eq!(fx.queue.depth(), 2);
    }

    #[test]
    fn test_mark_redelivered() {
        let mut fx = Fixture::new();
        let seq = fx.deliver_acquired();
        assert_eq!(fx.tracker.mark_redelivered(seq).unwrap().delivery_count, 2);
        assert!(fx.tracker.mark_redelivered(99).is_none());
    }
}
