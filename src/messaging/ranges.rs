//! Sequence-number ranges exchanged with the peer.
//!
//! Acquire, release and reject carry their targets as a flat list of
//! sequence numbers read in `start, end` pairs. This module turns that wire
//! form into a normalized [`RangeSet`] (sorted, coalesced, non-overlapping)
//! and back again.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Sequence Range
// ---------------------------------------------------------------------------

/// Closed interval `[start, end]` over the session's delivery sequence space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceRange {
    start: u64,
    end: u64,
}

impl SequenceRange {
    /// Build a range; a reversed pair is swapped so that `start <= end`.
    pub fn new(start: u64, end: u64) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    /// Single-element range.
    pub fn single(seq: u64) -> Self {
        Self {
            start: seq,
            end: seq,
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn contains(&self, seq: u64) -> bool {
        self.start <= seq && seq <= self.end
    }

    /// Number of sequence numbers covered.
    pub fn len(&self) -> u64 {
        (self.end - self.start).saturating_add(1)
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether `other` overlaps or directly follows this range.
    fn touches(&self, other: &SequenceRange) -> bool {
        other.start <= self.end.saturating_add(1) && self.start <= other.end.saturating_add(1)
    }
}

impl fmt::Display for SequenceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.start, self.end)
    }
}

// ---------------------------------------------------------------------------
// Range Set
// ---------------------------------------------------------------------------

/// Normalized, ascending collection of disjoint [`SequenceRange`]s.
///
/// Adjacent ranges are merged on insertion, so `[1,3]` followed by `[4,6]`
/// is stored as `[1,6]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSet {
    ranges: Vec<SequenceRange>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single sequence number.
    pub fn insert(&mut self, seq: u64) {
        self.insert_range(SequenceRange::single(seq));
    }

    /// Add a range, merging it with any overlapping or adjacent neighbours.
    pub fn insert_range(&mut self, range: SequenceRange) {
        // First range whose end reaches the new range (including adjacency).
        let first = self
            .ranges
            .partition_point(|r| r.end.saturating_add(1) < range.start);

        let mut merged = range;
        let mut last = first;
        while last < self.ranges.len() && self.ranges[last].touches(&merged) {
            let existing = self.ranges[last];
            merged = SequenceRange {
                start: merged.start.min(existing.start),
                end: merged.end.max(existing.end),
            };
            last += 1;
        }

        self.ranges.splice(first..last, std::iter::once(merged));
    }

    pub fn contains(&self, seq: u64) -> bool {
        let idx = self.ranges.partition_point(|r| r.end < seq);
        self.ranges.get(idx).is_some_and(|r| r.contains(seq))
    }

    /// Iterate the normalized ranges in ascending order.
    pub fn ranges(&self) -> impl Iterator<Item = &SequenceRange> {
        self.ranges.iter()
    }

    /// Iterate every covered sequence number in ascending order.
    pub fn sequences(&self) -> impl Iterator<Item = u64> + '_ {
        self.ranges.iter().flat_map(|r| r.start..=r.end)
    }

    /// Number of disjoint ranges.
    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    /// Number of sequence numbers covered.
    pub fn len(&self) -> u64 {
        self.ranges
            .iter()
            .fold(0u64, |acc, r| acc.saturating_add(r.len()))
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl FromIterator<SequenceRange> for RangeSet {
    fn from_iter<I: IntoIterator<Item = SequenceRange>>(iter: I) -> Self {
        let mut set = RangeSet::new();
        for range in iter {
            set.insert_range(range);
        }
        set
    }
}

impl FromIterator<u64> for RangeSet {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        let mut set = RangeSet::new();
        for seq in iter {
            set.insert(seq);
        }
        set
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (idx, range) in self.ranges.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{range}")?;
        }
        f.write_str("]")
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Errors raised while decoding a flat range list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("Received odd number of elements in list of transfers ({len})")]
    OddLength { len: usize },
}

/// Decode a flat `start, end, start, end, ...` list.
///
/// Pairs may arrive unsorted and overlapping; the result is normalized.
pub fn decode_ranges(flat: &[u64]) -> Result<RangeSet, RangeError> {
    if flat.len() % 2 != 0 {
        return Err(RangeError::OddLength { len: flat.len() });
    }
    Ok(flat
        .chunks_exact(2)
        .map(|pair| SequenceRange::new(pair[0], pair[1]))
        .collect())
}

/// Encode a set back into its flat wire form, ascending.
pub fn encode_ranges(set: &RangeSet) -> Vec<u64> {
    let mut flat = Vec::with_capacity(set.range_count() * 2);
    for range in set.ranges() {
        flat.push(range.start);
        flat.push(range.end);
    }
    flat
}
