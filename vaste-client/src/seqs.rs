//! Range-compacted set of applied frame sequence numbers.
//!
//! Backs the persisted `applied_chunk_seqs` state and the `chunk_have`
//! resume manifest. Kept as sorted disjoint inclusive ranges so long
//! sessions do not grow it one integer at a time, and capped so it
//! cannot grow without bound.

use serde::{Deserialize, Serialize};
use vaste_protocol::SeqRange;

/// Ranges kept before the lowest are evicted.
const MAX_RANGES: usize = 4096;

/// A compact set of `u32` sequence numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqSet {
    ranges: Vec<SeqRange>,
}

impl SeqSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the set contains `seq`.
    #[must_use]
    pub fn contains(&self, seq: u32) -> bool {
        self.ranges
            .binary_search_by(|range| {
                if range.to < seq {
                    std::cmp::Ordering::Less
                } else if range.from > seq {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    /// Inserts `seq`, merging into adjacent ranges.
    pub fn insert(&mut self, seq: u32) {
        let index = self.ranges.partition_point(|range| range.to < seq);

        // Inside an existing range?
        if index < self.ranges.len() && self.ranges[index].from <= seq {
            return;
        }

        let extends_left = index > 0 && self.ranges[index - 1].to + 1 == seq;
        let extends_right =
            index < self.ranges.len() && seq + 1 == self.ranges[index].from;
        match (extends_left, extends_right) {
            (true, true) => {
                self.ranges[index - 1].to = self.ranges[index].to;
                self.ranges.remove(index);
            }
            (true, false) => self.ranges[index - 1].to = seq,
            (false, true) => self.ranges[index].from = seq,
            (false, false) => self.ranges.insert(index, SeqRange { from: seq, to: seq }),
        }

        while self.ranges.len() > MAX_RANGES {
            self.ranges.remove(0);
        }
    }

    /// Number of ranges.
    #[must_use]
    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Splits into the singleton seqs and the real runs, the shape the
    /// `chunk_have` message carries.
    #[must_use]
    pub fn manifest(&self) -> (Vec<u32>, Vec<SeqRange>) {
        let mut seqs = Vec::new();
        let mut ranges = Vec::new();
        for range in &self.ranges {
            if range.from == range.to {
                seqs.push(range.from);
            } else {
                ranges.push(*range);
            }
        }
        (seqs, ranges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserts_merge_into_runs() {
        let mut set = SeqSet::new();
        for seq in [1, 3, 2, 7, 5] {
            set.insert(seq);
        }
        assert_eq!(set.range_count(), 3);
        assert!(set.contains(2));
        assert!(!set.contains(4));
        assert!(set.contains(7));

        let (seqs, ranges) = set.manifest();
        assert_eq!(seqs, vec![5, 7]);
        assert_eq!(ranges, vec![SeqRange { from: 1, to: 3 }]);

        // 4 and 6 bridge everything into one run.
        set.insert(4);
        set.insert(6);
        assert_eq!(set.range_count(), 1);
        let (seqs, ranges) = set.manifest();
        assert!(seqs.is_empty());
        assert_eq!(ranges, vec![SeqRange { from: 1, to: 7 }]);
    }

    #[test]
    fn duplicate_inserts_are_idempotent() {
        let mut set = SeqSet::new();
        set.insert(10);
        set.insert(10);
        assert_eq!(set.range_count(), 1);
    }

    #[test]
    fn cap_evicts_lowest_ranges() {
        let mut set = SeqSet::new();
        // Every even seq is its own range.
        for seq in 0..=(MAX_RANGES as u32) {
            set.insert(seq * 2);
        }
        assert_eq!(set.range_count(), MAX_RANGES);
        assert!(!set.contains(0), "lowest range evicted");
        assert!(set.contains(MAX_RANGES as u32 * 2));
    }

    #[test]
    fn survives_serde_roundtrip() {
        let mut set = SeqSet::new();
        set.insert(1);
        set.insert(2);
        set.insert(9);
        let json = serde_json::to_string(&set).expect("serializes");
        let restored: SeqSet = serde_json::from_str(&json).expect("parses");
        assert_eq!(restored, set);
    }
}
