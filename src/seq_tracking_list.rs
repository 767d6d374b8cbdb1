use std::collections::BTreeMap;
use crate::frag_seq::FragSeq;

/// An ordered set of fragment sequence numbers, stored as disjoint inclusive ranges.
///
/// Sequence numbers are mostly recorded in (or close to) ascending order, so the set typically
///  consists of a single range starting at 1 plus a few ranges above a gap, and memory use is
///  bounded by the number of gaps rather than the number of fragments.
#[derive(Debug, Default, Clone)]
pub struct SeqTrackingList {
    /// range start -> range end (inclusive)
    ranges: BTreeMap<u64, u64>,
}

impl SeqTrackingList {
    pub fn new() -> SeqTrackingList {
        Default::default()
    }

    pub fn is_recorded(&self, seq: FragSeq) -> bool {
        self.containing_range(seq.to_raw()).is_some()
    }

    /// Returns `true` if the sequence number was newly recorded, `false` if it was recorded
    ///  before. The unassigned sequence number is never recorded.
    pub fn record_if_not_recorded(&mut self, seq: FragSeq) -> bool {
        if !seq.is_assigned() {
            return false;
        }
        let seq = seq.to_raw();

        let left = match self.ranges.range(..=seq).next_back() {
            Some((_, &end)) if end >= seq => return false,
            Some((&start, &end)) if end + 1 == seq => Some(start),
            _ => None,
        };
        let right = seq.checked_add(1)
            .and_then(|next| self.ranges.get(&next).map(|&end| (next, end)));

        match (left, right) {
            (Some(left_start), Some((right_start, right_end))) => {
                self.ranges.remove(&right_start);
                self.ranges.insert(left_start, right_end);
            }
            (Some(left_start), None) => {
                self.ranges.insert(left_start, seq);
            }
            (None, Some((right_start, right_end))) => {
                self.ranges.remove(&right_start);
                self.ranges.insert(seq, right_end);
            }
            (None, None) => {
                self.ranges.insert(seq, seq);
            }
        }
        true
    }

    /// Removes a sequence number, splitting the range containing it if necessary. Returns
    ///  `false` if it was not recorded.
    pub fn erase(&mut self, seq: FragSeq) -> bool {
        let seq = seq.to_raw();
        let Some((start, end)) = self.containing_range(seq) else {
            return false;
        };

        self.ranges.remove(&start);
        if start < seq {
            self.ranges.insert(start, seq - 1);
        }
        if seq < end {
            self.ranges.insert(seq + 1, end);
        }
        true
    }

    /// The largest sequence number `n` such that all of `1..=n` are recorded, or 0 if 1 is not
    ///  recorded
    pub fn largest_in_order(&self) -> FragSeq {
        FragSeq::from_raw(self.ranges.get(&1).copied().unwrap_or(0))
    }

    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    fn containing_range(&self, seq: u64) -> Option<(u64, u64)> {
        self.ranges.range(..=seq).next_back()
            .filter(|&(_, &end)| end >= seq)
            .map(|(&start, &end)| (start, end))
    }

    #[cfg(test)]
    fn ranges(&self) -> Vec<(u64, u64)> {
        self.ranges.iter().map(|(&s, &e)| (s, e)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn list_with(seqs: &[u64]) -> SeqTrackingList {
        let mut list = SeqTrackingList::new();
        for &s in seqs {
            list.record_if_not_recorded(FragSeq::from_raw(s));
        }
        list
    }

    #[rstest]
    #[case::empty(vec![], 1, true, vec![(1,1)], 1)]
    #[case::unassigned(vec![], 0, false, vec![], 0)]
    #[case::duplicate(vec![1,2,3], 2, false, vec![(1,3)], 3)]
    #[case::append(vec![1,2], 3, true, vec![(1,3)], 3)]
    #[case::prepend(vec![3,4], 2, true, vec![(2,4)], 0)]
    #[case::prepend_to_first(vec![2,3], 1, true, vec![(1,3)], 3)]
    #[case::gap_above(vec![1,2], 5, true, vec![(1,2), (5,5)], 2)]
    #[case::close_gap(vec![1,2,4,5], 3, true, vec![(1,5)], 5)]
    #[case::narrow_gap(vec![1,2,5,6], 3, true, vec![(1,3), (5,6)], 3)]
    #[case::narrow_gap_from_top(vec![1,2,5,6], 4, true, vec![(1,2), (4,6)], 2)]
    #[case::isolated(vec![1,9], 5, true, vec![(1,1), (5,5), (9,9)], 1)]
    #[case::max(vec![u64::MAX-1], u64::MAX, true, vec![(u64::MAX-1, u64::MAX)], 0)]
    fn test_record(
        #[case] initial: Vec<u64>,
        #[case] seq: u64,
        #[case] expected_new: bool,
        #[case] expected_ranges: Vec<(u64, u64)>,
        #[case] expected_largest_in_order: u64,
    ) {
        let mut list = list_with(&initial);
        assert_eq!(list.record_if_not_recorded(FragSeq::from_raw(seq)), expected_new);
        assert_eq!(list.ranges(), expected_ranges);
        assert_eq!(list.largest_in_order(), FragSeq::from_raw(expected_largest_in_order));
        assert_eq!(list.range_count(), expected_ranges.len());
    }

    #[rstest]
    #[case::not_recorded(vec![1,2], 4, false, vec![(1,2)], 2)]
    #[case::single(vec![3], 3, true, vec![], 0)]
    #[case::first(vec![1,2,3], 1, true, vec![(2,3)], 0)]
    #[case::last(vec![1,2,3], 3, true, vec![(1,2)], 2)]
    #[case::middle(vec![1,2,3,4], 2, true, vec![(1,1), (3,4)], 1)]
    #[case::second_range(vec![1,2,6,7,8], 7, true, vec![(1,2), (6,6), (8,8)], 2)]
    fn test_erase(
        #[case] initial: Vec<u64>,
        #[case] seq: u64,
        #[case] expected_erased: bool,
        #[case] expected_ranges: Vec<(u64, u64)>,
        #[case] expected_largest_in_order: u64,
    ) {
        let mut list = list_with(&initial);
        assert_eq!(list.erase(FragSeq::from_raw(seq)), expected_erased);
        assert_eq!(list.ranges(), expected_ranges);
        assert_eq!(list.largest_in_order(), FragSeq::from_raw(expected_largest_in_order));
    }

    #[test]
    fn test_erase_then_record_again() {
        let mut list = list_with(&[1, 2, 3]);
        assert!(list.erase(FragSeq::from_raw(2)));
        assert!(!list.is_recorded(FragSeq::from_raw(2)));
        assert!(list.record_if_not_recorded(FragSeq::from_raw(2)));
        assert_eq!(list.ranges(), vec![(1, 3)]);
    }

    #[test]
    fn test_out_of_order_converges() {
        let list = list_with(&[5, 3, 1, 4, 2, 7, 6]);
        assert_eq!(list.ranges(), vec![(1, 7)]);
        for s in 1..=7 {
            assert!(list.is_recorded(FragSeq::from_raw(s)));
        }
        assert!(!list.is_recorded(FragSeq::from_raw(8)));
    }
}
