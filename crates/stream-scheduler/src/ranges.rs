// Time Ranges: helpers over sorted, non-overlapping buffered intervals (seconds).

use serde::{Deserialize, Serialize};

/// Tolerance under which two range boundaries are considered equal.
pub const RANGE_EPSILON: f64 = 1.0 / 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time < self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn intersection(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(TimeRange { start, end })
    }
}

/// Inserts `range` into a sorted list, merging it with ranges it touches.
pub fn insert_range(ranges: &mut Vec<TimeRange>, range: TimeRange) {
    if range.end <= range.start {
        return;
    }
    let mut merged = range;
    let mut result = Vec::with_capacity(ranges.len() + 1);
    let mut inserted = false;
    for current in ranges.drain(..) {
        if current.end + RANGE_EPSILON < merged.start {
            result.push(current);
        } else if merged.end + RANGE_EPSILON < current.start {
            if !inserted {
                result.push(merged);
                inserted = true;
            }
            result.push(current);
        } else {
            merged.start = merged.start.min(current.start);
            merged.end = merged.end.max(current.end);
        }
    }
    if !inserted {
        result.push(merged);
    }
    *ranges = result;
}

/// Returns the parts of `base` not covered by any range of `excluded`.
pub fn exclude_ranges(base: &[TimeRange], excluded: &[TimeRange]) -> Vec<TimeRange> {
    let mut result = Vec::new();
    for range in base {
        let mut pieces = vec![*range];
        for cut in excluded {
            pieces = pieces
                .into_iter()
                .flat_map(|piece| {
                    if !piece.overlaps(cut) {
                        return vec![piece];
                    }
                    let mut left = Vec::with_capacity(2);
                    if piece.start < cut.start {
                        left.push(TimeRange::new(piece.start, cut.start));
                    }
                    if cut.end < piece.end {
                        left.push(TimeRange::new(cut.end, piece.end));
                    }
                    left
                })
                .collect();
        }
        result.extend(pieces);
    }
    result
}

/// Intersection of every range of `ranges` with `window`.
pub fn intersect_with(ranges: &[TimeRange], window: &TimeRange) -> Vec<TimeRange> {
    ranges
        .iter()
        .filter_map(|range| range.intersection(window))
        .collect()
}

pub fn range_containing(ranges: &[TimeRange], time: f64) -> Option<TimeRange> {
    ranges.iter().copied().find(|range| range.contains(time))
}

/// Distance from `time` to the start of the next range strictly after it,
/// or infinity if there is none.
pub fn next_range_gap(ranges: &[TimeRange], time: f64) -> f64 {
    ranges
        .iter()
        .find(|range| range.start > time)
        .map_or(f64::INFINITY, |range| range.start - time)
}

/// Splits `ranges` between the one containing `time` and every other one.
pub fn inner_and_outer_ranges(
    ranges: &[TimeRange],
    time: f64,
) -> (Option<TimeRange>, Vec<TimeRange>) {
    let mut inner = None;
    let mut outer = Vec::with_capacity(ranges.len());
    for range in ranges {
        if inner.is_none() && range.contains(time) {
            inner = Some(*range);
        } else {
            outer.push(*range);
        }
    }
    (inner, outer)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn arb_range() -> impl Strategy<Value = TimeRange> {
        (0.0f64..100.0, 0.01f64..20.0).prop_map(|(start, len)| TimeRange::new(start, start + len))
    }

    #[test]
    fn test_insert_merges_adjacent() {
        let mut ranges = vec![TimeRange::new(0.0, 4.0), TimeRange::new(10.0, 12.0)];
        insert_range(&mut ranges, TimeRange::new(4.0, 6.0));
        assert_eq!(ranges, vec![TimeRange::new(0.0, 6.0), TimeRange::new(10.0, 12.0)]);

        insert_range(&mut ranges, TimeRange::new(5.0, 11.0));
        assert_eq!(ranges, vec![TimeRange::new(0.0, 12.0)]);

        insert_range(&mut ranges, TimeRange::new(20.0, 22.0));
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[1], TimeRange::new(20.0, 22.0));
    }

    #[test]
    fn test_insert_keeps_order() {
        let mut ranges = vec![TimeRange::new(10.0, 12.0)];
        insert_range(&mut ranges, TimeRange::new(0.0, 2.0));
        assert_eq!(ranges, vec![TimeRange::new(0.0, 2.0), TimeRange::new(10.0, 12.0)]);
    }

    #[test]
    fn test_exclude_splits() {
        let base = [TimeRange::new(0.0, 10.0)];
        let left = exclude_ranges(&base, &[TimeRange::new(3.0, 5.0)]);
        assert_eq!(left, vec![TimeRange::new(0.0, 3.0), TimeRange::new(5.0, 10.0)]);

        let left = exclude_ranges(&base, &[TimeRange::new(-1.0, 11.0)]);
        assert!(left.is_empty());
    }

    #[test]
    fn test_inner_and_outer() {
        let ranges = [TimeRange::new(0.0, 5.0), TimeRange::new(8.0, 20.0)];
        let (inner, outer) = inner_and_outer_ranges(&ranges, 9.0);
        assert_eq!(inner, Some(TimeRange::new(8.0, 20.0)));
        assert_eq!(outer, vec![TimeRange::new(0.0, 5.0)]);

        let (inner, outer) = inner_and_outer_ranges(&ranges, 6.0);
        assert!(inner.is_none());
        assert_eq!(outer.len(), 2);
    }

    #[test]
    fn test_next_range_gap() {
        let ranges = [TimeRange::new(0.0, 5.0), TimeRange::new(5.1, 9.0)];
        assert!((next_range_gap(&ranges, 5.0) - 0.1).abs() < 1e-9);
        assert!(next_range_gap(&ranges, 6.0).is_infinite());
    }

    proptest! {
        #[test]
        fn prop_insert_keeps_ranges_sorted_and_disjoint(inserted in proptest::collection::vec(arb_range(), 0..16)) {
            let mut ranges = Vec::new();
            for range in &inserted {
                insert_range(&mut ranges, *range);
            }
            for range in &ranges {
                prop_assert!(range.start < range.end);
            }
            for pair in ranges.windows(2) {
                prop_assert!(pair[0].end < pair[1].start);
            }
            for range in &inserted {
                prop_assert!(ranges.iter().any(|r| r.start <= range.start && range.end <= r.end));
            }
        }

        #[test]
        fn prop_excluded_time_never_survives(
            base in proptest::collection::vec(arb_range(), 0..8),
            excluded in proptest::collection::vec(arb_range(), 0..8),
        ) {
            let remaining = exclude_ranges(&base, &excluded);
            for range in &remaining {
                prop_assert!(range.start < range.end);
                prop_assert!(excluded.iter().all(|cut| !range.overlaps(cut)));
                prop_assert!(base.iter().any(|b| b.start <= range.start && range.end <= b.end));
            }
        }
    }
}
