//! Splitting a scan range into provider-sized chunks.

use std::ops::RangeInclusive;

/// Iterator over inclusive sub-ranges of `[from, to]`, each at most
/// `max_range` blocks wide. Yields nothing when `from > to`.
#[derive(Debug, Clone)]
pub(crate) struct ChunkRanges {
    current: u64,
    end: u64,
    max_range: u64,
    exhausted: bool,
}

impl ChunkRanges {
    /// # Panics
    /// Panics if `max_range` is zero.
    pub(crate) fn new(from: u64, to: u64, max_range: u64) -> Self {
        assert!(max_range >= 1, "max_range must be at least 1");
        Self {
            current: from,
            end: to,
            max_range,
            exhausted: from > to,
        }
    }
}

impl Iterator for ChunkRanges {
    type Item = RangeInclusive<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        let start = self.current;
        let end = start.saturating_add(self.max_range - 1).min(self.end);

        if end == self.end {
            self.exhausted = true;
        } else {
            self.current = end + 1;
        }

        Some(start..=end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(from: u64, to: u64, max_range: u64) -> Vec<RangeInclusive<u64>> {
        ChunkRanges::new(from, to, max_range).collect()
    }

    #[test]
    fn range_within_limit_yields_single_chunk() {
        assert_eq!(collect(101, 105, 10), vec![101..=105]);
    }

    #[test]
    fn range_splits_at_limit_with_remainder() {
        assert_eq!(collect(101, 105, 2), vec![101..=102, 103..=104, 105..=105]);
    }

    #[test]
    fn exact_multiple_has_no_short_tail() {
        assert_eq!(collect(1, 6, 3), vec![1..=3, 4..=6]);
    }

    #[test]
    fn single_block_range() {
        assert_eq!(collect(7, 7, 100), vec![7..=7]);
    }

    #[test]
    fn empty_when_from_exceeds_to() {
        assert!(collect(10, 9, 5).is_empty());
    }

    #[test]
    fn handles_ranges_ending_at_u64_max() {
        let chunks = collect(u64::MAX - 2, u64::MAX, 2);

        assert_eq!(chunks, vec![u64::MAX - 2..=u64::MAX - 1, u64::MAX..=u64::MAX]);
    }

    #[test]
    #[should_panic(expected = "max_range must be at least 1")]
    fn zero_max_range_panics() {
        ChunkRanges::new(1, 10, 0);
    }
}
