use std::cmp::Ordering;

/// Round `value` up to a multiple of `align`. A zero alignment leaves the
/// value alone.
pub fn align_up(value: u64, align: u64) -> u64 {
    if align == 0 {
        return value;
    }
    value.div_ceil(align) * align
}

pub fn div_round_up(value: u64, divisor: u64) -> u64 {
    value.div_ceil(divisor)
}

/// Closed byte range [start, end]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    start: u64,
    end: u64,
}

impl Interval {
    /// Range of `len` bytes at `offset`, None when empty or overflowing
    pub fn with_len(offset: u64, len: u64) -> Option<Self> {
        if len == 0 {
            return None;
        }
        Some(Interval { start: offset, end: offset.checked_add(len - 1)? })
    }

    pub fn get_start(&self) -> u64 {
        self.start
    }
}

impl Ord for Interval {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start.cmp(&other.start).then(self.end.cmp(&other.end))
    }
}

impl PartialOrd for Interval {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum IntervalState {
    Disjoint,
    Equal,
    Subset,
    Superset,
    Overlap,
}

/// How `interval1` relates to `interval2`; Subset means interval1 lies
/// inside interval2.
pub fn check_interval_state(interval1: &Interval, interval2: &Interval) -> IntervalState {
    if interval1.end < interval2.start || interval1.start > interval2.end {
        return IntervalState::Disjoint;
    }
    if interval1 == interval2 {
        return IntervalState::Equal;
    }
    if interval1.start >= interval2.start && interval1.end <= interval2.end {
        return IntervalState::Subset;
    }
    if interval1.start <= interval2.start && interval1.end >= interval2.end {
        return IntervalState::Superset;
    }
    IntervalState::Overlap
}

/// True when any two intervals share a byte
pub fn check_any_overlaps(intervals: &mut [Interval]) -> bool {
    intervals.sort();
    intervals.windows(2).any(|w| w[1].start <= w[0].end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(2112, 2048), 4096);
        assert_eq!(align_up(7, 0), 7);
        assert_eq!(div_round_up(1025, 1024), 2);
    }

    #[test]
    fn interval_states() {
        let part = Interval::with_len(0, 1024).unwrap();
        assert_eq!(check_interval_state(&Interval::with_len(512, 512).unwrap(), &part), IntervalState::Subset);
        assert_eq!(check_interval_state(&Interval::with_len(512, 513).unwrap(), &part), IntervalState::Overlap);
        assert_eq!(check_interval_state(&Interval::with_len(1024, 977).unwrap(), &part), IntervalState::Disjoint);
        assert_eq!(check_interval_state(&Interval::with_len(0, 1024).unwrap(), &part), IntervalState::Equal);
        assert_eq!(check_interval_state(&Interval::with_len(0, 4096).unwrap(), &part), IntervalState::Superset);
        assert!(Interval::with_len(1, 0).is_none());
    }

    #[test]
    fn overlaps() {
        let mut parts = vec![Interval::with_len(100, 100).unwrap(), Interval::with_len(0, 100).unwrap()];
        assert!(!check_any_overlaps(&mut parts));
        parts.push(Interval::with_len(150, 151).unwrap());
        assert!(check_any_overlaps(&mut parts));
    }
}
