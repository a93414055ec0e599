//! First-fit free-list allocator over a linear address range.
//!
//! Used by the memory pool to hand out sub-ranges of one device-memory page.
//! The free list is kept sorted by start, pairwise disjoint and merged: no
//! two entries touch or overlap.

use ash::vk;

use crate::util::layout::padding_for;

/// A half-open range `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub begin: vk::DeviceSize,
    pub end: vk::DeviceSize,
}

impl Interval {
    pub const fn new(begin: vk::DeviceSize, end: vk::DeviceSize) -> Self {
        Self { begin, end }
    }

    #[inline]
    pub const fn len(&self) -> vk::DeviceSize {
        self.end - self.begin
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    fn overlaps(&self, other: &Interval) -> bool {
        self.begin < other.end && other.begin < self.end
    }
}

/// Free-list allocator over `[0, capacity)`.
#[derive(Debug, Clone)]
pub struct IntervalAllocator {
    capacity: vk::DeviceSize,
    free: Vec<Interval>,
}

impl IntervalAllocator {
    /// An allocator with the whole range free.
    pub fn new(capacity: vk::DeviceSize) -> Self {
        let free = if capacity > 0 {
            vec![Interval::new(0, capacity)]
        } else {
            Vec::new()
        };
        Self { capacity, free }
    }

    pub fn capacity(&self) -> vk::DeviceSize {
        self.capacity
    }

    /// The current free list, sorted by start.
    pub fn free_intervals(&self) -> &[Interval] {
        &self.free
    }

    /// Total free bytes.
    pub fn free_bytes(&self) -> vk::DeviceSize {
        self.free.iter().map(Interval::len).sum()
    }

    /// True when nothing is allocated.
    pub fn is_fully_free(&self) -> bool {
        self.capacity == 0 || self.free == [Interval::new(0, self.capacity)]
    }

    /// Reserve `size` bytes at an offset that is a multiple of `alignment`.
    ///
    /// Returns the offset, or `None` when no free interval fits.
    pub fn request_interval(&mut self, size: vk::DeviceSize, alignment: vk::DeviceSize) -> Option<vk::DeviceSize> {
        for i in 0..self.free.len() {
            let Interval { begin, end } = self.free[i];
            let aligned_begin = begin + padding_for(begin, alignment);
            let aligned_end = match aligned_begin.checked_add(size) {
                Some(e) if e <= end => e,
                _ => continue,
            };

            if aligned_begin == begin && aligned_end == end {
                // exact fit
                self.free.remove(i);
            } else if aligned_end == end {
                self.free[i].end = aligned_begin;
            } else {
                self.free[i].begin = aligned_end;
                if aligned_begin != begin {
                    self.free.insert(i, Interval::new(begin, aligned_begin));
                }
            }
            return Some(aligned_begin);
        }
        None
    }

    /// Give a previously requested range back.
    ///
    /// # Panics
    ///
    /// Panics if the range overlaps free space, which means it was returned
    /// twice or never handed out.
    pub fn return_interval(&mut self, interval: Interval) {
        if interval.is_empty() {
            return;
        }
        assert!(
            interval.begin < interval.end && interval.end <= self.capacity,
            "returned interval {:?} outside of [0, {})",
            interval,
            self.capacity
        );

        let pos = self.free.partition_point(|f| f.begin < interval.begin);

        let left = pos.checked_sub(1);
        if let Some(l) = left {
            assert!(
                !self.free[l].overlaps(&interval),
                "returned interval {:?} overlaps free interval {:?}",
                interval,
                self.free[l]
            );
        }
        if let Some(right) = self.free.get(pos) {
            assert!(
                !right.overlaps(&interval),
                "returned interval {:?} overlaps free interval {:?}",
                interval,
                right
            );
        }

        let merges_left = left.map_or(false, |l| self.free[l].end == interval.begin);
        let merges_right = self.free.get(pos).map_or(false, |r| r.begin == interval.end);

        match (merges_left, merges_right) {
            (true, true) => {
                let l = pos - 1;
                self.free[l].end = self.free[pos].end;
                self.free.remove(pos);
            }
            (true, false) => self.free[pos - 1].end = interval.end,
            (false, true) => self.free[pos].begin = interval.begin,
            (false, false) => self.free.insert(pos, interval),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_well_formed(alloc: &IntervalAllocator) {
        for w in alloc.free_intervals().windows(2) {
            assert!(w[0].end < w[1].begin, "free list not sorted/merged: {:?}", alloc.free_intervals());
        }
        for f in alloc.free_intervals() {
            assert!(!f.is_empty());
        }
    }

    #[test]
    fn test_exact_fit_removes_interval() {
        let mut alloc = IntervalAllocator::new(64);
        assert_eq!(alloc.request_interval(64, 1), Some(0));
        assert!(alloc.free_intervals().is_empty());
        assert_eq!(alloc.request_interval(1, 1), None);
    }

    #[test]
    fn test_alignment_leaves_fragment() {
        let mut alloc = IntervalAllocator::new(256);
        assert_eq!(alloc.request_interval(10, 1), Some(0));
        assert_eq!(alloc.request_interval(16, 64), Some(64));
        assert_eq!(
            alloc.free_intervals(),
            &[Interval::new(10, 64), Interval::new(80, 256)]
        );
        assert_well_formed(&alloc);
    }

    #[test]
    fn test_aligned_tail_trims_interval() {
        let mut alloc = IntervalAllocator::new(128);
        assert_eq!(alloc.request_interval(8, 1), Some(0));
        // aligned range [64, 128) ends exactly at the interval end
        assert_eq!(alloc.request_interval(64, 64), Some(64));
        assert_eq!(alloc.free_intervals(), &[Interval::new(8, 64)]);
    }

    #[test]
    fn test_return_merges_neighbours() {
        let mut alloc = IntervalAllocator::new(300);
        let a = alloc.request_interval(100, 1).unwrap();
        let b = alloc.request_interval(100, 1).unwrap();
        let c = alloc.request_interval(100, 1).unwrap();
        assert!(alloc.free_intervals().is_empty());

        alloc.return_interval(Interval::new(a, a + 100));
        alloc.return_interval(Interval::new(c, c + 100));
        assert_eq!(alloc.free_intervals().len(), 2);

        alloc.return_interval(Interval::new(b, b + 100));
        assert!(alloc.is_fully_free());
    }

    #[test]
    fn test_round_trip_restores_free_list() {
        let mut alloc = IntervalAllocator::new(1024);
        alloc.request_interval(100, 1).unwrap();
        let before = alloc.free_intervals().to_vec();

        let offset = alloc.request_interval(200, 256).unwrap();
        alloc.return_interval(Interval::new(offset, offset + 200));
        // the alignment fragment is returned by merging with its neighbours
        assert_eq!(alloc.free_intervals(), before.as_slice());
    }

    #[test]
    fn test_zero_length_return_is_noop() {
        let mut alloc = IntervalAllocator::new(16);
        alloc.return_interval(Interval::new(4, 4));
        assert_eq!(alloc.free_intervals(), &[Interval::new(0, 16)]);
    }

    #[test]
    #[should_panic(expected = "overlaps")]
    fn test_double_free_panics() {
        let mut alloc = IntervalAllocator::new(64);
        let offset = alloc.request_interval(16, 1).unwrap();
        alloc.return_interval(Interval::new(offset, offset + 16));
        alloc.return_interval(Interval::new(offset, offset + 16));
    }

    #[test]
    fn test_free_list_invariant_under_mixed_sequence() {
        let mut alloc = IntervalAllocator::new(4096);
        let mut live = Vec::new();
        // deterministic pseudo-random sequence
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for step in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            if step % 3 != 2 || live.is_empty() {
                let size = 1 + seed % 200;
                let alignment = [1, 4, 16, 64][(seed >> 8) as usize % 4];
                if let Some(offset) = alloc.request_interval(size, alignment) {
                    assert_eq!(offset % alignment, 0);
                    live.push(Interval::new(offset, offset + size));
                }
            } else {
                let victim = live.swap_remove((seed >> 16) as usize % live.len());
                alloc.return_interval(victim);
            }
            assert_well_formed(&alloc);
            for l in &live {
                assert!(alloc.free_intervals().iter().all(|f| !f.overlaps(l)));
            }
        }
        for l in live.drain(..) {
            alloc.return_interval(l);
        }
        assert!(alloc.is_fully_free());
    }
}
