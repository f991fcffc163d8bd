// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::vec::Vec;

use crate::caps::TaskCaps;
use crate::region::Region;

/// The ordered set of regions covering a segment's virtual range.
///
/// Regions are disjoint and sorted by offset; sub-ranges covered by no
/// region have simply not faulted yet. A sorted vector with binary search
/// is plenty at the handful of regions a segment accumulates.
#[derive(Debug, Default)]
pub struct RegionList {
    regs: Vec<Region>,
}

impl RegionList {
    pub(crate) fn new() -> Self {
        Self { regs: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regs.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Region> {
        self.regs.iter_mut()
    }

    /// Returns the region containing `off`, creating one spanning the
    /// uncovered hole around `off` if necessary.
    ///
    /// `total` is the owning segment's size and bounds the new region.
    pub(crate) fn pagefault(&mut self, off: usize, total: usize) -> &mut Region {
        debug_assert!(off < total);

        // index of the first region starting after `off`
        let idx = self.regs.partition_point(|r| r.offset() <= off);
        if idx > 0 && self.regs[idx - 1].end() > off {
            return &mut self.regs[idx - 1];
        }

        // no region covers `off`, span the hole between the neighbours
        let start = if idx > 0 { self.regs[idx - 1].end() } else { 0 };
        let end = self.regs.get(idx).map_or(total, Region::offset);
        self.regs.insert(idx, Region::new(start, end - start));
        &mut self.regs[idx]
    }

    pub(crate) fn append(&mut self, reg: Region) {
        debug_assert!(self.regs.last().is_none_or(|last| last.end() <= reg.offset()));
        self.regs.push(reg);
    }

    /// Releases every region and empties the list.
    pub(crate) fn clear(&mut self, caps: &TaskCaps, seg_virt: usize) {
        for reg in &mut self.regs {
            reg.release(caps, seg_virt);
        }
        self.regs.clear();
    }

    /// Asserts the list invariants: sorted by offset, pairwise disjoint,
    /// contained in `[0, total)`.
    pub fn assert_valid(&self, total: usize) {
        let mut prev_end = 0;
        for reg in &self.regs {
            assert!(reg.size() > 0, "empty region at {:#x}", reg.offset());
            assert!(
                reg.offset() >= prev_end,
                "region at {:#x} overlaps its predecessor",
                reg.offset()
            );
            assert!(
                reg.end() <= total,
                "region at {:#x} exceeds the segment",
                reg.offset()
            );
            prev_end = reg.end();
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::PAGE_SIZE;

    const TOTAL: usize = 8 * PAGE_SIZE;

    #[test]
    fn first_fault_spans_whole_range() {
        let mut list = RegionList::new();
        let reg = list.pagefault(3 * PAGE_SIZE, TOTAL);
        assert_eq!(reg.offset(), 0);
        assert_eq!(reg.size(), TOTAL);
        assert_eq!(list.len(), 1);
        list.assert_valid(TOTAL);
    }

    #[test]
    fn fault_in_hole_spans_to_neighbours() {
        let mut list = RegionList::new();
        list.pagefault(5 * PAGE_SIZE, TOTAL).limit_to(5 * PAGE_SIZE, 1);
        list.pagefault(0, TOTAL).limit_to(0, 1);

        // the hole between the two limited regions is [1, 5) pages
        let reg = list.pagefault(2 * PAGE_SIZE, TOTAL);
        assert_eq!(reg.offset(), PAGE_SIZE);
        assert_eq!(reg.end(), 5 * PAGE_SIZE);
        list.assert_valid(TOTAL);
    }

    #[test]
    fn fault_on_covered_offset_returns_existing() {
        let mut list = RegionList::new();
        list.pagefault(0, TOTAL).limit_to(0, 4);
        assert_eq!(list.len(), 1);

        let reg = list.pagefault(PAGE_SIZE, TOTAL);
        assert_eq!(reg.offset(), 0);
        assert_eq!(reg.size(), 4 * PAGE_SIZE);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn trailing_hole_is_spanned_up_to_total() {
        let mut list = RegionList::new();
        list.pagefault(0, TOTAL).limit_to(0, 2);
        let reg = list.pagefault(6 * PAGE_SIZE, TOTAL);
        assert_eq!(reg.offset(), 2 * PAGE_SIZE);
        assert_eq!(reg.end(), TOTAL);
        list.assert_valid(TOTAL);
    }

    proptest! {
        #[test]
        fn regions_stay_sorted_and_disjoint(pages in prop::collection::vec(0usize..64, 1..48)) {
            let total = 64 * PAGE_SIZE;
            let mut list = RegionList::new();
            for page in pages {
                let off = page * PAGE_SIZE;
                let reg = list.pagefault(off, total);
                if !reg.has_mem() {
                    reg.limit_to(off, 4);
                }
                list.assert_valid(total);
            }
        }
    }
}
