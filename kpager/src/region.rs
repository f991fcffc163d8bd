// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::sync::Arc;

use crate::caps::{CapSel, Rights, TaskCaps};
use crate::phys::PhysBlock;
use crate::{Error, MapFlags, PAGE_SIZE};

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub(crate) struct RegionFlags: u8 {
        /// The block is shared with a forked sibling; a private copy must
        /// be materialized before this task may write
        const COW = 1 << 0;
        /// A mapping for this region is installed in the task's page tables
        const MAPPED = 1 << 1;
    }
}

/// One contiguous sub-range of a segment and its backing state.
///
/// Offsets are relative to the owning segment. A region without a block is
/// a placeholder created by the fault path; it receives its backing in the
/// same resolution step or, after a failed step, on a later fault.
#[derive(Debug)]
pub struct Region {
    offset: usize,
    size: usize,
    block: Option<Arc<PhysBlock>>,
    mem_off: usize,
    flags: RegionFlags,
    view: Option<CapSel>,
}

impl Region {
    pub(crate) fn new(offset: usize, size: usize) -> Self {
        Self {
            offset,
            size,
            block: None,
            mem_off: 0,
            flags: RegionFlags::empty(),
            view: None,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Segment-relative end offset (exclusive).
    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    /// Byte offset into the backing block at which this region's data
    /// begins. Non-zero for externally backed regions whose capability
    /// starts before the region.
    pub fn mem_off(&self) -> usize {
        self.mem_off
    }

    pub fn block(&self) -> Option<&Arc<PhysBlock>> {
        self.block.as_ref()
    }

    pub fn has_mem(&self) -> bool {
        self.block.is_some()
    }

    pub fn is_cow(&self) -> bool {
        self.flags.contains(RegionFlags::COW)
    }

    pub fn is_mapped(&self) -> bool {
        self.flags.contains(RegionFlags::MAPPED)
    }

    pub(crate) fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    pub(crate) fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    pub(crate) fn set_mem_off(&mut self, mem_off: usize) {
        self.mem_off = mem_off;
    }

    pub(crate) fn set_block(&mut self, block: Arc<PhysBlock>) {
        self.block = Some(block);
    }

    pub(crate) fn set_cow(&mut self, cow: bool) {
        self.flags.set(RegionFlags::COW, cow);
    }

    /// Restricts an unbacked region to a window of at most `max_pages`
    /// pages starting at `pos`. The uncovered remainder turns back into
    /// holes and is materialized by later faults.
    pub(crate) fn limit_to(&mut self, pos: usize, max_pages: usize) {
        debug_assert!(!self.has_mem());
        debug_assert!(pos >= self.offset && pos < self.end());
        debug_assert_eq!(pos % PAGE_SIZE, 0);
        let end = self.end();
        self.offset = pos;
        self.size = (end - pos).min(max_pages * PAGE_SIZE);
    }

    /// Zero-fills the backing block; anonymous memory must never expose
    /// stale physical content.
    pub(crate) fn clear(&mut self, caps: &TaskCaps) -> Result<(), Error> {
        let block = self.block.as_ref().expect("cleared a region without backing");
        caps.kern().clear(block.sel(), self.mem_off, self.size)
    }

    /// Replaces a copy-on-write shared block with a private copy of its
    /// contents. The forked sibling keeps the old block; whoever drops the
    /// last reference frees it.
    pub(crate) fn copy_on_write(&mut self, caps: &TaskCaps) -> Result<(), Error> {
        let old = self.block.clone().expect("copy-on-write without backing");
        let new = PhysBlock::alloc(caps.kern(), self.size, Rights::RWX)?;
        caps.kern().copy(new.sel(), 0, old.sel(), self.mem_off, self.size)?;
        self.block = Some(Arc::new(new));
        self.mem_off = 0;
        Ok(())
    }

    /// Derives a view restricted to this region's slice of the block and
    /// installs it in the task's page tables, replacing an earlier view.
    pub(crate) fn map(&mut self, caps: &TaskCaps, seg_virt: usize, flags: MapFlags) -> Result<(), Error> {
        let block = self.block.as_ref().expect("mapped a region without backing");
        let virt = seg_virt + self.offset;

        let view = caps
            .kern()
            .derive(block.sel(), self.mem_off, self.size, Rights::from(flags))?;
        if let Err(err) = caps.map(virt, view, self.size, flags) {
            caps.kern().revoke(view);
            return Err(err);
        }
        if let Some(old) = self.view.replace(view) {
            caps.kern().revoke(old);
        }
        self.flags.insert(RegionFlags::MAPPED);

        log::trace!("mapped {virt:#x}..{:#x} {flags}", virt + self.size);
        Ok(())
    }

    /// Tears the region down: removes the mapping, revokes the installed
    /// view and releases the block reference.
    pub(crate) fn release(&mut self, caps: &TaskCaps, seg_virt: usize) {
        if self.flags.contains(RegionFlags::MAPPED) {
            caps.unmap(seg_virt + self.offset, self.size);
            self.flags.remove(RegionFlags::MAPPED);
        }
        if let Some(view) = self.view.take() {
            caps.kern().revoke(view);
        }
        self.block = None;
    }

    /// Shallow copy for fork: shares the block and offsets, starts
    /// unmapped in the clone's page tables.
    pub(crate) fn clone_for_fork(&self) -> Self {
        Self {
            offset: self.offset,
            size: self.size,
            block: self.block.clone(),
            mem_off: self.mem_off,
            flags: self.flags & RegionFlags::COW,
            view: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_to_middle_window() {
        let mut reg = Region::new(0, 8 * PAGE_SIZE);
        reg.limit_to(2 * PAGE_SIZE, 4);
        assert_eq!(reg.offset(), 2 * PAGE_SIZE);
        assert_eq!(reg.size(), 4 * PAGE_SIZE);
    }

    #[test]
    fn limit_to_clamps_at_end() {
        let mut reg = Region::new(0, 3 * PAGE_SIZE);
        reg.limit_to(2 * PAGE_SIZE, 4);
        assert_eq!(reg.offset(), 2 * PAGE_SIZE);
        assert_eq!(reg.size(), PAGE_SIZE);
    }

    #[test]
    fn limit_to_smaller_than_window_is_untouched() {
        let mut reg = Region::new(PAGE_SIZE, 2 * PAGE_SIZE);
        reg.limit_to(PAGE_SIZE, 4);
        assert_eq!(reg.offset(), PAGE_SIZE);
        assert_eq!(reg.size(), 2 * PAGE_SIZE);
    }

    #[test]
    fn fork_clone_keeps_cow_drops_mapped() {
        let mut reg = Region::new(0, PAGE_SIZE);
        reg.flags.insert(RegionFlags::COW | RegionFlags::MAPPED);
        let clone = reg.clone_for_fork();
        assert!(clone.is_cow());
        assert!(!clone.is_mapped());
        assert!(clone.view.is_none());
    }
}
