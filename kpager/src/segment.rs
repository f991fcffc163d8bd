// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::sync::Arc;
use core::fmt;

use crate::caps::{Rights, TaskCaps};
use crate::phys::PhysBlock;
use crate::provider::{MemoryProvider, ProviderMem};
use crate::region::Region;
use crate::region_list::RegionList;
use crate::{Error, LARGE_PAGE_SIZE, MapFlags, PAGE_SIZE, ensure, round_dn, round_up};

/// Largest number of pages one anonymous fault materializes, unless the
/// large-page fast path applies.
pub const MAX_ANON_PAGES: usize = 4;
/// Largest number of pages one external fault materializes.
pub const MAX_EXT_PAGES: usize = 8;

/// Fault-resolution strategy of a segment.
#[derive(Debug)]
pub enum SegmentKind {
    /// Backed on demand by freshly allocated, zero-filled memory.
    Anon,
    /// Backed by capabilities obtained from a file-memory session.
    External(ExternalSource),
}

/// Identity of the object backing a [`SegmentKind::External`] segment.
#[derive(Debug, Clone)]
pub struct ExternalSource {
    pub session: Arc<dyn MemoryProvider>,
    pub obj: u64,
    pub file_off: usize,
}

impl ExternalSource {
    /// Backs `reg` with provider memory for a fault at segment offset
    /// `off`, implementing the unbacked arm of the external state machine.
    fn back(&self, reg: &mut Region, caps: &TaskCaps, off: usize, flags: MapFlags) -> Result<(), Error> {
        let pm = self.session.get_mem(self.obj, self.file_off + off)?;
        if let Err(err) = self.attach(reg, caps, off, flags, &pm) {
            caps.kern().revoke(pm.sel);
            return Err(err);
        }
        Ok(())
    }

    fn attach(
        &self,
        reg: &mut Region,
        caps: &TaskCaps,
        off: usize,
        flags: MapFlags,
        pm: &ProviderMem,
    ) -> Result<(), Error> {
        ensure!(pm.len > 0, Error::ProviderUnavailable);

        reg.limit_to(off, MAX_EXT_PAGES);

        // align the region with what the capability actually covers: a
        // capability starting early is compensated through the region's
        // block offset, one starting late moves the region forward
        if pm.off < self.file_off + reg.offset() {
            reg.set_mem_off(self.file_off + reg.offset() - pm.off);
        } else {
            let shift = pm.off - self.file_off - reg.offset();
            ensure!(shift < reg.size(), Error::ProviderUnavailable);
            reg.set_offset(reg.offset() + shift);
            reg.set_size(reg.size() - shift);
            reg.set_mem_off(0);
        }
        // never exceed the capability
        if reg.mem_off() + reg.size() > pm.len {
            ensure!(pm.len > reg.mem_off(), Error::ProviderUnavailable);
            reg.set_size(round_up(pm.len - reg.mem_off(), PAGE_SIZE));
        }

        if flags.contains(MapFlags::WRITE) && !flags.contains(MapFlags::SHARED) {
            // private writable mapping: copy into own storage and return
            // the provider's capability
            let block = PhysBlock::alloc(caps.kern(), reg.size(), Rights::RWX)?;
            caps.kern()
                .copy(block.sel(), 0, pm.sel, reg.mem_off(), reg.size())?;
            caps.kern().revoke(pm.sel);
            reg.set_mem_off(0);
            reg.set_block(Arc::new(block));
        } else {
            // shared or read-only: use the provider's memory directly
            reg.set_block(Arc::new(PhysBlock::bind(
                caps.kern(),
                pm.sel,
                pm.len,
                Rights::RWX,
            )));
        }
        Ok(())
    }
}

/// A contiguous virtual range with uniform access flags and one
/// fault-resolution strategy.
#[derive(Debug)]
pub struct Segment {
    id: u64,
    virt: usize,
    size: usize,
    flags: MapFlags,
    regions: RegionList,
    kind: SegmentKind,
}

impl Segment {
    pub(crate) fn new(id: u64, virt: usize, size: usize, flags: MapFlags, kind: SegmentKind) -> Self {
        Self {
            id,
            virt,
            size,
            flags,
            regions: RegionList::new(),
            kind,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn virt(&self) -> usize {
        self.virt
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// End of the virtual range (exclusive).
    pub fn end(&self) -> usize {
        self.virt + self.size
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    pub fn kind(&self) -> &SegmentKind {
        &self.kind
    }

    pub fn regions(&self) -> &RegionList {
        &self.regions
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.virt && addr < self.end()
    }

    fn kind_name(&self) -> &'static str {
        match self.kind {
            SegmentKind::Anon => "anon",
            SegmentKind::External(_) => "external",
        }
    }

    /// Resolves a page fault at `vaddr`, which must lie inside the segment.
    ///
    /// Locates (or creates) the covering region, backs it if necessary —
    /// fresh zeroed memory for anonymous segments, a provider round trip
    /// for external ones — materializes copy-on-write state, and finally
    /// installs the mapping.
    pub(crate) fn handle_fault(&mut self, caps: &TaskCaps, vaddr: usize) -> Result<(), Error> {
        debug_assert!(self.contains(vaddr));
        let off = round_dn(vaddr - self.virt, PAGE_SIZE);
        let virt = self.virt;
        let flags = self.flags;

        let reg = self.regions.pagefault(off, self.size);

        if !reg.has_mem() {
            match &self.kind {
                SegmentKind::Anon => {
                    let mut max = MAX_ANON_PAGES;
                    // a large-page aligned fault with enough room ahead
                    // takes the wide path
                    if vaddr % LARGE_PAGE_SIZE == 0 && reg.size() >= LARGE_PAGE_SIZE {
                        max = LARGE_PAGE_SIZE / PAGE_SIZE;
                    }
                    reg.limit_to(off, max);

                    log::debug!(
                        "allocating anonymous memory for {:#x}..{:#x}",
                        virt + reg.offset(),
                        virt + reg.end()
                    );

                    let block = PhysBlock::alloc(caps.kern(), reg.size(), Rights::RWX)?;
                    reg.set_block(Arc::new(block));
                    reg.clear(caps)?;
                }
                SegmentKind::External(src) => {
                    src.back(reg, caps, off, flags)?;

                    log::debug!(
                        "obtained external memory for {:#x}..{:#x} (mem_off={:#x})",
                        virt + reg.offset(),
                        virt + reg.end(),
                        reg.mem_off()
                    );
                }
            }
        } else if reg.is_cow() {
            // copy-on-write: writable segments materialize a private copy,
            // read-only ones just lose the flag and remap
            if flags.contains(MapFlags::WRITE) {
                reg.copy_on_write(caps)?;
            }
            reg.set_cow(false);
        } else if reg.is_mapped() {
            // benign re-fault, the mapping is already in place
            return Ok(());
        }

        reg.map(caps, virt, flags & MapFlags::RWX)
    }

    /// Fork-time region merge: share the source segment's backing with
    /// this (cloned) segment.
    ///
    /// Writable source mappings are flipped to read-only first so the
    /// original task cannot mutate memory the clone still sees, then both
    /// sides are marked copy-on-write. Clone regions become copy-on-write
    /// even under a read-only source so the clone's first access installs
    /// its own mapping.
    pub(crate) fn inherit(
        &mut self,
        own_caps: &TaskCaps,
        src: &mut Segment,
        src_caps: &TaskCaps,
    ) -> Result<(), Error> {
        self.id = src.id;

        let src_virt = src.virt;
        let src_writable = src.flags.contains(MapFlags::WRITE);
        let ro_flags = (src.flags & MapFlags::RWX).difference(MapFlags::WRITE);

        // read-only segments that already share regions can keep them
        if !src_writable && !self.regions.is_empty() {
            return Ok(());
        }
        // a writable clone either owns private copies (which must go
        // anyway) or is still copy-on-write; rebuilding the list is
        // cheaper than matching both lists against each other
        self.regions.clear(own_caps, self.virt);

        for reg in src.regions.iter_mut() {
            // flip the source mapping to read-only before sharing
            if reg.has_mem() && !reg.is_cow() && src_writable {
                reg.map(src_caps, src_virt, ro_flags)?;
            }

            let mut nreg = reg.clone_for_fork();
            nreg.set_cow(true);
            self.regions.append(nreg);

            if src_writable {
                reg.set_cow(true);
            }
        }
        Ok(())
    }

    /// Structural clone for fork: same range, flags and identity, no
    /// regions yet.
    pub(crate) fn clone_for_fork(&self) -> Segment {
        Segment {
            id: self.id,
            virt: self.virt,
            size: self.size,
            flags: self.flags,
            regions: RegionList::new(),
            kind: match &self.kind {
                SegmentKind::Anon => SegmentKind::Anon,
                SegmentKind::External(src) => SegmentKind::External(src.clone()),
            },
        }
    }

    /// Releases all regions, revoking their blocks and views.
    pub(crate) fn release(&mut self, caps: &TaskCaps) {
        self.regions.clear(caps, self.virt);
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} segment {} at {:#x}..{:#x} [{}] ({} regions)",
            self.kind_name(),
            self.id,
            self.virt,
            self.end(),
            self.flags,
            self.regions.len()
        )
    }
}
