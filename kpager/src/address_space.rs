// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;

use crate::caps::{CapService, TaskCaps, TaskId};
use crate::provider::MemoryProvider;
use crate::segment::{ExternalSource, Segment, SegmentKind};
use crate::{Error, MapFlags, PAGE_SIZE, ensure};

/// The virtual address space of one task.
///
/// Segments are keyed by base address; the segment owning a faulting
/// address is found with an ordered upper-bound lookup. Fault resolution
/// is strictly sequential per address space, so there is no locking here.
#[derive(Debug)]
pub struct AddressSpace {
    caps: TaskCaps,
    segments: BTreeMap<usize, Segment>,
    alive: bool,
    next_seg_id: u64,
}

impl AddressSpace {
    pub fn new(kern: Arc<dyn CapService>, task: TaskId) -> Self {
        Self {
            caps: TaskCaps::new(kern, task),
            segments: BTreeMap::new(),
            alive: true,
            next_seg_id: 0,
        }
    }

    pub fn task(&self) -> TaskId {
        self.caps.task()
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.values()
    }

    /// Returns the segment whose range contains `addr`.
    pub fn segment_at(&self, addr: usize) -> Option<&Segment> {
        let (_, seg) = self.segments.range(..=addr).next_back()?;
        seg.contains(addr).then_some(seg)
    }

    /// Creates an anonymous segment at `virt`.
    pub fn map_anon(&mut self, virt: usize, size: usize, flags: MapFlags) -> Result<u64, Error> {
        self.insert_segment(virt, size, flags, SegmentKind::Anon)
    }

    /// Creates a segment backed by object `obj` of a file-memory session,
    /// starting at byte `file_off` of the object.
    pub fn map_external(
        &mut self,
        virt: usize,
        size: usize,
        flags: MapFlags,
        session: Arc<dyn MemoryProvider>,
        obj: u64,
        file_off: usize,
    ) -> Result<u64, Error> {
        self.insert_segment(
            virt,
            size,
            flags,
            SegmentKind::External(ExternalSource {
                session,
                obj,
                file_off,
            }),
        )
    }

    fn insert_segment(
        &mut self,
        virt: usize,
        size: usize,
        flags: MapFlags,
        kind: SegmentKind,
    ) -> Result<u64, Error> {
        ensure!(
            virt % PAGE_SIZE == 0 && size % PAGE_SIZE == 0 && size > 0,
            Error::Misaligned
        );
        // the new range must not overlap its neighbours
        if let Some((_, prev)) = self.segments.range(..=virt).next_back() {
            ensure!(prev.end() <= virt, Error::AlreadyMapped);
        }
        if let Some((&next, _)) = self.segments.range(virt..).next() {
            ensure!(next >= virt + size, Error::AlreadyMapped);
        }

        let id = self.next_seg_id;
        self.next_seg_id += 1;
        let seg = Segment::new(id, virt, size, flags, kind);
        log::debug!("{}: mapped {seg}", self.caps.task());
        self.segments.insert(virt, seg);
        Ok(id)
    }

    /// Resolves a page fault at `virt`.
    ///
    /// Fails with [`Error::NoSegment`] if no segment covers the address or
    /// the address space is being torn down; that is fatal to the faulting
    /// task and the caller decides what to do about it. All other errors
    /// are propagated from the owning segment's resolution strategy.
    pub fn page_fault(&mut self, virt: usize) -> Result<(), Error> {
        ensure!(self.alive, Error::NoSegment);

        let Some((_, seg)) = self.segments.range_mut(..=virt).next_back() else {
            log::trace!("{}: fault at unmapped address {virt:#x}", self.caps.task());
            return Err(Error::NoSegment);
        };
        if !seg.contains(virt) {
            log::trace!("{}: fault at unmapped address {virt:#x}", self.caps.task());
            return Err(Error::NoSegment);
        }
        seg.handle_fault(&self.caps, virt)
    }

    /// Forks this address space for `task`.
    ///
    /// Every segment is cloned and inherits the source's backing: writable
    /// regions become read-only + copy-on-write on both sides, read-only
    /// regions are shared outright. No memory is copied until one side
    /// writes.
    pub fn fork(&mut self, task: TaskId) -> Result<AddressSpace, Error> {
        ensure!(self.alive, Error::NoSegment);

        let clone_caps = self.caps.for_task(task);
        let mut segments = BTreeMap::new();
        for (&base, seg) in self.segments.iter_mut() {
            let mut nseg = seg.clone_for_fork();
            nseg.inherit(&clone_caps, seg, &self.caps)?;
            segments.insert(base, nseg);
        }

        log::debug!("{}: forked into {task}", self.caps.task());
        Ok(AddressSpace {
            caps: clone_caps,
            segments,
            alive: true,
            next_seg_id: self.next_seg_id,
        })
    }

    /// Destroys the segment containing `virt`, releasing every physical
    /// block reachable through it.
    pub fn unmap(&mut self, virt: usize) -> Result<(), Error> {
        let base = match self.segments.range(..=virt).next_back() {
            Some((&base, seg)) if seg.contains(virt) => base,
            _ => return Err(Error::NoSegment),
        };
        let mut seg = self.segments.remove(&base).expect("segment was just found");
        log::debug!("{}: unmapping {seg}", self.caps.task());
        seg.release(&self.caps);
        Ok(())
    }

    /// Tears the address space down: releases every segment and stops
    /// resolving faults. Idempotent; also runs on drop.
    pub fn teardown(&mut self) {
        if !self.alive && self.segments.is_empty() {
            return;
        }
        self.alive = false;
        for seg in self.segments.values_mut() {
            seg.release(&self.caps);
        }
        self.segments.clear();
        log::debug!("{}: address space torn down", self.caps.task());
    }

    /// Asserts that segments are pairwise non-overlapping and that every
    /// region list is well formed.
    pub fn assert_valid(&self) {
        let mut prev_end = 0;
        for seg in self.segments.values() {
            assert!(
                seg.virt() >= prev_end,
                "segment at {:#x} overlaps its predecessor",
                seg.virt()
            );
            seg.regions().assert_valid(seg.size());
            prev_end = seg.end();
        }
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "address space of {} ({})",
            self.caps.task(),
            if self.alive { "alive" } else { "dead" }
        )?;
        for seg in self.segments.values() {
            writeln!(f, "  {seg}")?;
        }
        Ok(())
    }
}
