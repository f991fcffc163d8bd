// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::sync::Arc;
use core::fmt;

use crate::{Error, MapFlags};

/// A capability selector naming a kernel object.
///
/// Selectors are opaque to the pager: they are minted by the kernel
/// capability service and only ever handed back to it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapSel(u64);

impl CapSel {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CapSel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sel:{}", self.0)
    }
}

/// Identifies the task whose page tables a mapping goes into.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u32);

impl TaskId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task:{}", self.0)
    }
}

bitflags::bitflags! {
    /// Access rights carried by a memory capability.
    #[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
    pub struct Rights: u8 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;

        const RW = Self::R.bits() | Self::W.bits();
        const RWX = Self::RW.bits() | Self::X.bits();
    }
}

impl fmt::Display for Rights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        bitflags::parser::to_writer(self, f)
    }
}

impl From<MapFlags> for Rights {
    fn from(flags: MapFlags) -> Self {
        let mut out = Rights::empty();
        if flags.contains(MapFlags::READ) {
            out |= Rights::R;
        }
        if flags.contains(MapFlags::WRITE) {
            out |= Rights::W;
        }
        if flags.contains(MapFlags::EXECUTE) {
            out |= Rights::X;
        }
        out
    }
}

/// The kernel capability service consumed by the pager.
///
/// Derivation and revocation are single atomic calls from the pager's point
/// of view; `clear` and `copy` may block the calling task context.
pub trait CapService: fmt::Debug {
    /// Allocates a fresh block of physical memory.
    ///
    /// The contents are unspecified; callers that must not expose stale
    /// bytes clear the block themselves.
    fn alloc(&self, len: usize, rights: Rights) -> Result<CapSel, Error>;

    /// Derives a restricted child capability over `parent[off..off + len)`.
    fn derive(&self, parent: CapSel, off: usize, len: usize, rights: Rights)
    -> Result<CapSel, Error>;

    /// Revokes `sel` and every capability derived from it.
    fn revoke(&self, sel: CapSel);

    /// Zero-fills `mem[off..off + len)`.
    fn clear(&self, mem: CapSel, off: usize, len: usize) -> Result<(), Error>;

    /// Copies `len` bytes from `src[src_off..]` to `dst[dst_off..]`.
    fn copy(
        &self,
        dst: CapSel,
        dst_off: usize,
        src: CapSel,
        src_off: usize,
        len: usize,
    ) -> Result<(), Error>;

    /// Installs a mapping of `mem` at `virt` in `task`'s page tables,
    /// replacing any previous mapping of the range.
    fn map(
        &self,
        task: TaskId,
        virt: usize,
        mem: CapSel,
        len: usize,
        flags: MapFlags,
    ) -> Result<(), Error>;

    /// Removes any mapping of `virt..virt + len` from `task`'s page tables.
    fn unmap(&self, task: TaskId, virt: usize, len: usize);
}

/// The capability context of one address space: the kernel service handle
/// plus the task whose page tables mappings belong to.
///
/// Threaded through segments and regions instead of back-references.
#[derive(Debug, Clone)]
pub struct TaskCaps {
    kern: Arc<dyn CapService>,
    task: TaskId,
}

impl TaskCaps {
    pub fn new(kern: Arc<dyn CapService>, task: TaskId) -> Self {
        Self { kern, task }
    }

    /// The same kernel handle, bound to another task's page tables.
    pub fn for_task(&self, task: TaskId) -> Self {
        Self {
            kern: self.kern.clone(),
            task,
        }
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    pub fn kern(&self) -> &Arc<dyn CapService> {
        &self.kern
    }

    pub(crate) fn map(
        &self,
        virt: usize,
        mem: CapSel,
        len: usize,
        flags: MapFlags,
    ) -> Result<(), Error> {
        self.kern.map(self.task, virt, mem, len, flags)
    }

    pub(crate) fn unmap(&self, virt: usize, len: usize) {
        self.kern.unmap(self.task, virt, len);
    }
}
