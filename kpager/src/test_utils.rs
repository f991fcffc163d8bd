// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::address_space::AddressSpace;
use crate::caps::{CapSel, CapService, Rights, TaskId};
use crate::provider::{MemoryProvider, ProviderMem};
use crate::{Error, MapFlags, PAGE_SIZE, round_dn};

/// Pattern freshly allocated mock memory is filled with, so that a missing
/// zero-fill shows up in tests.
pub(crate) const POISON: u8 = 0xA5;

/// Byte-accurate emulation of the kernel capability service.
///
/// Capabilities are views into reference-counted byte buffers; derivation
/// produces a narrowed view sharing the parent's buffer, revocation kills a
/// selector and everything derived from it. Mappings are per-task tables
/// from page-aligned ranges to capability slices, so reads and writes
/// behave like accesses through real page tables: they fail with the
/// faulting address when no sufficient mapping is installed.
#[derive(Debug, Default)]
pub(crate) struct MockKernel {
    state: Mutex<MockState>,
}

#[derive(Debug, Default)]
struct MockState {
    next_sel: u64,
    caps: BTreeMap<CapSel, MockCap>,
    maps: BTreeMap<TaskId, BTreeMap<usize, MockMapping>>,
    alloc_failures: usize,
    derive_failures: usize,
}

#[derive(Debug, Clone)]
struct MockCap {
    store: Arc<Mutex<Vec<u8>>>,
    base: usize,
    len: usize,
    rights: Rights,
    parent: Option<CapSel>,
}

#[derive(Debug, Clone)]
struct MockMapping {
    sel: CapSel,
    len: usize,
    flags: MapFlags,
}

impl MockState {
    fn mint(&mut self) -> CapSel {
        self.next_sel += 1;
        CapSel::new(self.next_sel)
    }
}

impl MockKernel {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mints a full-rights capability over fresh storage initialized from
    /// `contents`; used to model provider-owned objects.
    pub(crate) fn new_object(&self, contents: &[u8]) -> CapSel {
        let mut st = self.state.lock();
        let sel = st.mint();
        st.caps.insert(
            sel,
            MockCap {
                store: Arc::new(Mutex::new(contents.to_vec())),
                base: 0,
                len: contents.len(),
                rights: Rights::RWX,
                parent: None,
            },
        );
        sel
    }

    /// Makes the next `alloc` call fail with [`Error::AllocationFailed`].
    pub(crate) fn fail_next_alloc(&self) {
        self.state.lock().alloc_failures += 1;
    }

    /// Makes the next `derive` call fail with [`Error::DerivationFailed`].
    pub(crate) fn fail_next_derive(&self) {
        self.state.lock().derive_failures += 1;
    }

    /// Number of live capabilities, for leak assertions.
    pub(crate) fn cap_count(&self) -> usize {
        self.state.lock().caps.len()
    }

    /// Reads capability-backed memory directly, bypassing page tables.
    pub(crate) fn read_cap(&self, sel: CapSel, off: usize, len: usize) -> Vec<u8> {
        let st = self.state.lock();
        let cap = st.caps.get(&sel).expect("read of a revoked capability");
        assert!(off + len <= cap.len);
        cap.store.lock()[cap.base + off..cap.base + off + len].to_vec()
    }

    /// Reads through `task`'s page tables. Returns the faulting address if
    /// some part of the range is unmapped or not readable.
    pub(crate) fn read_virt(
        &self,
        task: TaskId,
        virt: usize,
        len: usize,
    ) -> Result<Vec<u8>, usize> {
        self.access(task, virt, len, Rights::R, |store, range, out: &mut Vec<u8>| {
            out.extend_from_slice(&store[range]);
        })
    }

    /// Writes through `task`'s page tables. Returns the faulting address if
    /// some part of the range is unmapped or not writable.
    pub(crate) fn write_virt(&self, task: TaskId, virt: usize, bytes: &[u8]) -> Result<(), usize> {
        let mut remaining = bytes;
        self.access(task, virt, bytes.len(), Rights::W, |store, range, _: &mut ()| {
            let (chunk, rest) = remaining.split_at(range.len());
            store[range].copy_from_slice(chunk);
            remaining = rest;
        })
    }

    fn access<T: Default>(
        &self,
        task: TaskId,
        mut virt: usize,
        len: usize,
        rights: Rights,
        mut op: impl FnMut(&mut Vec<u8>, core::ops::Range<usize>, &mut T),
    ) -> Result<T, usize> {
        let st = self.state.lock();
        let mut out = T::default();
        let end = virt + len;
        while virt < end {
            let mapping = st
                .maps
                .get(&task)
                .and_then(|tmap| tmap.range(..=virt).next_back());
            let Some((&base, mapping)) = mapping else {
                return Err(virt);
            };
            if virt >= base + mapping.len || !Rights::from(mapping.flags).contains(rights) {
                return Err(virt);
            }
            // a revoked capability behind a stale mapping faults as well
            let Some(cap) = st.caps.get(&mapping.sel) else {
                return Err(virt);
            };

            let take = (base + mapping.len - virt).min(end - virt);
            let start = cap.base + (virt - base);
            op(&mut *cap.store.lock(), start..start + take, &mut out);
            virt += take;
        }
        Ok(out)
    }
}

impl CapService for MockKernel {
    fn alloc(&self, len: usize, rights: Rights) -> Result<CapSel, Error> {
        let mut st = self.state.lock();
        if st.alloc_failures > 0 {
            st.alloc_failures -= 1;
            return Err(Error::AllocationFailed);
        }
        let sel = st.mint();
        st.caps.insert(
            sel,
            MockCap {
                store: Arc::new(Mutex::new(alloc::vec![POISON; len])),
                base: 0,
                len,
                rights,
                parent: None,
            },
        );
        Ok(sel)
    }

    fn derive(
        &self,
        parent: CapSel,
        off: usize,
        len: usize,
        rights: Rights,
    ) -> Result<CapSel, Error> {
        let mut st = self.state.lock();
        if st.derive_failures > 0 {
            st.derive_failures -= 1;
            return Err(Error::DerivationFailed);
        }
        let Some(p) = st.caps.get(&parent).cloned() else {
            return Err(Error::DerivationFailed);
        };
        if off + len > p.len || !p.rights.contains(rights) {
            return Err(Error::DerivationFailed);
        }
        let sel = st.mint();
        st.caps.insert(
            sel,
            MockCap {
                store: p.store,
                base: p.base + off,
                len,
                rights,
                parent: Some(parent),
            },
        );
        Ok(sel)
    }

    fn revoke(&self, sel: CapSel) {
        let mut st = self.state.lock();
        let mut dead = alloc::vec![sel];
        let mut i = 0;
        while i < dead.len() {
            let cur = dead[i];
            i += 1;
            dead.extend(
                st.caps
                    .iter()
                    .filter(|(_, cap)| cap.parent == Some(cur))
                    .map(|(&child, _)| child),
            );
        }
        for sel in dead {
            st.caps.remove(&sel);
        }
    }

    fn clear(&self, mem: CapSel, off: usize, len: usize) -> Result<(), Error> {
        let st = self.state.lock();
        let Some(cap) = st.caps.get(&mem) else {
            return Err(Error::DerivationFailed);
        };
        assert!(off + len <= cap.len);
        cap.store.lock()[cap.base + off..cap.base + off + len].fill(0);
        Ok(())
    }

    fn copy(
        &self,
        dst: CapSel,
        dst_off: usize,
        src: CapSel,
        src_off: usize,
        len: usize,
    ) -> Result<(), Error> {
        let st = self.state.lock();
        let (Some(d), Some(s)) = (st.caps.get(&dst), st.caps.get(&src)) else {
            return Err(Error::DerivationFailed);
        };
        assert!(dst_off + len <= d.len && src_off + len <= s.len);

        let bytes = s.store.lock()[s.base + src_off..s.base + src_off + len].to_vec();
        d.store.lock()[d.base + dst_off..d.base + dst_off + len].copy_from_slice(&bytes);
        Ok(())
    }

    fn map(
        &self,
        task: TaskId,
        virt: usize,
        mem: CapSel,
        len: usize,
        flags: MapFlags,
    ) -> Result<(), Error> {
        let mut st = self.state.lock();
        let Some(cap) = st.caps.get(&mem) else {
            return Err(Error::DerivationFailed);
        };
        assert_eq!(virt % PAGE_SIZE, 0, "mapping must be page aligned");
        assert!(len <= cap.len, "mapping exceeds the capability");
        if !cap.rights.contains(Rights::from(flags)) {
            return Err(Error::DerivationFailed);
        }

        // installing a mapping replaces whatever overlapped the range
        let tmap = st.maps.entry(task).or_default();
        let stale: Vec<usize> = tmap
            .iter()
            .filter(|&(&base, ref m)| base < virt + len && base + m.len > virt)
            .map(|(&base, _)| base)
            .collect();
        for base in stale {
            tmap.remove(&base);
        }
        tmap.insert(virt, MockMapping { sel: mem, len, flags });
        Ok(())
    }

    fn unmap(&self, task: TaskId, virt: usize, len: usize) {
        let mut st = self.state.lock();
        let Some(tmap) = st.maps.get_mut(&task) else {
            return;
        };
        let stale: Vec<usize> = tmap
            .iter()
            .filter(|&(&base, ref m)| base < virt + len && base + m.len > virt)
            .map(|(&base, _)| base)
            .collect();
        for base in stale {
            tmap.remove(&base);
        }
    }
}

/// File-memory session over one in-mock object.
///
/// Capabilities are handed out chunk-aligned, so a request may receive a
/// capability that starts before the requested offset or covers less than
/// the caller hoped for — the same shape of answers a real provider gives.
#[derive(Debug)]
pub(crate) struct MockProvider {
    kern: Arc<MockKernel>,
    obj: u64,
    obj_sel: CapSel,
    obj_len: usize,
    chunk: usize,
    min_off: AtomicUsize,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl MockProvider {
    pub(crate) fn new(
        kern: &Arc<MockKernel>,
        obj: u64,
        contents: &[u8],
        chunk: usize,
    ) -> Arc<Self> {
        let obj_sel = kern.new_object(contents);
        Arc::new(Self {
            kern: kern.clone(),
            obj,
            obj_sel,
            obj_len: contents.len(),
            chunk,
            min_off: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        })
    }

    /// The master capability of the backing object, for provider-side
    /// content assertions.
    pub(crate) fn object(&self) -> CapSel {
        self.obj_sel
    }

    /// Number of `get_mem` round trips performed.
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub(crate) fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    /// Refuse to hand out memory below this object offset; chunks are
    /// clipped to start at it.
    pub(crate) fn set_min_off(&self, min_off: usize) {
        self.min_off.store(min_off, Ordering::Relaxed);
    }
}

impl MemoryProvider for MockProvider {
    fn get_mem(&self, obj: u64, off: usize) -> Result<ProviderMem, Error> {
        assert_eq!(obj, self.obj, "request for an unknown object");
        self.calls.fetch_add(1, Ordering::Relaxed);

        if self.fail.load(Ordering::Relaxed) || off >= self.obj_len {
            return Err(Error::ProviderUnavailable);
        }

        let start = round_dn(off, self.chunk).max(self.min_off.load(Ordering::Relaxed));
        if start >= self.obj_len {
            return Err(Error::ProviderUnavailable);
        }
        let len = (self.obj_len - start).min(self.chunk);
        let sel = self
            .kern
            .derive(self.obj_sel, start, len, Rights::RWX)
            .map_err(|_| Error::ProviderUnavailable)?;

        Ok(ProviderMem { sel, off: start, len })
    }
}

/// Reads `len` bytes at `virt`, resolving page faults through `aspace`
/// like the surrounding runtime would.
pub(crate) fn read_faulting(
    kern: &MockKernel,
    aspace: &mut AddressSpace,
    virt: usize,
    len: usize,
) -> Vec<u8> {
    for _ in 0..16 {
        match kern.read_virt(aspace.task(), virt, len) {
            Ok(bytes) => return bytes,
            Err(addr) => aspace.page_fault(addr).expect("page fault failed"),
        }
    }
    panic!("{virt:#x} did not become readable");
}

/// Writes `bytes` at `virt`, resolving page faults through `aspace` like
/// the surrounding runtime would.
pub(crate) fn write_faulting(
    kern: &MockKernel,
    aspace: &mut AddressSpace,
    virt: usize,
    bytes: &[u8],
) {
    for _ in 0..16 {
        match kern.write_virt(aspace.task(), virt, bytes) {
            Ok(()) => return,
            Err(addr) => aspace.page_fault(addr).expect("page fault failed"),
        }
    }
    panic!("{virt:#x} did not become writable");
}
