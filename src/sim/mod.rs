// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-memory model of the host kernel.
//!
//! Pure state, no I/O: sparse per-process page tables, a reference-counted
//! frame store with byte-addressable contents, and fault delivery matching
//! the real kernel's rules (a refused write becomes an upcall only when an
//! upcall is registered and the exception stack is usable; otherwise the
//! process is destroyed). The test suite drives the COW protocol against this
//! model; embedders can use it as a reference for the expected primitive
//! semantics.
//!
//! The model implements the primitives the protocol consumes. It is not a
//! kernel: there is no scheduler ([`SimKernel::switch_to`] stands in for one)
//! and no frame reclamation policy beyond refcounting.

pub mod invariants;

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use log::trace;

use crate::layout::{EXC_STACK_BASE, PAGES_PER_DIR, PAGE_SIZE, USER_LIMIT};
use crate::pte::{FaultCause, PageFlags, PtEntry};
use crate::sys::{AccessError, Fault, HostKernel, SysError, SysResult};
use crate::types::{PageNum, Pid, UpcallEntry, VirtAddr};

/// Default cap on allocatable frames, generous enough for the test suite but
/// small enough to make `NoMemory` reachable.
const DEFAULT_MAX_FRAMES: usize = 4096;

struct Frame {
    data: Vec<u8>,
    refs: usize,
}

struct FrameStore {
    frames: Vec<Option<Frame>>,
    max_frames: usize,
}

impl FrameStore {
    fn new(max_frames: usize) -> Self {
        Self { frames: Vec::new(), max_frames }
    }

    fn in_use(&self) -> usize {
        self.frames.iter().filter(|slot| slot.is_some()).count()
    }

    /// Allocates a zeroed frame with refcount 0; `incref` follows on install.
    fn alloc_zeroed(&mut self) -> Option<usize> {
        if self.in_use() >= self.max_frames {
            return None;
        }
        let frame = Frame { data: vec![0u8; PAGE_SIZE], refs: 0 };
        for (ppn, slot) in self.frames.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(frame);
                return Some(ppn);
            }
        }
        self.frames.push(Some(frame));
        Some(self.frames.len() - 1)
    }

    fn incref(&mut self, ppn: usize) {
        if let Some(Some(frame)) = self.frames.get_mut(ppn) {
            frame.refs += 1;
        }
    }

    fn decref(&mut self, ppn: usize) {
        if let Some(slot) = self.frames.get_mut(ppn) {
            if let Some(frame) = slot.as_mut() {
                frame.refs = frame.refs.saturating_sub(1);
                if frame.refs > 0 {
                    return;
                }
            } else {
                return;
            }
            *slot = None;
        }
    }

    fn refs(&self, ppn: usize) -> usize {
        match self.frames.get(ppn) {
            Some(Some(frame)) => frame.refs,
            _ => 0,
        }
    }

    fn data(&self, ppn: usize) -> Option<&[u8]> {
        match self.frames.get(ppn) {
            Some(Some(frame)) => Some(&frame.data),
            _ => None,
        }
    }

    fn data_mut(&mut self, ppn: usize) -> Option<&mut [u8]> {
        match self.frames.get_mut(ppn) {
            Some(Some(frame)) => Some(&mut frame.data),
            _ => None,
        }
    }
}

struct Proc {
    pt: BTreeMap<PageNum, PtEntry>,
    upcall: Option<UpcallEntry>,
    runnable: bool,
}

impl Proc {
    fn new() -> Self {
        Self { pt: BTreeMap::new(), upcall: None, runnable: false }
    }
}

#[cfg(feature = "failpoints")]
#[derive(Default)]
struct Failpoints {
    deny_next_create: bool,
    deny_next_map: bool,
}

/// Pure in-memory host kernel.
pub struct SimKernel {
    procs: BTreeMap<Pid, Proc>,
    frames: FrameStore,
    current: Pid,
    next_pid: u32,
    resume_child: bool,
    #[cfg(feature = "failpoints")]
    fail: Failpoints,
}

impl SimKernel {
    /// Boots the model with one initial process, which is current and
    /// runnable. Its address space is empty; tests seed it with `page_alloc`.
    pub fn new() -> Self {
        let mut procs = BTreeMap::new();
        let initial = Pid::from_raw(1);
        let mut proc0 = Proc::new();
        proc0.runnable = true;
        procs.insert(initial, proc0);
        Self {
            procs,
            frames: FrameStore::new(DEFAULT_MAX_FRAMES),
            current: initial,
            next_pid: 2,
            resume_child: false,
            #[cfg(feature = "failpoints")]
            fail: Failpoints::default(),
        }
    }

    /// Scheduler stand-in: makes `pid` the executing process.
    ///
    /// Refuses processes that do not exist (`BadProcess`) or were never
    /// marked runnable (`PermissionDenied`); a child abandoned by a failed
    /// fork can never be switched to.
    pub fn switch_to(&mut self, pid: Pid) -> SysResult<()> {
        let proc = self.procs.get(&pid).ok_or(SysError::BadProcess)?;
        if !proc.runnable {
            return Err(SysError::PermissionDenied);
        }
        self.current = pid;
        Ok(())
    }

    /// Arms the next `process_create` to return [`Pid::SELF`], modeling the
    /// kernel resuming the new process inside the creation call. Use after
    /// switching to the child to drive the child side of fork.
    pub fn stage_child_resume(&mut self) {
        self.resume_child = true;
    }

    // Inspection helpers for tests and diagnostics.

    /// Page-table entry of `pn` in `pid`, if mapped.
    pub fn entry_of(&self, pid: Pid, pn: PageNum) -> Option<PtEntry> {
        self.procs.get(&pid).and_then(|proc| proc.pt.get(&pn)).copied()
    }

    /// Physical frame number backing `pn` in `pid`, if mapped.
    pub fn frame_of(&self, pid: Pid, pn: PageNum) -> Option<usize> {
        self.entry_of(pid, pn).map(PtEntry::frame_number)
    }

    /// Number of page-table references to frame `ppn` across all processes.
    pub fn refcount(&self, ppn: usize) -> usize {
        self.frames.refs(ppn)
    }

    /// Registered fault upcall of `pid`, if any.
    pub fn upcall_of(&self, pid: Pid) -> Option<UpcallEntry> {
        self.procs.get(&pid).and_then(|proc| proc.upcall)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.procs.contains_key(&pid)
    }

    pub fn is_runnable(&self, pid: Pid) -> bool {
        self.procs.get(&pid).map(|proc| proc.runnable).unwrap_or(false)
    }

    pub fn process_count(&self) -> usize {
        self.procs.len()
    }

    /// All live process identifiers, in ascending order.
    pub fn pids(&self) -> Vec<Pid> {
        self.procs.keys().copied().collect()
    }

    pub fn frames_in_use(&self) -> usize {
        self.frames.in_use()
    }

    // Failpoints.

    /// Forces the next `process_create` to fail with `NoFreeProcess`.
    #[cfg(feature = "failpoints")]
    pub fn deny_next_create(&mut self) {
        self.fail.deny_next_create = true;
    }

    /// Forces the next `page_map` to fail with `NoMemory`.
    #[cfg(feature = "failpoints")]
    pub fn deny_next_map(&mut self) {
        self.fail.deny_next_map = true;
    }

    // Internals.

    fn resolve(&self, pid: Pid) -> SysResult<Pid> {
        let pid = if pid.is_self() { self.current } else { pid };
        if self.procs.contains_key(&pid) {
            Ok(pid)
        } else {
            Err(SysError::BadProcess)
        }
    }

    fn check_mapping_args(va: VirtAddr, perms: PageFlags) -> SysResult<()> {
        if !va.is_page_aligned() || va.raw() >= USER_LIMIT {
            return Err(SysError::InvalidArg);
        }
        if !perms.contains(PageFlags::PRESENT | PageFlags::USER)
            || !PageFlags::SYSCALL_PERMS.contains(perms)
        {
            return Err(SysError::InvalidArg);
        }
        Ok(())
    }

    /// Installs `ppn` at `pn` in `pid`, replacing any prior mapping.
    /// Increfs before dropping the old entry so a same-frame re-map can never
    /// transit a zero refcount.
    fn install(&mut self, pid: Pid, pn: PageNum, ppn: usize, perms: PageFlags) {
        self.frames.incref(ppn);
        if let Some(proc) = self.procs.get_mut(&pid) {
            if let Some(old) = proc.pt.insert(pn, PtEntry::new(ppn, perms)) {
                self.frames.decref(old.frame_number());
            }
        }
    }

    fn remove(&mut self, pid: Pid, pn: PageNum) {
        if let Some(proc) = self.procs.get_mut(&pid) {
            if let Some(old) = proc.pt.remove(&pn) {
                self.frames.decref(old.frame_number());
            }
        }
    }

    fn destroy(&mut self, pid: Pid) {
        if let Some(proc) = self.procs.remove(&pid) {
            for (_, entry) in proc.pt {
                self.frames.decref(entry.frame_number());
            }
        }
    }

    /// Applies the kernel's fault-delivery rule for the current process.
    fn deliver_fault(&mut self, fault: Fault) -> AccessError {
        let exc_pn = PageNum::containing(VirtAddr::new(EXC_STACK_BASE));
        let deliverable = match self.procs.get(&self.current) {
            Some(proc) => {
                let exc = proc.pt.get(&exc_pn).copied().unwrap_or(PtEntry::EMPTY);
                proc.upcall.is_some() && exc.is_present() && exc.is_writable()
            }
            None => false,
        };
        if deliverable {
            trace!(target: "sim", "upcall for {} in {}", fault, self.current);
            AccessError::Upcall(fault)
        } else {
            trace!(target: "sim", "undeliverable {}; destroying {}", fault, self.current);
            self.destroy(self.current);
            AccessError::Fatal(fault)
        }
    }

    /// Permission check for one access; builds the fault record on refusal.
    fn access_entry(&self, va: VirtAddr, write: bool) -> Result<PtEntry, Fault> {
        let entry = self
            .procs
            .get(&self.current)
            .and_then(|proc| proc.pt.get(&PageNum::containing(va)))
            .copied()
            .unwrap_or(PtEntry::EMPTY);
        let allowed = entry.is_present()
            && entry.is_user()
            && (!write || entry.is_writable());
        if allowed {
            return Ok(entry);
        }
        let mut cause = FaultCause::USER;
        if write {
            cause |= FaultCause::WRITE;
        }
        if entry.is_present() {
            cause |= FaultCause::PROTECTION;
        }
        Err(Fault { va, cause })
    }
}

impl Default for SimKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl HostKernel for SimKernel {
    fn current_pid(&self) -> Pid {
        self.current
    }

    fn process_create(&mut self) -> SysResult<Pid> {
        if self.resume_child {
            self.resume_child = false;
            return Ok(Pid::SELF);
        }
        #[cfg(feature = "failpoints")]
        if core::mem::take(&mut self.fail.deny_next_create) {
            return Err(SysError::NoFreeProcess);
        }
        let pid = Pid::from_raw(self.next_pid);
        self.next_pid = self.next_pid.checked_add(1).ok_or(SysError::NoFreeProcess)?;
        self.procs.insert(pid, Proc::new());
        trace!(target: "sim", "created {} (not runnable)", pid);
        Ok(pid)
    }

    fn page_alloc(&mut self, pid: Pid, va: VirtAddr, perms: PageFlags) -> SysResult<()> {
        let pid = self.resolve(pid)?;
        Self::check_mapping_args(va, perms)?;
        let ppn = self.frames.alloc_zeroed().ok_or(SysError::NoMemory)?;
        self.install(pid, PageNum::containing(va), ppn, perms);
        Ok(())
    }

    fn page_map(
        &mut self,
        src: Pid,
        src_va: VirtAddr,
        dst: Pid,
        dst_va: VirtAddr,
        perms: PageFlags,
    ) -> SysResult<()> {
        let src = self.resolve(src)?;
        let dst = self.resolve(dst)?;
        if !src_va.is_page_aligned() || src_va.raw() >= USER_LIMIT {
            return Err(SysError::InvalidArg);
        }
        Self::check_mapping_args(dst_va, perms)?;
        #[cfg(feature = "failpoints")]
        if core::mem::take(&mut self.fail.deny_next_map) {
            return Err(SysError::NoMemory);
        }
        let entry = self
            .entry_of(src, PageNum::containing(src_va))
            .ok_or(SysError::InvalidArg)?;
        if perms.contains(PageFlags::WRITABLE) && !entry.is_writable() {
            return Err(SysError::PermissionDenied);
        }
        self.install(dst, PageNum::containing(dst_va), entry.frame_number(), perms);
        Ok(())
    }

    fn page_unmap(&mut self, pid: Pid, va: VirtAddr) -> SysResult<()> {
        let pid = self.resolve(pid)?;
        if !va.is_page_aligned() {
            return Err(SysError::InvalidArg);
        }
        self.remove(pid, PageNum::containing(va));
        Ok(())
    }

    fn set_fault_upcall(&mut self, pid: Pid, entry: UpcallEntry) -> SysResult<()> {
        let pid = self.resolve(pid)?;
        if let Some(proc) = self.procs.get_mut(&pid) {
            proc.upcall = Some(entry);
        }
        Ok(())
    }

    fn set_runnable(&mut self, pid: Pid, runnable: bool) -> SysResult<()> {
        let pid = self.resolve(pid)?;
        if let Some(proc) = self.procs.get_mut(&pid) {
            proc.runnable = runnable;
        }
        Ok(())
    }

    fn pde(&self, pn: PageNum) -> PtEntry {
        let span_start = PageNum::from_raw(pn.raw() - pn.raw() % PAGES_PER_DIR);
        let span_end = PageNum::from_raw(span_start.raw() + PAGES_PER_DIR);
        let populated = self
            .procs
            .get(&self.current)
            .map(|proc| proc.pt.range(span_start..span_end).next().is_some())
            .unwrap_or(false);
        if populated {
            // Directory entries carry the most permissive leaf rights.
            PtEntry::new(0, PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITABLE)
        } else {
            PtEntry::EMPTY
        }
    }

    fn pte(&self, pn: PageNum) -> PtEntry {
        self.procs
            .get(&self.current)
            .and_then(|proc| proc.pt.get(&pn))
            .copied()
            .unwrap_or(PtEntry::EMPTY)
    }

    fn read(&mut self, va: VirtAddr, buf: &mut [u8]) -> Result<(), AccessError> {
        let mut off = 0;
        while off < buf.len() {
            let at = VirtAddr::new(va.raw() + off);
            let entry = match self.access_entry(at, false) {
                Ok(entry) => entry,
                Err(fault) => return Err(self.deliver_fault(fault)),
            };
            let in_page = PAGE_SIZE - at.page_offset();
            let len = in_page.min(buf.len() - off);
            if let Some(data) = self.frames.data(entry.frame_number()) {
                let start = at.page_offset();
                buf[off..off + len].copy_from_slice(&data[start..start + len]);
            }
            off += len;
        }
        Ok(())
    }

    fn write(&mut self, va: VirtAddr, bytes: &[u8]) -> Result<(), AccessError> {
        let mut off = 0;
        while off < bytes.len() {
            let at = VirtAddr::new(va.raw() + off);
            let entry = match self.access_entry(at, true) {
                Ok(entry) => entry,
                Err(fault) => return Err(self.deliver_fault(fault)),
            };
            let in_page = PAGE_SIZE - at.page_offset();
            let len = in_page.min(bytes.len() - off);
            if let Some(data) = self.frames.data_mut(entry.frame_number()) {
                let start = at.page_offset();
                data[start..start + len].copy_from_slice(&bytes[off..off + len]);
            }
            off += len;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RW: PageFlags =
        PageFlags::PRESENT.union(PageFlags::USER).union(PageFlags::WRITABLE);
    const RO: PageFlags = PageFlags::PRESENT.union(PageFlags::USER);

    fn va(page: usize) -> VirtAddr {
        VirtAddr::new(page * PAGE_SIZE)
    }

    #[test]
    fn alloc_installs_a_zeroed_private_frame() {
        let mut kernel = SimKernel::new();
        let me = kernel.current_pid();
        kernel.page_alloc(Pid::SELF, va(3), RW).expect("alloc");
        let pn = PageNum::from_raw(3);
        let entry = kernel.entry_of(me, pn).expect("mapped");
        assert_eq!(entry.flags(), RW);
        assert_eq!(kernel.refcount(entry.frame_number()), 1);
        let mut buf = [0xffu8; 8];
        kernel.read(va(3), &mut buf).expect("read");
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn rejects_unaligned_and_out_of_range() {
        let mut kernel = SimKernel::new();
        assert_eq!(
            kernel.page_alloc(Pid::SELF, VirtAddr::new(7), RW),
            Err(SysError::InvalidArg)
        );
        assert_eq!(
            kernel.page_alloc(Pid::SELF, VirtAddr::new(USER_LIMIT), RW),
            Err(SysError::InvalidArg)
        );
    }

    #[test]
    fn map_replaces_the_destination_mapping() {
        let mut kernel = SimKernel::new();
        let me = kernel.current_pid();
        kernel.page_alloc(Pid::SELF, va(1), RW).expect("alloc src");
        kernel.page_alloc(Pid::SELF, va(2), RW).expect("alloc dst");
        let old = kernel.frame_of(me, PageNum::from_raw(2)).expect("old frame");
        kernel.page_map(Pid::SELF, va(1), Pid::SELF, va(2), RO).expect("map");
        assert_eq!(
            kernel.frame_of(me, PageNum::from_raw(2)),
            kernel.frame_of(me, PageNum::from_raw(1))
        );
        // The replaced frame lost its only reference and was reclaimed.
        assert_eq!(kernel.refcount(old), 0);
    }

    #[test]
    fn remapping_a_page_onto_itself_keeps_the_frame_alive() {
        let mut kernel = SimKernel::new();
        let me = kernel.current_pid();
        kernel.page_alloc(Pid::SELF, va(1), RW).expect("alloc");
        let ppn = kernel.frame_of(me, PageNum::from_raw(1)).expect("frame");
        kernel
            .page_map(Pid::SELF, va(1), Pid::SELF, va(1), RO | PageFlags::COW)
            .expect("remap");
        assert_eq!(kernel.refcount(ppn), 1);
        assert!(kernel.entry_of(me, PageNum::from_raw(1)).expect("entry").is_cow());
    }

    #[test]
    fn writable_map_requires_a_writable_source() {
        let mut kernel = SimKernel::new();
        kernel.page_alloc(Pid::SELF, va(1), RO).expect("alloc");
        assert_eq!(
            kernel.page_map(Pid::SELF, va(1), Pid::SELF, va(2), RW),
            Err(SysError::PermissionDenied)
        );
    }

    #[test]
    fn created_process_is_empty_and_not_runnable() {
        let mut kernel = SimKernel::new();
        kernel.page_alloc(Pid::SELF, va(1), RW).expect("alloc");
        let child = kernel.process_create().expect("create");
        assert!(!kernel.is_runnable(child));
        assert_eq!(kernel.entry_of(child, PageNum::from_raw(1)), None);
        assert_eq!(kernel.upcall_of(child), None);
        assert_eq!(kernel.switch_to(child), Err(SysError::PermissionDenied));
    }

    #[test]
    fn fault_without_upcall_destroys_the_process() {
        let mut kernel = SimKernel::new();
        let me = kernel.current_pid();
        kernel.page_alloc(Pid::SELF, va(1), RO).expect("alloc");
        match kernel.write(va(1), &[1]) {
            Err(AccessError::Fatal(fault)) => {
                assert!(fault.cause.contains(FaultCause::WRITE | FaultCause::PROTECTION));
            }
            other => panic!("expected fatal fault, got {:?}", other),
        }
        assert!(!kernel.contains(me));
    }

    #[test]
    fn fault_with_upcall_but_no_exception_stack_is_fatal() {
        let mut kernel = SimKernel::new();
        let me = kernel.current_pid();
        kernel.page_alloc(Pid::SELF, va(1), RO).expect("alloc");
        kernel.set_fault_upcall(Pid::SELF, UpcallEntry::new(0x1)).expect("upcall");
        assert!(matches!(kernel.write(va(1), &[1]), Err(AccessError::Fatal(_))));
        assert!(!kernel.contains(me));
    }

    #[test]
    fn fault_with_usable_exception_stack_is_delivered() {
        let mut kernel = SimKernel::new();
        kernel.page_alloc(Pid::SELF, va(1), RO).expect("alloc");
        kernel.page_alloc(Pid::SELF, VirtAddr::new(EXC_STACK_BASE), RW).expect("stack");
        kernel.set_fault_upcall(Pid::SELF, UpcallEntry::new(0x1)).expect("upcall");
        match kernel.write(va(1), &[1]) {
            Err(AccessError::Upcall(fault)) => assert_eq!(fault.va, va(1)),
            other => panic!("expected upcall, got {:?}", other),
        }
    }

    #[test]
    fn writes_crossing_a_page_boundary_touch_both_pages() {
        let mut kernel = SimKernel::new();
        kernel.page_alloc(Pid::SELF, va(1), RW).expect("alloc");
        kernel.page_alloc(Pid::SELF, va(2), RW).expect("alloc");
        let at = VirtAddr::new(2 * PAGE_SIZE - 2);
        kernel.write(at, &[1, 2, 3, 4]).expect("write");
        let mut buf = [0u8; 4];
        kernel.read(at, &mut buf).expect("read");
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn failpoints_fire_once() {
        let mut kernel = SimKernel::new();
        kernel.deny_next_create();
        assert_eq!(kernel.process_create(), Err(SysError::NoFreeProcess));
        assert!(kernel.process_create().is_ok());
    }
}
