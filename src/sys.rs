// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host-kernel syscall surface consumed by the COW protocol
//! PUBLIC API: HostKernel, SysError, Fault, AccessError
//! INVARIANTS: Every primitive is atomic with respect to the address space it
//!     touches; the mirrored page-table view is read-only; a process mutates
//!     only its own view except for the explicit cross-process installs
//!     performed during fork

use core::fmt;

use alloc::vec;

use crate::layout::PAGE_SIZE;
use crate::pte::{FaultCause, PageFlags, PtEntry};
use crate::types::{PageNum, Pid, UpcallEntry, VirtAddr};

/// Result type used by the host primitives.
pub type SysResult<T> = Result<T, SysError>;

/// Error codes returned by the host kernel.
#[must_use = "a failed host primitive leaves the address space uncertified"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysError {
    /// Referenced process does not exist or is not manageable by the caller.
    BadProcess,
    /// An address or permission argument was rejected.
    InvalidArg,
    /// No physical frame could be allocated.
    NoMemory,
    /// The process table is full.
    NoFreeProcess,
    /// The request needs a right the source mapping does not grant.
    PermissionDenied,
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A page fault as delivered to the registered fault upcall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    /// Faulting virtual address (the offending byte, not a page base).
    pub va: VirtAddr,
    /// Cause bits reported by the kernel.
    pub cause: FaultCause,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fault at {} ({:?})", self.va, self.cause)
    }
}

/// Outcome of a user-mode memory access that the kernel refused.
#[must_use = "an undelivered fault means the process was destroyed"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    /// The fault was delivered to the registered upcall. The handler must
    /// resolve it before the access can be retried.
    Upcall(Fault),
    /// No upcall could be delivered (none registered, or the exception stack
    /// was unusable); the kernel destroyed the process.
    Fatal(Fault),
}

impl AccessError {
    /// The fault record, regardless of whether it was deliverable.
    pub fn fault(&self) -> Fault {
        match self {
            Self::Upcall(fault) | Self::Fatal(fault) => *fault,
        }
    }
}

/// Page-granular virtual-memory primitives exposed by the host kernel,
/// together with the read-only mirrored page-table view and plain user-mode
/// loads/stores.
///
/// An implementation represents the surface as seen from one executing
/// process at a time: `Pid::SELF` in any `pid` argument names the calling
/// process, and `pde`/`pte`/`read`/`write` always operate on the caller's
/// own address space.
pub trait HostKernel {
    /// Identifier of the calling process.
    fn current_pid(&self) -> Pid;

    /// Creates a new, empty, not-runnable process whose registers mirror the
    /// caller's. Returns the child's pid to the caller and [`Pid::SELF`] in
    /// the new process's own execution context. All-or-nothing.
    fn process_create(&mut self) -> SysResult<Pid>;

    /// Allocates a zeroed physical frame and maps it at `va` in `pid` with
    /// `perms`, replacing any prior mapping at that address.
    fn page_alloc(&mut self, pid: Pid, va: VirtAddr, perms: PageFlags) -> SysResult<()>;

    /// Maps the frame backing `src_va` in `src` at `dst_va` in `dst` with
    /// `perms`, replacing any prior mapping at the destination. A `WRITABLE`
    /// request is refused when the source mapping is not writable.
    fn page_map(
        &mut self,
        src: Pid,
        src_va: VirtAddr,
        dst: Pid,
        dst_va: VirtAddr,
        perms: PageFlags,
    ) -> SysResult<()>;

    /// Removes the mapping at `va` in `pid`, if any.
    fn page_unmap(&mut self, pid: Pid, va: VirtAddr) -> SysResult<()>;

    /// Registers `entry` as the page-fault upcall for `pid`. Idempotent.
    fn set_fault_upcall(&mut self, pid: Pid, entry: UpcallEntry) -> SysResult<()>;

    /// Marks `pid` runnable or not runnable.
    fn set_runnable(&mut self, pid: Pid, runnable: bool) -> SysResult<()>;

    /// Page-directory entry covering `pn` in the caller's own address space.
    fn pde(&self, pn: PageNum) -> PtEntry;

    /// Page-table entry for `pn` in the caller's own address space.
    fn pte(&self, pn: PageNum) -> PtEntry;

    /// Plain user-mode load from the caller's own address space. An access
    /// the MMU refuses surfaces as the same fault a hardware load would take.
    fn read(&mut self, va: VirtAddr, buf: &mut [u8]) -> Result<(), AccessError>;

    /// Plain user-mode store to the caller's own address space. Writing
    /// through a mapping lacking `WRITABLE` is what makes COW observable as
    /// a fault.
    fn write(&mut self, va: VirtAddr, bytes: &[u8]) -> Result<(), AccessError>;

    /// Copies one full page from `src` to `dst` within the caller's own
    /// address space, with the same permission checks as any load/store.
    fn copy_page(&mut self, dst: VirtAddr, src: VirtAddr) -> Result<(), AccessError> {
        let mut buf = vec![0u8; PAGE_SIZE];
        self.read(src, &mut buf)?;
        self.write(dst, &buf)
    }
}
