// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fork orchestrator and per-page duplication policy
//! PUBLIC API: fork, duplicate_page, ForkOutcome, ForkError, Task
//! DEPENDS_ON: fault::ENTRY, layout, sys::HostKernel
//! INVARIANTS: no PTE ever holds COW and WRITABLE together; the child is
//!     marked runnable only after every eligible page has been processed; the
//!     exception stack is provisioned privately, never through the policy

use core::fmt;

use log::debug;

use crate::fault;
use crate::layout::{EXC_STACK_BASE, PAGES_PER_DIR, PAGE_SIZE, USER_STACK_TOP};
use crate::pte::PageFlags;
use crate::sys::{HostKernel, SysError};
use crate::types::{PageNum, Pid, VirtAddr};

/// Which side of a fork the caller is resuming on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkOutcome {
    /// Resuming in the original process; carries the child's pid.
    Parent(Pid),
    /// Resuming in the newly created process.
    Child,
}

/// Fatal conditions raised while forking.
///
/// No rollback of partial duplication is attempted: address-space consistency
/// cannot be certified mid-failure, so the caller must treat these as a hard
/// stop. The orchestrator does guarantee the child was never marked runnable.
#[must_use = "fork errors are fatal and must stop the process"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkError {
    /// Registering the caller's fault upcall failed.
    Upcall(SysError),
    /// Process creation failed; no child exists and the caller is unchanged.
    Create(SysError),
    /// Duplicating `pn` into the child failed.
    Duplicate { pn: PageNum, err: SysError },
    /// Provisioning the child's private exception stack failed.
    ExceptionStack(SysError),
    /// Registering the child's fault upcall failed.
    ChildUpcall(SysError),
    /// The child could not be marked runnable.
    SetRunnable(SysError),
}

impl fmt::Display for ForkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upcall(err) => write!(f, "upcall registration failed: {}", err),
            Self::Create(err) => write!(f, "process creation failed: {}", err),
            Self::Duplicate { pn, err } => write!(f, "duplicating {} failed: {}", pn, err),
            Self::ExceptionStack(err) => write!(f, "exception-stack setup failed: {}", err),
            Self::ChildUpcall(err) => write!(f, "child upcall registration failed: {}", err),
            Self::SetRunnable(err) => write!(f, "activating the child failed: {}", err),
        }
    }
}

/// Per-execution-context self-identity handle.
///
/// Holds the process's own identifier instead of a process-wide mutable
/// global keyed by pid. Fork repairs it on the child side, where the cached
/// value still names the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    pid: Pid,
}

impl Task {
    /// Captures the identity of the calling process.
    pub fn current<K: HostKernel>(kernel: &K) -> Self {
        Self { pid: kernel.current_pid() }
    }

    /// The process this execution context belongs to.
    pub fn pid(&self) -> Pid {
        self.pid
    }
}

/// Duplicates the caller's page `pn` into `target` at the same virtual
/// address.
///
/// `pn` must name a page that is present and user-accessible in the caller's
/// own address space; fork filters pages before invoking the policy and the
/// policy does not re-validate.
///
/// If the source mapping is writable or COW, the frame is installed on both
/// sides as `{PRESENT, USER, COW}`. The caller-side re-install happens even
/// when the source was already COW: the COW tag alone does not certify the
/// absence of WRITABLE, and the re-install is the only step that does.
/// A read-only, non-COW source is installed with its permissions unchanged:
/// true sharing, since neither side can mutate the frame.
pub fn duplicate_page<K: HostKernel>(
    kernel: &mut K,
    target: Pid,
    pn: PageNum,
) -> Result<(), SysError> {
    let va = pn.base_addr();
    let src = kernel.pte(pn);

    if src.is_writable() || src.is_cow() {
        let shared = PageFlags::PRESENT | PageFlags::USER | PageFlags::COW;
        kernel.page_map(Pid::SELF, va, target, va, shared)?;
        kernel.page_map(Pid::SELF, va, Pid::SELF, va, shared)?;
    } else {
        let perms = src.flags() & PageFlags::SYSCALL_PERMS;
        kernel.page_map(Pid::SELF, va, target, va, perms)?;
    }
    Ok(())
}

/// User-level fork with copy-on-write.
///
/// Conceptually returns twice: [`ForkOutcome::Parent`] in the calling
/// process and [`ForkOutcome::Child`] in the new one. Duplication runs
/// entirely in the parent; the child only repairs its self-identity. Every
/// failure is fatal ([`ForkError`]) and leaves the child, if it exists,
/// never marked runnable.
pub fn fork<K: HostKernel>(kernel: &mut K, task: &mut Task) -> Result<ForkOutcome, ForkError> {
    // Safe to repeat across forks by a long-lived process.
    kernel.set_fault_upcall(Pid::SELF, fault::ENTRY).map_err(ForkError::Upcall)?;

    let child = kernel.process_create().map_err(ForkError::Create)?;
    if child.is_self() {
        // Executing as the new process. The parent did all duplication;
        // only the cached self-identity still names the parent.
        task.pid = kernel.current_pid();
        return Ok(ForkOutcome::Child);
    }

    // Share every present, user-accessible page below the user stack top.
    // The exception stack lies above this bound and is never duplicated. An
    // absent directory entry covers a whole span of absent pages, so the walk
    // advances span-wise through unpopulated regions.
    let limit = USER_STACK_TOP / PAGE_SIZE;
    let mut raw = 0;
    while raw < limit {
        let pn = PageNum::from_raw(raw);
        if !kernel.pde(pn).is_present() {
            raw = (raw / PAGES_PER_DIR + 1) * PAGES_PER_DIR;
            continue;
        }
        let pte = kernel.pte(pn);
        if pte.is_present() && pte.is_user() {
            duplicate_page(kernel, child, pn).map_err(|err| ForkError::Duplicate { pn, err })?;
        }
        raw += 1;
    }

    // Fresh private page for the child's exception stack: the child's
    // handler must be able to run the instant its first COW fault arrives.
    let private = PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITABLE;
    kernel
        .page_alloc(child, VirtAddr::new(EXC_STACK_BASE), private)
        .map_err(ForkError::ExceptionStack)?;
    kernel.set_fault_upcall(child, fault::ENTRY).map_err(ForkError::ChildUpcall)?;

    // Only now does the child become eligible for execution.
    kernel.set_runnable(child, true).map_err(ForkError::SetRunnable)?;

    debug!(target: "fork", "child {} runnable", child);
    Ok(ForkOutcome::Parent(child))
}
