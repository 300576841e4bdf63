// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Write-fault handler for copy-on-write pages.
//!
//! Invoked through the fault upcall in the faulting process's own execution
//! context. This is not a general fault handler: anything that does not match
//! the legitimate COW pattern escalates as fatal, so real bugs (null
//! dereference, stack overflow) are never misread as recoverable COW faults.

use core::fmt;

use log::{debug, error};

use crate::layout::SCRATCH_PAGE;
use crate::pte::{FaultCause, PageFlags};
use crate::sys::{AccessError, Fault, HostKernel, SysError};
use crate::types::{PageNum, Pid, UpcallEntry, VirtAddr};

/// Well-known upcall entry for this handler. The host kernel treats entry
/// points as opaque values; registering this one routes write faults here.
pub const ENTRY: UpcallEntry = UpcallEntry::new(0x1);

/// Unrecoverable conditions raised while servicing a fault.
///
/// Callers map these to a hard process stop; there is no retry policy, since
/// repeating an address-space mutation after an unknown partial failure
/// cannot be shown safe.
#[must_use = "fault-handler errors are fatal and must stop the process"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// The delivered fault is not a write to a present COW page.
    NotCow(Fault),
    /// A host primitive failed while resolving the fault.
    Kernel(SysError),
    /// The page copy itself faulted; the address space cannot be trusted.
    CopyFault(Fault),
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotCow(fault) => write!(f, "not a COW write: {}", fault),
            Self::Kernel(err) => write!(f, "host primitive failed: {}", err),
            Self::CopyFault(fault) => write!(f, "copy faulted: {}", fault),
        }
    }
}

impl From<SysError> for FaultError {
    fn from(value: SysError) -> Self {
        Self::Kernel(value)
    }
}

/// Services a write fault on a COW page by copy-and-remap.
///
/// After resolution this process holds a private writable copy at the
/// faulting address. Any other process still sharing the original frame is
/// unaffected: it keeps its own unmodified COW mapping.
pub fn handle_write_fault<K: HostKernel>(kernel: &mut K, fault: &Fault) -> Result<(), FaultError> {
    let pn = PageNum::containing(fault.va);

    // Legitimacy check: write attempt, directory entry present, PTE present
    // and tagged COW. Everything else is a real bug surfacing as a fault.
    let pte = kernel.pte(pn);
    let legitimate = fault.cause.contains(FaultCause::WRITE)
        && kernel.pde(pn).is_present()
        && pte.is_present()
        && pte.is_cow();
    if !legitimate {
        error!(target: "cow", "unserviceable {} (pte {:?})", fault, pte.flags());
        return Err(FaultError::NotCow(*fault));
    }

    let base = fault.va.page_base();
    let scratch = VirtAddr::new(SCRATCH_PAGE);
    let private = PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITABLE;

    // Fresh frame at the scratch address, copy the shared page into it, then
    // remap the scratch frame onto the faulting page. The remap atomically
    // replaces the shared mapping in this process only; the scratch mapping
    // is transient and dropped afterwards.
    kernel.page_alloc(Pid::SELF, scratch, private)?;
    kernel.copy_page(scratch, base).map_err(|err| match err {
        AccessError::Upcall(fault) | AccessError::Fatal(fault) => FaultError::CopyFault(fault),
    })?;
    kernel.page_map(Pid::SELF, scratch, Pid::SELF, base, private)?;
    kernel.page_unmap(Pid::SELF, scratch)?;

    debug!(target: "cow", "resolved {} -> private frame at {}", fault, base);
    Ok(())
}
