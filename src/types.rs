// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal newtypes for safer address and process handling
//! PUBLIC API: VirtAddr, PageNum, Pid, UpcallEntry
//! DEPENDS_ON: layout::PAGE_SIZE
//! INVARIANTS: PageNum/VirtAddr conversions are pure and total; Pid 0 is
//!     reserved as the "calling process" designator in syscall arguments

use core::fmt;

use crate::layout::PAGE_SIZE;

/// Virtual address inside a process's address space.
///
/// Not required to be page aligned: fault addresses point at the offending
/// byte, not at a page boundary.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Rounds down to the containing page boundary.
    #[inline]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    /// Byte offset within the containing page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    #[inline]
    pub fn checked_add(self, v: usize) -> Option<Self> {
        self.0.checked_add(v).map(Self)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Virtual page number: `addr / PAGE_SIZE`.
///
/// Exactly one page-table entry exists per process per page number, so this
/// is the index type every per-page operation is keyed by. Raw addresses are
/// never reinterpreted as pointers anywhere in the protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PageNum(usize);

impl PageNum {
    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Page number of the page containing `addr`.
    #[inline]
    pub const fn containing(addr: VirtAddr) -> Self {
        Self(addr.raw() / PAGE_SIZE)
    }

    /// Base address of this page.
    #[inline]
    pub const fn base_addr(self) -> VirtAddr {
        VirtAddr::new(self.0 * PAGE_SIZE)
    }
}

impl fmt::Display for PageNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pn {:#x}", self.0)
    }
}

/// Process identifier.
///
/// **Invariant**: the raw value 0 is never a real process. In syscall
/// arguments it designates the calling process itself ([`Pid::SELF`]), and as
/// a `process_create` return value it tells the caller it is executing as the
/// newly created process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    /// Designates the calling process in syscall arguments.
    pub const SELF: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// True for the reserved zero value.
    #[inline]
    pub const fn is_self(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque fault-upcall entry point.
///
/// The host kernel stores and later invokes it without interpreting the
/// value; the crate publishes one well-known entry ([`crate::fault::ENTRY`]).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct UpcallEntry(usize);

impl UpcallEntry {
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::PAGE_SIZE;

    #[test]
    fn page_number_round_trip() {
        let addr = VirtAddr::new(3 * PAGE_SIZE + 17);
        let pn = PageNum::containing(addr);
        assert_eq!(pn.raw(), 3);
        assert_eq!(pn.base_addr(), addr.page_base());
        assert_eq!(addr.page_offset(), 17);
    }

    #[test]
    fn aligned_address_is_its_own_base() {
        let addr = VirtAddr::new(8 * PAGE_SIZE);
        assert!(addr.is_page_aligned());
        assert_eq!(addr.page_base(), addr);
        assert_eq!(PageNum::containing(addr).base_addr(), addr);
    }

    #[test]
    fn pid_zero_is_reserved() {
        assert!(Pid::SELF.is_self());
        assert!(!Pid::from_raw(1).is_self());
    }
}
