// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page-table entry permission bits and the read-only entry view.

use bitflags::bitflags;

use crate::layout::PAGE_SIZE;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Permission bits of a page-table entry.
    ///
    /// `COW` occupies one of the bits the hardware leaves to software. It is
    /// a process-defined tag meaning "this mapping must never be directly
    /// writable; a write fault here is expected and must be serviced".
    pub struct PageFlags: usize {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const COW = 1 << 11;
    }
}

impl PageFlags {
    /// Bits a process may set through the mapping syscalls. The kernel owns
    /// the remaining bits (accessed/dirty tracking).
    pub const SYSCALL_PERMS: Self =
        Self::PRESENT.union(Self::WRITABLE).union(Self::USER).union(Self::COW);
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Cause bits reported with a delivered page fault.
    pub struct FaultCause: u32 {
        /// The mapping was present; the access violated its permissions.
        const PROTECTION = 1 << 0;
        /// The faulting access was a write.
        const WRITE = 1 << 1;
        /// The access originated in user mode.
        const USER = 1 << 2;
    }
}

/// Raw page-table entry as exposed by the mirrored page-table view:
/// frame number in the high bits, permission flags in the low bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct PtEntry(usize);

const FLAG_MASK: usize = PAGE_SIZE - 1;

impl PtEntry {
    /// An absent entry.
    pub const EMPTY: Self = Self(0);

    /// Builds an entry mapping physical frame `ppn` with `flags`.
    #[inline]
    pub const fn new(ppn: usize, flags: PageFlags) -> Self {
        Self((ppn * PAGE_SIZE) | (flags.bits() & FLAG_MASK))
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Physical frame number this entry maps.
    #[inline]
    pub const fn frame_number(self) -> usize {
        self.0 / PAGE_SIZE
    }

    #[inline]
    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & FLAG_MASK)
    }

    #[inline]
    pub const fn is_present(self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        self.flags().contains(PageFlags::WRITABLE)
    }

    #[inline]
    pub const fn is_user(self) -> bool {
        self.flags().contains(PageFlags::USER)
    }

    #[inline]
    pub const fn is_cow(self) -> bool {
        self.flags().contains(PageFlags::COW)
    }
}
