// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fixed user address-space layout.
//!
//! Every process shares the same layout, which is what lets fork install the
//! child's pages at identical virtual addresses and lets the fault handler
//! use a process-reserved scratch page without coordination.

use static_assertions::{const_assert, const_assert_eq};

/// Size of a single page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Pages covered by one page-directory entry.
pub const PAGES_PER_DIR: usize = 1024;

/// First address above the user-accessible region (the user/kernel boundary).
pub const USER_LIMIT: usize = 0xeec0_0000;

/// Top of the exception stack; the stack occupies the single page below.
pub const EXC_STACK_TOP: usize = USER_LIMIT;

/// Base of the per-process exception-stack page.
///
/// This page is provisioned directly with `page_alloc`, never through the
/// duplication policy: a COW-marked exception stack would fault while
/// handling its own fault.
pub const EXC_STACK_BASE: usize = EXC_STACK_TOP - PAGE_SIZE;

/// Top of the normal user stack. One unmapped guard page separates it from
/// the exception stack, and fork duplicates only pages below this address.
pub const USER_STACK_TOP: usize = USER_LIMIT - 2 * PAGE_SIZE;

/// Process-reserved scratch page used transiently while resolving a COW
/// fault. The fresh frame is mapped here for the copy because mapping it at
/// the final address first would destroy the data still being copied.
pub const SCRATCH_PAGE: usize = 0x007f_f000;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert_eq!(USER_LIMIT % PAGE_SIZE, 0);
const_assert_eq!(SCRATCH_PAGE % PAGE_SIZE, 0);
// The scratch page must lie inside the duplicated range's address space but
// is transient, so it never aliases either stack region.
const_assert!(SCRATCH_PAGE + PAGE_SIZE <= USER_STACK_TOP);
const_assert!(USER_STACK_TOP < EXC_STACK_BASE);
const_assert!(EXC_STACK_BASE < USER_LIMIT);
