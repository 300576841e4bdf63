// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! User-space fork with copy-on-write page sharing.
//!
//! The host kernel exposes page-granular virtual-memory primitives as system
//! calls ([`sys::HostKernel`]) together with a read-only mirrored view of the
//! calling process's page tables. On top of that surface this crate builds:
//!
//! - a per-page duplication policy ([`fork::duplicate_page`]),
//! - a COW write-fault handler ([`fault::handle_write_fault`]),
//! - a fork orchestrator ([`fork::fork`]) that duplicates the full user
//!   address range lazily and activates the child only once every eligible
//!   page has been processed.
//!
//! The governing invariant is that no two processes ever hold simultaneous
//! writable access to the same physical frame. It is maintained without
//! locks: each process mutates only its own page-table view through the
//! syscall interface, and every individual syscall is atomic with respect to
//! the address space it touches.
//!
//! [`sim::SimKernel`] is a pure in-memory model of the host kernel used by
//! the test suite and usable as a reference for embedders.

#![no_std]
#![forbid(clippy::unwrap_used)]

extern crate alloc;

pub mod fault;
pub mod fork;
pub mod layout;
pub mod pte;
pub mod sim;
pub mod sys;
pub mod types;

pub use fault::{handle_write_fault, FaultError};
pub use fork::{duplicate_page, fork, ForkError, ForkOutcome, Task};
pub use pte::{FaultCause, PageFlags, PtEntry};
pub use sys::{AccessError, Fault, HostKernel, SysError};
pub use types::{PageNum, Pid, UpcallEntry, VirtAddr};
