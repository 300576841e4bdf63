// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Runtime-checkable invariants over the in-memory host-kernel model.
//!
//! Used by the test suite after every protocol step: a clean scan certifies
//! that the uncoordinated per-process mutations preserved the global sharing
//! discipline.
//!
//! 1. **COW never writable**: a COW-tagged PTE lacks WRITABLE, in any
//!    process, at any observable instant.
//! 2. **Shared frames read-only**: a frame mapped by two or more processes
//!    has WRITABLE clear in every mapping.
//! 3. **Exception stacks private**: a mapped exception-stack page is
//!    writable, never COW, and its frame is referenced exactly once.
//! 4. **Refcount consistency**: stored frame refcounts equal the number of
//!    referencing PTEs.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::layout::EXC_STACK_BASE;
use crate::types::{PageNum, Pid, VirtAddr};

use super::SimKernel;

/// A violated invariant with details.
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant.
    pub invariant: &'static str,
    /// What went wrong.
    pub description: String,
}

/// Scans the whole model. Returns every violation found (empty if all
/// invariants hold).
pub fn check_all(kernel: &SimKernel) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    violations.extend(check_cow_never_writable(kernel));
    violations.extend(check_shared_frames_read_only(kernel));
    violations.extend(check_exception_stacks_private(kernel));
    violations.extend(check_refcount_consistency(kernel));
    violations
}

fn check_cow_never_writable(kernel: &SimKernel) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for (pid, proc) in &kernel.procs {
        for (pn, entry) in &proc.pt {
            if entry.is_cow() && entry.is_writable() {
                violations.push(InvariantViolation {
                    invariant: "cow_never_writable",
                    description: format!("process {} maps {} COW and writable", pid, pn),
                });
            }
        }
    }
    violations
}

fn check_shared_frames_read_only(kernel: &SimKernel) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let mut owners: BTreeMap<usize, BTreeSet<Pid>> = BTreeMap::new();
    for (pid, proc) in &kernel.procs {
        for entry in proc.pt.values() {
            owners.entry(entry.frame_number()).or_default().insert(*pid);
        }
    }
    for (pid, proc) in &kernel.procs {
        for (pn, entry) in &proc.pt {
            let shared = owners
                .get(&entry.frame_number())
                .map(|pids| pids.len() > 1)
                .unwrap_or(false);
            if shared && entry.is_writable() {
                violations.push(InvariantViolation {
                    invariant: "shared_frames_read_only",
                    description: format!(
                        "frame {} is shared but process {} maps {} writable",
                        entry.frame_number(),
                        pid,
                        pn
                    ),
                });
            }
        }
    }
    violations
}

fn check_exception_stacks_private(kernel: &SimKernel) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let exc_pn = PageNum::containing(VirtAddr::new(EXC_STACK_BASE));
    for (pid, proc) in &kernel.procs {
        let entry = match proc.pt.get(&exc_pn) {
            Some(entry) => *entry,
            None => continue,
        };
        if !entry.is_writable() || entry.is_cow() {
            violations.push(InvariantViolation {
                invariant: "exception_stacks_private",
                description: format!(
                    "process {} has an exception stack that is not plainly writable ({:?})",
                    pid,
                    entry.flags()
                ),
            });
        }
        if kernel.frames.refs(entry.frame_number()) != 1 {
            violations.push(InvariantViolation {
                invariant: "exception_stacks_private",
                description: format!(
                    "process {} shares its exception-stack frame {}",
                    pid,
                    entry.frame_number()
                ),
            });
        }
    }
    violations
}

fn check_refcount_consistency(kernel: &SimKernel) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let mut counted: BTreeMap<usize, usize> = BTreeMap::new();
    for proc in kernel.procs.values() {
        for entry in proc.pt.values() {
            *counted.entry(entry.frame_number()).or_default() += 1;
        }
    }
    for (ppn, expected) in &counted {
        let stored = kernel.frames.refs(*ppn);
        if stored != *expected {
            violations.push(InvariantViolation {
                invariant: "refcount_consistency",
                description: format!(
                    "frame {} has refcount {} but {} referencing entries",
                    ppn, stored, expected
                ),
            });
        }
    }
    for (ppn, slot) in kernel.frames.frames.iter().enumerate() {
        if slot.is_some() && !counted.contains_key(&ppn) {
            violations.push(InvariantViolation {
                invariant: "refcount_consistency",
                description: format!("frame {} is live but unreferenced", ppn),
            });
        }
    }
    violations
}
