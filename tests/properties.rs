// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Property tests for the duplication policy and the sharing discipline.

use proptest::prelude::*;

use nexus_ufork::layout::{EXC_STACK_BASE, PAGE_SIZE};
use nexus_ufork::sim::{invariants, SimKernel};
use nexus_ufork::{
    duplicate_page, fork, handle_write_fault, AccessError, ForkOutcome, HostKernel, PageFlags,
    PageNum, Pid, Task, VirtAddr,
};

const RW: PageFlags = PageFlags::PRESENT.union(PageFlags::USER).union(PageFlags::WRITABLE);
const RO: PageFlags = PageFlags::PRESENT.union(PageFlags::USER);
const COW: PageFlags = PageFlags::PRESENT.union(PageFlags::USER).union(PageFlags::COW);

/// Pages used by the properties sit in a small window well away from the
/// scratch page and the stacks.
const BASE_PN: usize = 16;
const WINDOW: usize = 8;

fn page(slot: usize) -> VirtAddr {
    VirtAddr::new((BASE_PN + slot) * PAGE_SIZE)
}

#[derive(Clone, Copy, Debug)]
enum InitialPerm {
    Writable,
    ReadOnly,
    Cow,
}

fn initial_perm() -> impl Strategy<Value = InitialPerm> {
    prop_oneof![
        Just(InitialPerm::Writable),
        Just(InitialPerm::ReadOnly),
        Just(InitialPerm::Cow),
    ]
}

/// Installs a page with the requested pre-state in the current process.
fn seed_page(kernel: &mut SimKernel, va: VirtAddr, perm: InitialPerm) {
    kernel.page_alloc(Pid::SELF, va, RW).expect("seed alloc");
    match perm {
        InitialPerm::Writable => {}
        InitialPerm::ReadOnly => {
            kernel.page_map(Pid::SELF, va, Pid::SELF, va, RO).expect("seal read-only")
        }
        InitialPerm::Cow => {
            kernel.page_map(Pid::SELF, va, Pid::SELF, va, COW).expect("tag COW")
        }
    }
}

fn boot() -> (SimKernel, Task) {
    let mut kernel = SimKernel::new();
    kernel
        .page_alloc(Pid::SELF, VirtAddr::new(EXC_STACK_BASE), RW)
        .expect("exception stack");
    let task = Task::current(&kernel);
    (kernel, task)
}

fn assert_invariants(kernel: &SimKernel) {
    let violations = invariants::check_all(kernel);
    assert!(violations.is_empty(), "invariant violations: {:?}", violations);
}

fn write_resolving(kernel: &mut SimKernel, va: VirtAddr, bytes: &[u8]) {
    match kernel.write(va, bytes) {
        Ok(()) => {}
        Err(AccessError::Upcall(fault)) => {
            handle_write_fault(kernel, &fault).expect("resolve COW fault");
            kernel.write(va, bytes).expect("retry after resolution");
        }
        Err(AccessError::Fatal(fault)) => panic!("process destroyed by {}", fault),
    }
}

fn read_byte(kernel: &mut SimKernel, va: VirtAddr) -> u8 {
    let mut buf = [0u8; 1];
    kernel.read(va, &mut buf).expect("read");
    buf[0]
}

proptest! {
    /// Applying the duplication policy twice yields the same final
    /// permission state as applying it once, on both sides.
    #[test]
    fn duplication_is_idempotent(perms in prop::collection::vec(initial_perm(), 1..WINDOW)) {
        let (mut kernel, task) = boot();
        for (slot, perm) in perms.iter().enumerate() {
            seed_page(&mut kernel, page(slot), *perm);
        }
        let target = kernel.process_create().expect("target");

        for slot in 0..perms.len() {
            let pn = PageNum::containing(page(slot));
            duplicate_page(&mut kernel, target, pn).expect("first pass");
        }
        let me = task.pid();
        let once: Vec<_> = (0..perms.len())
            .map(|slot| {
                let pn = PageNum::containing(page(slot));
                (kernel.entry_of(me, pn), kernel.entry_of(target, pn))
            })
            .collect();

        for slot in 0..perms.len() {
            let pn = PageNum::containing(page(slot));
            duplicate_page(&mut kernel, target, pn).expect("second pass");
        }
        let twice: Vec<_> = (0..perms.len())
            .map(|slot| {
                let pn = PageNum::containing(page(slot));
                (kernel.entry_of(me, pn), kernel.entry_of(target, pn))
            })
            .collect();

        prop_assert_eq!(once, twice);
        assert_invariants(&kernel);
    }

    /// Under any interleaving of parent and child writes, no frame is ever
    /// writable from two processes, and each process always reads exactly
    /// what it last wrote (or the pre-fork value if it never wrote).
    #[test]
    fn interleaved_writes_preserve_sharing_and_isolation(
        ops in prop::collection::vec((any::<bool>(), 0..WINDOW, any::<u8>()), 1..32)
    ) {
        let (mut kernel, mut task) = boot();
        for slot in 0..WINDOW {
            seed_page(&mut kernel, page(slot), InitialPerm::Writable);
            kernel.write(page(slot), &[slot as u8]).expect("seed value");
        }

        let parent = task.pid();
        let child = match fork(&mut kernel, &mut task).expect("fork") {
            ForkOutcome::Parent(child) => child,
            ForkOutcome::Child => unreachable!("parent context"),
        };
        assert_invariants(&kernel);

        // Expected byte per (process, slot); both start from the parent's
        // pre-fork values.
        let mut expected = [[0u8; WINDOW]; 2];
        for slot in 0..WINDOW {
            expected[0][slot] = slot as u8;
            expected[1][slot] = slot as u8;
        }

        for (as_child, slot, value) in ops {
            let (pid, side) = if as_child { (child, 1) } else { (parent, 0) };
            kernel.switch_to(pid).expect("schedule writer");
            write_resolving(&mut kernel, page(slot), &[value]);
            expected[side][slot] = value;
            assert_invariants(&kernel);

            for (check_pid, check_side) in [(parent, 0), (child, 1)] {
                kernel.switch_to(check_pid).expect("schedule reader");
                for probe in 0..WINDOW {
                    prop_assert_eq!(
                        read_byte(&mut kernel, page(probe)),
                        expected[check_side][probe]
                    );
                }
            }
        }
    }
}
