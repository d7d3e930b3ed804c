// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: User page-fault delivery onto the exception stack
//! OWNERS: @kernel-team
//! PUBLIC API: deliver_page_fault(), record_address(), KillReason, validate_upcall()
//! DEPENDS_ON: task::Process, mm::{AddressSpace, FrameTable, PageFault}
//! INVARIANTS: The record is only written after the whole range checked as user-writable;
//!             a nested fault pushes below the current exception-stack pointer with a one-word gap

use exo_abi::layout::{page_down, PAGE_SIZE, UTEXT, UTOP, UXSTACKTOP, WORD};
use exo_abi::{FaultRecord, Perm};

use crate::mm::{AddressSpace, FrameTable, PageFault};
use crate::task::Process;

/// Why a faulting process could not be sent to its upcall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    /// No upcall registered.
    NoUpcall,
    /// The record would not fit in writable exception-stack memory.
    ExceptionStack { va: usize },
}

/// Where the record for a fault taken with stack pointer `sp` goes.
pub fn record_address(sp: usize) -> usize {
    let on_xstack = (UXSTACKTOP - PAGE_SIZE..UXSTACKTOP).contains(&sp);
    if on_xstack {
        sp.wrapping_sub(WORD + FaultRecord::SIZE)
    } else {
        UXSTACKTOP - FaultRecord::SIZE
    }
}

/// Pushes a fault record for `fault` and redirects `process` to its upcall.
/// Returns the record address, which is also the new stack pointer.
pub fn deliver_page_fault(
    process: &mut Process,
    frames: &mut FrameTable,
    fault: PageFault,
) -> Result<usize, KillReason> {
    let upcall = process.fault_upcall.ok_or(KillReason::NoUpcall)?;
    let record_va = record_address(process.frame.sp);
    process
        .space
        .check_user(record_va, FaultRecord::SIZE, Perm::USER | Perm::WRITE)
        .map_err(|va| KillReason::ExceptionStack { va })?;

    let record = FaultRecord { fault_va: fault.va, flags: fault.flags, frame: process.frame };
    process
        .space
        .copy_out(frames, record_va, &record.to_le_bytes())
        .map_err(|va| KillReason::ExceptionStack { va })?;

    process.frame.pc = upcall;
    process.frame.sp = record_va;
    log_debug!(
        target: "trap",
        "{} fault va={:#x} flags={:#x} -> upcall {:#x} record {:#x}",
        process.id, fault.va, fault.flags.bits(), upcall, record_va
    );
    Ok(record_va)
}

/// An upcall entry must lie in mapped user text of the target.
pub fn validate_upcall(space: &AddressSpace, entry: usize) -> bool {
    (UTEXT..UTOP).contains(&entry)
        && space
            .lookup(page_down(entry))
            .map_or(false, |pte| pte.perm.contains(Perm::PRESENT | Perm::USER))
}
