// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Rendezvous IPC: one blocked receiver, one value, at most one page
//! OWNERS: @kernel-ipc-team
//! PUBLIC API: recv(), try_send(), IpcError
//! DEPENDS_ON: task::ProcessTable, vm::{check_perm, share_pte}
//! INVARIANTS: NotReceiving is checked before any mutation; delivery (value, from,
//!             perm, receiving=false, Runnable) happens as one step after the page
//!             transfer succeeded

use exo_abi::layout::{is_page_aligned, UTOP};
use exo_abi::{nr, Perm, Pid, ProcStatus, REG_RET};

use crate::mm::FrameTable;
use crate::task::{ProcessError, ProcessTable};
use crate::vm::{self, VmError};

/// Error returned by the rendezvous operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// Target does not exist.
    NoSuchProcess,
    /// Target is not blocked in `recv`.
    NotReceiving,
    /// Page transfer failed validation or ran out of memory.
    Vm(VmError),
}

impl From<VmError> for IpcError {
    fn from(value: VmError) -> Self {
        Self::Vm(value)
    }
}

impl From<ProcessError> for IpcError {
    fn from(_: ProcessError) -> Self {
        Self::NoSuchProcess
    }
}

/// Blocks `caller` waiting for a message. `dst_va >= UTOP` refuses pages.
///
/// The caller is left `NotRunnable` and parked inside `IPC_RECV`; the
/// delivering send completes the call with 0.
pub fn recv(procs: &mut ProcessTable, caller: Pid, dst_va: usize) -> Result<(), IpcError> {
    if dst_va < UTOP && !is_page_aligned(dst_va) {
        return Err(VmError::InvalidArgument.into());
    }
    let process = procs.get_mut(caller).ok_or(IpcError::NoSuchProcess)?;
    process.mailbox.receiving = true;
    process.mailbox.dst_va = dst_va;
    process.status = ProcStatus::NotRunnable;
    process.parked = Some(nr::IPC_RECV);
    log_debug!(target: "ipc", "{} receiving dst={:#x}", caller, dst_va);
    Ok(())
}

/// Attempts to deliver `value` (and the page at `src_va` when both sides
/// want one) to `target`. Never blocks.
///
/// `perm` is the decoded permission word; an `Err` there (a word wider than
/// `Perm`) is reported only when a page actually moves.
pub fn try_send(
    procs: &mut ProcessTable,
    frames: &mut FrameTable,
    caller: Pid,
    target: Pid,
    value: usize,
    src_va: usize,
    perm: Result<Perm, VmError>,
) -> Result<(), IpcError> {
    let target = procs.resolve(caller, target, false)?;
    let dst_va = {
        let receiver = procs.get(target).ok_or(IpcError::NoSuchProcess)?;
        if !receiver.mailbox.receiving {
            return Err(IpcError::NotReceiving);
        }
        receiver.mailbox.dst_va
    };

    let mut transferred = Perm::empty();
    if src_va < UTOP {
        if !is_page_aligned(src_va) {
            return Err(VmError::InvalidArgument.into());
        }
        // A receiver that asked for no page silently drops the offer,
        // including its permission word.
        if dst_va < UTOP {
            let perm = perm?;
            vm::check_perm(perm)?;
            let pte = procs
                .get(caller)
                .and_then(|p| vm::page_lookup(&p.space, src_va))
                .ok_or(VmError::InvalidArgument)?;
            let receiver = procs.get_mut(target).ok_or(IpcError::NoSuchProcess)?;
            vm::share_pte(&mut receiver.space, frames, pte, dst_va, perm)?;
            transferred = perm;
        }
    }

    let receiver = procs.get_mut(target).ok_or(IpcError::NoSuchProcess)?;
    receiver.mailbox.receiving = false;
    receiver.mailbox.value = value;
    receiver.mailbox.from = caller;
    receiver.mailbox.perm = transferred;
    receiver.status = ProcStatus::Runnable;
    receiver.frame.regs[REG_RET] = 0;
    log_debug!(
        target: "ipc",
        "{} -> {} value={} perm={:#x}",
        caller, target, value, transferred.bits()
    );
    Ok(())
}
