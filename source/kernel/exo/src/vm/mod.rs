// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page-granularity address-space primitives (allocate, share, unmap, lookup)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: page_alloc, page_map, page_unmap, page_lookup, check_perm, VmError
//! DEPENDS_ON: task::ProcessTable, mm::{AddressSpace, FrameTable}
//! INVARIANTS: Target resolved before any argument is trusted; user pages only below UTOP;
//!             permission words within Perm::SYSCALL and carrying P|U; never grant write
//!             from a read-only source; failed operations leave no partial state

use exo_abi::layout::is_user_page;
use exo_abi::{Perm, Pid};

use crate::mm::{AddressSpace, FrameId, FrameTable, Pte};
use crate::task::{ProcessError, ProcessTable};


/// Errors reported by the primitive layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    BadTarget,
    InvalidArgument,
    OutOfMemory,
}

impl From<ProcessError> for VmError {
    fn from(value: ProcessError) -> Self {
        match value {
            ProcessError::BadTarget => Self::BadTarget,
            ProcessError::NoFreeSlot | ProcessError::OutOfMemory => Self::OutOfMemory,
        }
    }
}

/// `va` must be a page-aligned user address.
#[inline]
pub fn check_page_va(va: usize) -> Result<(), VmError> {
    if is_user_page(va) {
        Ok(())
    } else {
        Err(VmError::InvalidArgument)
    }
}

/// `perm` must carry PRESENT|USER and nothing outside the syscall allow-list.
#[inline]
pub fn check_perm(perm: Perm) -> Result<(), VmError> {
    if perm.is_syscall_valid() {
        Ok(())
    } else {
        Err(VmError::InvalidArgument)
    }
}

fn space_mut(procs: &mut ProcessTable, pid: Pid) -> Result<&mut AddressSpace, VmError> {
    procs.get_mut(pid).map(|p| &mut p.space).ok_or(VmError::BadTarget)
}

/// Maps a fresh zero-filled frame at `va`. The frame goes back to the pool
/// if the page table cannot grow.
pub(crate) fn map_fresh(
    space: &mut AddressSpace,
    frames: &mut FrameTable,
    va: usize,
    perm: Perm,
) -> Result<FrameId, VmError> {
    let frame = frames.alloc_zeroed().map_err(|_| VmError::OutOfMemory)?;
    if space.page_table_mut().insert(frames, va, frame, perm).is_err() {
        frames.free(frame);
        return Err(VmError::OutOfMemory);
    }
    Ok(frame)
}

/// Installs `src` (looked up in another space) at `dst_va`, refusing to
/// upgrade a read-only source to writable.
pub(crate) fn share_pte(
    dst: &mut AddressSpace,
    frames: &mut FrameTable,
    src: Pte,
    dst_va: usize,
    perm: Perm,
) -> Result<(), VmError> {
    if perm.contains(Perm::WRITE) && !src.perm.contains(Perm::WRITE) {
        return Err(VmError::InvalidArgument);
    }
    dst.page_table_mut()
        .insert(frames, dst_va, src.frame, perm)
        .map_err(|_| VmError::OutOfMemory)
}

/// Allocates a zero-filled page at `va` in `target`, replacing any mapping.
pub fn page_alloc(
    procs: &mut ProcessTable,
    frames: &mut FrameTable,
    caller: Pid,
    target: Pid,
    va: usize,
    perm: Perm,
) -> Result<(), VmError> {
    let target = procs.resolve(caller, target, true)?;
    check_page_va(va)?;
    check_perm(perm)?;
    let frame = map_fresh(space_mut(procs, target)?, frames, va, perm)?;
    log_trace!(target: "vm", "alloc {} va={:#x} {:?} perm={:#x}", target, va, frame, perm.bits());
    Ok(())
}

/// Shares the frame at `src_va` in `src` into `dst` at `dst_va`.
#[allow(clippy::too_many_arguments)]
pub fn page_map(
    procs: &mut ProcessTable,
    frames: &mut FrameTable,
    caller: Pid,
    src: Pid,
    src_va: usize,
    dst: Pid,
    dst_va: usize,
    perm: Perm,
) -> Result<(), VmError> {
    let src = procs.resolve(caller, src, true)?;
    let dst = procs.resolve(caller, dst, true)?;
    check_page_va(src_va)?;
    check_page_va(dst_va)?;
    check_perm(perm)?;

    let pte = procs
        .get(src)
        .and_then(|p| page_lookup(&p.space, src_va))
        .ok_or(VmError::InvalidArgument)?;
    share_pte(space_mut(procs, dst)?, frames, pte, dst_va, perm)?;
    log_trace!(
        target: "vm",
        "map {}:{:#x} -> {}:{:#x} {:?} perm={:#x}",
        src, src_va, dst, dst_va, pte.frame, perm.bits()
    );
    Ok(())
}

/// Removes the mapping at `va`. Unmapped addresses succeed silently.
pub fn page_unmap(
    procs: &mut ProcessTable,
    frames: &mut FrameTable,
    caller: Pid,
    target: Pid,
    va: usize,
) -> Result<(), VmError> {
    let target = procs.resolve(caller, target, true)?;
    check_page_va(va)?;
    if let Some(old) = space_mut(procs, target)?.page_table_mut().remove(frames, va) {
        log_trace!(target: "vm", "unmap {} va={:#x} {:?}", target, va, old.frame);
    }
    Ok(())
}

/// Mapping at `va`, if any.
#[inline]
pub fn page_lookup(space: &AddressSpace, va: usize) -> Option<Pte> {
    space.lookup(va)
}
