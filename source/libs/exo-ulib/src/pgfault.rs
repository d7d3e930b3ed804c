// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page-fault handler registration and the copy-on-write handler.

use exo_abi::layout::{page_down, PAGE_SIZE, PFTEMP, UTEXT, UXSTACKTOP};
use exo_abi::{FaultFlags, FaultRecord, Perm, Pid, Sys};

use crate::env::{Env, FaultHandler, UserError};

/// Address registered with the kernel as the upcall entry point.
pub const UPCALL_ENTRY: usize = UTEXT;

const RW: Perm = Perm::PRESENT.union(Perm::USER).union(Perm::WRITE);

/// Installs `handler`. The first installation also allocates the exception
/// stack and registers the upcall with the kernel.
pub fn set_pgfault_handler<S: Sys>(env: &mut Env<S>, handler: FaultHandler<S>) -> Result<(), UserError> {
    if env.runtime().handler.is_none() {
        let result = env.sys_mut().page_alloc(Pid::SELF, UXSTACKTOP - PAGE_SIZE, RW);
        env.require(result, "set_pgfault_handler: page_alloc")?;
        let result = env.sys_mut().set_fault_upcall(Pid::SELF, UPCALL_ENTRY);
        env.require(result, "set_pgfault_handler: set_fault_upcall")?;
    }
    env.set_handler(handler);
    Ok(())
}

/// Resolves a write to a copy-on-write page by giving the caller a private
/// writable copy. Any other fault is fatal.
pub fn cow_fault<S: Sys>(env: &mut Env<S>, record: &FaultRecord) -> Result<(), UserError> {
    let addr = page_down(record.fault_va);
    let is_cow = env
        .sys()
        .page_perm(addr)
        .map_or(false, |perm| perm.contains(Perm::PRESENT | Perm::COW));
    if !record.flags.contains(FaultFlags::WRITE) || !is_cow {
        return Err(env.fatal(format_args!(
            "unexpected fault va {:#x} flags {:#x} ip {:#x}",
            record.fault_va,
            record.flags.bits(),
            record.frame.pc
        )));
    }

    let result = env.sys_mut().page_alloc(Pid::SELF, PFTEMP, RW);
    env.require(result, "cow_fault: page_alloc")?;

    let mut page = [0u8; PAGE_SIZE];
    if env.sys_mut().load(addr, &mut page).is_err() {
        return Err(env.fatal(format_args!("cow_fault: read {:#x}", addr)));
    }
    if env.sys_mut().store(PFTEMP, &page).is_err() {
        return Err(env.fatal(format_args!("cow_fault: write scratch page")));
    }

    let result = env.sys_mut().page_map(Pid::SELF, PFTEMP, Pid::SELF, addr, RW);
    env.require(result, "cow_fault: page_map")?;
    let result = env.sys_mut().page_unmap(Pid::SELF, PFTEMP);
    env.require(result, "cow_fault: page_unmap")
}
