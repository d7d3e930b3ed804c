// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Copy-on-write fork built from exofork, page_map and the fault upcall.

use exo_abi::layout::{PAGE_SIZE, PT_SPAN, UTEXT, UTOP, UXSTACKTOP};
use exo_abi::{Perm, Pid, ProcStatus, Sys};

use crate::env::{Env, UserError};
use crate::pgfault::{cow_fault, set_pgfault_handler, UPCALL_ENTRY};

/// Forks the calling process. Returns the child's id in the parent and
/// [`Pid::SELF`] in the child.
///
/// Writable and copy-on-write pages are shared copy-on-write in both
/// processes; read-only pages are shared as they are. The exception stack
/// is never shared.
pub fn fork<S: Sys>(env: &mut Env<S>) -> Result<Pid, UserError> {
    set_pgfault_handler(env, cow_fault)?;

    let result = env.sys_mut().exofork();
    let child = env.require(result, "fork: exofork")?;
    if child.is_self() {
        let me = env.sys_mut().self_id();
        env.set_this_env(me);
        return Ok(Pid::SELF);
    }

    let xstack = UXSTACKTOP - PAGE_SIZE;
    let mut va = UTEXT;
    while va < UTOP {
        if !env.sys().table_present(va) {
            va = (va / PT_SPAN + 1) * PT_SPAN;
            continue;
        }
        if va != xstack {
            if let Some(perm) = env.sys().page_perm(va) {
                duppage(env, child, va, perm)?;
            }
        }
        va += PAGE_SIZE;
    }

    let rw = Perm::PRESENT | Perm::USER | Perm::WRITE;
    let result = env.sys_mut().page_alloc(child, xstack, rw);
    env.require(result, "fork: child exception stack")?;
    let entry = env.sys().fault_upcall().unwrap_or(UPCALL_ENTRY);
    let result = env.sys_mut().set_fault_upcall(child, entry);
    env.require(result, "fork: set_fault_upcall")?;
    let result = env.sys_mut().set_status(child, ProcStatus::Runnable);
    env.require(result, "fork: set_status")?;
    Ok(child)
}

/// Maps the page at `va` into `child`. The child mapping is made before the
/// parent's own is downgraded, so a parent write in between cannot leak
/// into the child.
fn duppage<S: Sys>(env: &mut Env<S>, child: Pid, va: usize, perm: Perm) -> Result<(), UserError> {
    if perm.intersects(Perm::WRITE | Perm::COW) {
        let cow = Perm::REQUIRED | Perm::COW;
        let result = env.sys_mut().page_map(Pid::SELF, va, child, va, cow);
        env.require(result, "duppage: map child")?;
        let result = env.sys_mut().page_map(Pid::SELF, va, Pid::SELF, va, cow);
        env.require(result, "duppage: remap self")
    } else {
        let result = env.sys_mut().page_map(Pid::SELF, va, child, va, perm & Perm::SYSCALL);
        env.require(result, "duppage: share")
    }
}
