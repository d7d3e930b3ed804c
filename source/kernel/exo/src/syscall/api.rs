// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table), Context
//! DEPENDS_ON: vm, ipc, task::ProcessTable, sched::Scheduler, hal::Console, trap
//! INVARIANTS: Stable syscall numbers; Decode→Check→Execute pattern; user buffers are
//!             checked before they are read, and a bad buffer terminates the caller

use core::fmt::Write as _;

use exo_abi::{nr, Perm, Pid, ProcStatus, REG_RET};

use super::{Args, Error, SysResult, SyscallTable};
use crate::hal::{Console, ConsoleWriter};
use crate::mm::FrameTable;
use crate::sched::Scheduler;
use crate::task::{ProcessError, ProcessTable};
use crate::vm::{self, VmError};
use crate::{ipc, trap};

/// Kernel state a handler may touch on behalf of `caller`.
pub struct Context<'a> {
    pub caller: Pid,
    pub procs: &'a mut ProcessTable,
    pub frames: &'a mut FrameTable,
    pub scheduler: &'a mut Scheduler,
    pub console: &'a mut dyn Console,
}

impl<'a> Context<'a> {
    /// Creates a new context for the calling process.
    pub fn new(
        caller: Pid,
        procs: &'a mut ProcessTable,
        frames: &'a mut FrameTable,
        scheduler: &'a mut Scheduler,
        console: &'a mut dyn Console,
    ) -> Self {
        Self { caller, procs, frames, scheduler, console }
    }

    fn console_line(&mut self, args: core::fmt::Arguments<'_>) {
        let mut writer = ConsoleWriter(&mut *self.console);
        let _ = writer.write_fmt(args);
        let _ = writer.write_char('\n');
    }

    /// Destroys `target`. The caller is only marked dying; the trap exit
    /// path reclaims it.
    fn destroy(&mut self, target: Pid) -> SysResult<()> {
        if target == self.caller {
            let process = self.procs.get_mut(target).ok_or(ProcessError::BadTarget)?;
            process.status = ProcStatus::Dying;
        } else {
            self.procs.free(self.frames, target)?;
        }
        Ok(())
    }
}

/// Registers the default set of syscall handlers.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(nr::PRINT, sys_print);
    table.register(nr::READ_CHAR, sys_read_char);
    table.register(nr::SELF_ID, sys_self_id);
    table.register(nr::DESTROY, sys_destroy);
    table.register(nr::PAGE_ALLOC, sys_page_alloc);
    table.register(nr::PAGE_MAP, sys_page_map);
    table.register(nr::PAGE_UNMAP, sys_page_unmap);
    table.register(nr::EXOFORK, sys_exofork);
    table.register(nr::SET_STATUS, sys_set_status);
    table.register(nr::SET_FAULT_UPCALL, sys_set_fault_upcall);
    table.register(nr::YIELD, sys_yield);
    table.register(nr::IPC_TRY_SEND, sys_ipc_try_send);
    table.register(nr::IPC_RECV, sys_ipc_recv);
}

// Typed decoders: Decode→Check→Execute

#[inline]
fn decode_pid(raw: usize) -> Result<Pid, Error> {
    u32::try_from(raw).map(Pid::from_raw).map_err(|_| ProcessError::BadTarget.into())
}

#[inline]
fn decode_perm(raw: usize) -> Result<Perm, Error> {
    u32::try_from(raw).map(Perm::from_bits_retain).map_err(|_| VmError::InvalidArgument.into())
}

#[derive(Copy, Clone)]
struct PrintArgsTyped {
    va: usize,
    len: usize,
}

impl PrintArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self { va: args.get(0), len: args.get(1) })
    }
}

#[derive(Copy, Clone)]
struct PageAllocArgsTyped {
    target: Pid,
    va: usize,
    perm: Perm,
}

impl PageAllocArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self {
            target: decode_pid(args.get(0))?,
            va: args.get(1),
            perm: decode_perm(args.get(2))?,
        })
    }
}

#[derive(Copy, Clone)]
struct PageMapArgsTyped {
    src: Pid,
    src_va: usize,
    dst: Pid,
    dst_va: usize,
    perm: Perm,
}

impl PageMapArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self {
            src: decode_pid(args.get(0))?,
            src_va: args.get(1),
            dst: decode_pid(args.get(2))?,
            dst_va: args.get(3),
            perm: decode_perm(args.get(4))?,
        })
    }
}

#[derive(Copy, Clone)]
struct StatusArgsTyped {
    target: Pid,
    status: ProcStatus,
}

impl StatusArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let status = ProcStatus::from_raw(args.get(1)).ok_or(VmError::InvalidArgument)?;
        Ok(Self { target: decode_pid(args.get(0))?, status })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        match self.status {
            ProcStatus::Runnable | ProcStatus::NotRunnable => Ok(()),
            _ => Err(VmError::InvalidArgument.into()),
        }
    }
}

#[derive(Copy, Clone)]
struct SendArgsTyped {
    target: Pid,
    value: usize,
    src_va: usize,
    perm: Result<Perm, VmError>,
}

impl SendArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self {
            target: decode_pid(args.get(0))?,
            value: args.get(1),
            src_va: args.get(2),
            // Only a page transfer looks at the permission word.
            perm: u32::try_from(args.get(3))
                .map(Perm::from_bits_retain)
                .map_err(|_| VmError::InvalidArgument),
        })
    }
}

fn sys_print(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = PrintArgsTyped::decode(args)?;
    let caller = ctx.caller;
    let space = &ctx.procs.get(caller).ok_or(ProcessError::BadTarget)?.space;
    if let Err(bad_va) = space.check_user(typed.va, typed.len, Perm::USER) {
        log_warn!(target: "sys", "{} print from {:#x}+{} rejected", caller, typed.va, typed.len);
        ctx.console_line(format_args!(
            "[{:08x}] user_mem_check assertion failure for va {:08x}",
            caller.raw(),
            bad_va
        ));
        ctx.destroy(caller)?;
        return Err(Error::Killed);
    }

    let mut chunk = [0u8; 128];
    let mut done = 0;
    while done < typed.len {
        let n = (typed.len - done).min(chunk.len());
        let space = &ctx.procs.get(caller).ok_or(ProcessError::BadTarget)?.space;
        space
            .copy_in(ctx.frames, typed.va + done, &mut chunk[..n])
            .map_err(|_| VmError::InvalidArgument)?;
        ctx.console.put_bytes(&chunk[..n]);
        done += n;
    }
    Ok(0)
}

fn sys_read_char(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.console.get_byte().map_or(0, usize::from))
}

fn sys_self_id(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.caller.raw() as usize)
}

fn sys_destroy(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let target = ctx.procs.resolve(ctx.caller, decode_pid(args.get(0))?, true)?;
    let caller = ctx.caller.raw();
    if target == ctx.caller {
        ctx.console_line(format_args!("[{:08x}] exiting gracefully", caller));
    } else {
        ctx.console_line(format_args!("[{:08x}] destroying {:08x}", caller, target.raw()));
    }
    ctx.destroy(target)?;
    if target == ctx.caller {
        Err(Error::Killed)
    } else {
        Ok(0)
    }
}

fn sys_yield(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    ctx.scheduler.schedule(ctx.procs);
    Ok(0)
}

fn sys_exofork(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    let parent_frame = ctx.procs.get(ctx.caller).ok_or(ProcessError::BadTarget)?.frame;
    let child = ctx.procs.alloc(ctx.frames, Some(ctx.caller))?;
    let process = ctx.procs.get_mut(child).ok_or(ProcessError::BadTarget)?;
    process.frame = parent_frame;
    process.frame.regs[REG_RET] = 0;
    process.parked = Some(nr::EXOFORK);
    log_info!(target: "task", "{} forked {}", ctx.caller, child);
    Ok(child.raw() as usize)
}

fn sys_set_status(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = StatusArgsTyped::decode(args)?;
    typed.check()?;
    let target = ctx.procs.resolve(ctx.caller, typed.target, true)?;
    let process = ctx.procs.get_mut(target).ok_or(ProcessError::BadTarget)?;
    process.status = typed.status;
    Ok(0)
}

fn sys_set_fault_upcall(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let target = ctx.procs.resolve(ctx.caller, decode_pid(args.get(0))?, true)?;
    let entry = args.get(1);
    let process = ctx.procs.get_mut(target).ok_or(ProcessError::BadTarget)?;
    if !trap::validate_upcall(&process.space, entry) {
        return Err(VmError::InvalidArgument.into());
    }
    process.fault_upcall = Some(entry);
    Ok(0)
}

fn sys_page_alloc(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = PageAllocArgsTyped::decode(args)?;
    vm::page_alloc(ctx.procs, ctx.frames, ctx.caller, typed.target, typed.va, typed.perm)?;
    Ok(0)
}

fn sys_page_map(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = PageMapArgsTyped::decode(args)?;
    vm::page_map(
        ctx.procs,
        ctx.frames,
        ctx.caller,
        typed.src,
        typed.src_va,
        typed.dst,
        typed.dst_va,
        typed.perm,
    )?;
    Ok(0)
}

fn sys_page_unmap(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let target = decode_pid(args.get(0))?;
    vm::page_unmap(ctx.procs, ctx.frames, ctx.caller, target, args.get(1))?;
    Ok(0)
}

fn sys_ipc_try_send(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = SendArgsTyped::decode(args)?;
    ipc::try_send(
        ctx.procs,
        ctx.frames,
        ctx.caller,
        typed.target,
        typed.value,
        typed.src_va,
        typed.perm,
    )?;
    Ok(0)
}

fn sys_ipc_recv(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    ipc::recv(ctx.procs, ctx.caller, args.get(0))?;
    ctx.scheduler.schedule(ctx.procs);
    Err(Error::Suspended)
}
