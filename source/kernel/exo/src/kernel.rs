// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel instance: owns frames, processes, scheduler, console and the syscall table
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel, KernelConfig, SyscallOutcome, Access
//! DEPENDS_ON: syscall, trap, user_loader, hal::Console
//! INVARIANTS: Every syscall and user access runs as one step; processes marked Dying are
//!             reclaimed before control returns to user mode

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt::Write as _;

use exo_abi::{MemFault, Pid, ProcStatus, REG_RET};

use crate::hal::{BufferConsole, Console, ConsoleWriter};
use crate::mm::{FrameTable, Pte};
use crate::sched::Scheduler;
use crate::syscall::{api, Args, Error, SyscallTable};
use crate::task::{Process, ProcessTable};
use crate::trap;
use crate::user::UserEnv;
use crate::user_loader::{self, Image, SpawnError};

/// Boot-time sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Physical frames in the pool, including page-table pages.
    pub frames: usize,
    /// Process slots (at most [`Pid::MAX_SLOTS`]).
    pub process_slots: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self { frames: 1024, process_slots: 64 }
    }
}

/// What the caller of a syscall observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// Raw return register: a value or a negated error code.
    Returned(usize),
    /// The caller blocked.
    Suspended,
    /// The caller was destroyed.
    Killed,
    /// The caller does not exist or is not runnable.
    Rejected,
}

/// A user-mode memory access.
pub enum Access<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

pub struct Kernel {
    frames: FrameTable,
    procs: ProcessTable,
    scheduler: Scheduler,
    console: Box<dyn Console>,
    syscalls: SyscallTable,
}

static_assertions::assert_impl_all!(Kernel: Send);

impl Kernel {
    pub fn new(config: KernelConfig, console: Box<dyn Console>) -> Self {
        let mut syscalls = SyscallTable::new();
        api::install_handlers(&mut syscalls);
        log_info!(
            target: "boot",
            "exo: {} frames, {} process slots",
            config.frames,
            config.process_slots
        );
        Self {
            frames: FrameTable::new(config.frames),
            procs: ProcessTable::new(config.process_slots),
            scheduler: Scheduler::new(),
            console,
            syscalls,
        }
    }

    /// Kernel with an in-memory console; the returned handle reads its output.
    pub fn with_buffer_console(config: KernelConfig) -> (Self, BufferConsole) {
        let console = BufferConsole::new();
        (Self::new(config, Box::new(console.clone())), console)
    }

    /// Loads `image` as a new runnable process.
    pub fn spawn(&mut self, image: &Image) -> Result<Pid, SpawnError> {
        let pid = user_loader::load(&mut self.procs, &mut self.frames, image)?;
        if self.scheduler.current().is_none() {
            self.scheduler.set_current(Some(pid));
        }
        Ok(pid)
    }

    /// Binds `pid` as the running process for user-mode execution.
    pub fn user(&mut self, pid: Pid) -> Option<UserEnv<'_>> {
        self.procs.get(pid)?;
        Some(UserEnv::new(self, pid))
    }

    /// Syscall trap entry for `caller`.
    pub fn handle_syscall(&mut self, caller: Pid, number: usize, args: Args) -> SyscallOutcome {
        if self.procs.status(caller) != Some(ProcStatus::Runnable) {
            return SyscallOutcome::Rejected;
        }
        self.scheduler.set_current(Some(caller));

        let result = {
            let mut ctx = api::Context::new(
                caller,
                &mut self.procs,
                &mut self.frames,
                &mut self.scheduler,
                self.console.as_mut(),
            );
            self.syscalls.dispatch(number, &mut ctx, &args)
        };
        #[cfg(feature = "trace_syscalls")]
        log_trace!(target: "sys", "{} nr={} args={:?} -> {:?}", caller, number, args, result);

        let outcome = match result {
            Ok(value) => SyscallOutcome::Returned(value),
            Err(Error::Suspended) => SyscallOutcome::Suspended,
            Err(Error::Killed) => SyscallOutcome::Killed,
            Err(err) => {
                log_debug!(target: "sys", "{} nr={} failed: {}", caller, number, err);
                let code = err.to_abi().map_or(exo_abi::Error::InvalidArgument.code(), |e| e.code());
                SyscallOutcome::Returned(code as usize)
            }
        };
        if let SyscallOutcome::Returned(raw) = outcome {
            if let Some(process) = self.procs.get_mut(caller) {
                process.frame.regs[REG_RET] = raw;
            }
        }
        self.trap_exit();
        outcome
    }

    /// Performs a user-mode load or store for `pid` through the MMU model.
    /// A faulting access is turned into an upcall or kills the process.
    pub fn user_access(&mut self, pid: Pid, va: usize, access: Access<'_>) -> Result<(), MemFault> {
        let process = self
            .procs
            .get_mut(pid)
            .filter(|p| p.status == ProcStatus::Runnable)
            .ok_or(MemFault::Killed)?;
        let probe = match &access {
            Access::Read(buf) => process.space.probe(va, buf.len(), false),
            Access::Write(data) => process.space.probe(va, data.len(), true),
        };
        let fault = match probe {
            Ok(()) => {
                let copied = match access {
                    Access::Read(buf) => process.space.copy_in(&self.frames, va, buf),
                    Access::Write(data) => process.space.copy_out(&mut self.frames, va, data),
                };
                return copied.map_err(|_| MemFault::Killed);
            }
            Err(fault) => fault,
        };

        match trap::deliver_page_fault(process, &mut self.frames, fault) {
            Ok(record_va) => Err(MemFault::Upcall { record_va }),
            Err(reason) => {
                log_warn!(target: "trap", "{} killed on fault at {:#x}: {:?}", pid, fault.va, reason);
                let pc = process.frame.pc;
                let _ = writeln!(
                    ConsoleWriter(self.console.as_mut()),
                    "[{:08x}] user fault va {:08x} ip {:08x}",
                    pid.raw(),
                    fault.va,
                    pc
                );
                process.status = ProcStatus::Dying;
                self.trap_exit();
                Err(MemFault::Killed)
            }
        }
    }

    /// Reclaims dying processes and reschedules if the current one is gone.
    fn trap_exit(&mut self) {
        let dying: Vec<Pid> = self.procs.dying().collect();
        for pid in dying {
            let _ = self.procs.free(&mut self.frames, pid);
        }
        let current_alive = self
            .scheduler
            .current()
            .and_then(|pid| self.procs.status(pid))
            == Some(ProcStatus::Runnable);
        if !current_alive {
            self.scheduler.schedule(&self.procs);
        }
    }

    /// Runs the scheduler and returns the chosen process.
    pub fn schedule(&mut self) -> Option<Pid> {
        self.scheduler.schedule(&self.procs)
    }

    pub fn current(&self) -> Option<Pid> {
        self.scheduler.current()
    }

    pub fn process(&self, pid: Pid) -> Option<&Process> {
        self.procs.get(pid)
    }

    pub(crate) fn process_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.procs.get_mut(pid)
    }

    /// Mapping of `va` in `pid`'s space.
    pub fn lookup(&self, pid: Pid, va: usize) -> Option<Pte> {
        self.procs.get(pid).and_then(|p| p.space.lookup(va))
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    /// Number of live process records.
    pub fn process_count(&self) -> usize {
        self.procs.live_count()
    }
}
