// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host execution harness: runs user code for one process against the kernel
//! OWNERS: @kernel-team
//! PUBLIC API: UserEnv (implements exo_abi::Sys)
//! DEPENDS_ON: kernel::Kernel, syscall::Args
//! INVARIANTS: Every Sys method that is a syscall goes through the numbered dispatch table;
//!             a parked call completes only when the process issues that same call again

use exo_abi::{
    nr, Error, IpcMessage, MemFault, Perm, Pid, ProcStatus, RecvState, Result, Sys, TrapFrame,
    REG_RET,
};

use crate::kernel::{Access, Kernel, SyscallOutcome};
use crate::syscall::Args;

/// User-mode view of one process.
pub struct UserEnv<'k> {
    kernel: &'k mut Kernel,
    pid: Pid,
}

impl<'k> UserEnv<'k> {
    pub(crate) fn new(kernel: &'k mut Kernel, pid: Pid) -> Self {
        Self { kernel, pid }
    }

    /// Process this environment runs as.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn kernel(&self) -> &Kernel {
        self.kernel
    }

    /// Completes a call the process is parked inside.
    fn resume_parked(&mut self, number: usize) -> Option<usize> {
        let process = self.kernel.process_mut(self.pid)?;
        if process.status != ProcStatus::Runnable || process.parked != Some(number) {
            return None;
        }
        process.parked = None;
        Some(process.frame.regs[REG_RET])
    }

    fn call(&mut self, number: usize, a: [usize; 5]) -> SyscallOutcome {
        if let Some(raw) = self.resume_parked(number) {
            return SyscallOutcome::Returned(raw);
        }
        let args = Args::new([a[0], a[1], a[2], a[3], a[4], 0]);
        self.kernel.handle_syscall(self.pid, number, args)
    }

    fn call_value(&mut self, number: usize, a: [usize; 5]) -> Result<usize> {
        match self.call(number, a) {
            SyscallOutcome::Returned(raw) => Error::decode_return(raw),
            SyscallOutcome::Suspended => Ok(0),
            SyscallOutcome::Killed => Err(Error::Fault),
            SyscallOutcome::Rejected => Err(Error::BadTarget),
        }
    }

    fn call_unit(&mut self, number: usize, a: [usize; 5]) -> Result<()> {
        self.call_value(number, a).map(|_| ())
    }
}

impl Sys for UserEnv<'_> {
    fn print(&mut self, va: usize, len: usize) -> Result<()> {
        self.call_unit(nr::PRINT, [va, len, 0, 0, 0])
    }

    fn read_char(&mut self) -> Option<u8> {
        match self.call_value(nr::READ_CHAR, [0; 5]) {
            Ok(0) | Err(_) => None,
            Ok(byte) => Some(byte as u8),
        }
    }

    fn self_id(&mut self) -> Pid {
        self.call_value(nr::SELF_ID, [0; 5]).map_or(Pid::SELF, |raw| Pid::from_raw(raw as u32))
    }

    fn destroy(&mut self, pid: Pid) -> Result<()> {
        match self.call(nr::DESTROY, [pid.raw() as usize, 0, 0, 0, 0]) {
            SyscallOutcome::Killed => Ok(()),
            SyscallOutcome::Returned(raw) => Error::decode_return(raw).map(|_| ()),
            SyscallOutcome::Suspended => Ok(()),
            SyscallOutcome::Rejected => Err(Error::BadTarget),
        }
    }

    fn yield_now(&mut self) {
        let _ = self.call(nr::YIELD, [0; 5]);
    }

    fn exofork(&mut self) -> Result<Pid> {
        self.call_value(nr::EXOFORK, [0; 5]).map(|raw| Pid::from_raw(raw as u32))
    }

    fn set_status(&mut self, pid: Pid, status: ProcStatus) -> Result<()> {
        self.call_unit(nr::SET_STATUS, [pid.raw() as usize, status as usize, 0, 0, 0])
    }

    fn set_fault_upcall(&mut self, pid: Pid, entry: usize) -> Result<()> {
        self.call_unit(nr::SET_FAULT_UPCALL, [pid.raw() as usize, entry, 0, 0, 0])
    }

    fn page_alloc(&mut self, pid: Pid, va: usize, perm: Perm) -> Result<()> {
        self.call_unit(nr::PAGE_ALLOC, [pid.raw() as usize, va, perm.bits() as usize, 0, 0])
    }

    fn page_map(&mut self, src: Pid, src_va: usize, dst: Pid, dst_va: usize, perm: Perm) -> Result<()> {
        self.call_unit(
            nr::PAGE_MAP,
            [src.raw() as usize, src_va, dst.raw() as usize, dst_va, perm.bits() as usize],
        )
    }

    fn page_unmap(&mut self, pid: Pid, va: usize) -> Result<()> {
        self.call_unit(nr::PAGE_UNMAP, [pid.raw() as usize, va, 0, 0, 0])
    }

    fn ipc_try_send(&mut self, to: Pid, value: usize, src_va: usize, perm: Perm) -> Result<()> {
        self.call_unit(nr::IPC_TRY_SEND, [to.raw() as usize, value, src_va, perm.bits() as usize, 0])
    }

    fn ipc_recv(&mut self, dst_va: usize) -> Result<RecvState> {
        let still_waiting = self.kernel.process(self.pid).map_or(false, |p| {
            p.mailbox.receiving && p.status == ProcStatus::NotRunnable && p.parked == Some(nr::IPC_RECV)
        });
        if still_waiting {
            return Ok(RecvState::Waiting);
        }
        match self.call(nr::IPC_RECV, [dst_va, 0, 0, 0, 0]) {
            SyscallOutcome::Returned(raw) => Error::decode_return(raw).map(|_| RecvState::Delivered),
            SyscallOutcome::Suspended => Ok(RecvState::Waiting),
            SyscallOutcome::Killed => Err(Error::Fault),
            SyscallOutcome::Rejected => Err(Error::BadTarget),
        }
    }

    fn page_perm(&self, va: usize) -> Option<Perm> {
        self.kernel.lookup(self.pid, va).map(|pte| pte.perm)
    }

    fn table_present(&self, va: usize) -> bool {
        self.kernel
            .process(self.pid)
            .map_or(false, |p| p.space.page_table().table_present(va))
    }

    fn ipc_message(&self) -> IpcMessage {
        self.kernel.process(self.pid).map_or_else(IpcMessage::default, |p| IpcMessage {
            value: p.mailbox.value,
            from: p.mailbox.from,
            perm: p.mailbox.perm,
        })
    }

    fn fault_upcall(&self) -> Option<usize> {
        self.kernel.process(self.pid).and_then(|p| p.fault_upcall)
    }

    fn load(&mut self, va: usize, buf: &mut [u8]) -> core::result::Result<(), MemFault> {
        self.kernel.user_access(self.pid, va, Access::Read(buf))
    }

    fn store(&mut self, va: usize, data: &[u8]) -> core::result::Result<(), MemFault> {
        self.kernel.user_access(self.pid, va, Access::Write(data))
    }

    fn return_from_upcall(&mut self, frame: &TrapFrame) {
        if let Some(process) = self.kernel.process_mut(self.pid) {
            process.frame = *frame;
        }
    }
}
