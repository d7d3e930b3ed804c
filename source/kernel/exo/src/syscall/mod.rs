// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher and error handling
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Handler, SysResult
//! DEPENDS_ON: ipc, task, vm, syscall::api
//! INVARIANTS: Fixed MAX_SYSCALL window; stable numbers from exo_abi::nr;
//!             unknown numbers fail InvalidArgument; decode/check/execute discipline

pub mod api;

use core::fmt;

use exo_abi::Error as AbiError;

use crate::{ipc, task, vm};

/// Size of the dispatch window.
const MAX_SYSCALL: usize = 32;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Syscall arguments: the five argument registers plus one spare.
#[derive(Default, Clone, Copy, Debug)]
pub struct Args {
    regs: [usize; 6],
}

impl Args {
    /// Creates a new argument pack from the provided registers.
    pub const fn new(regs: [usize; 6]) -> Self {
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }
}

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Syscall number not present in the dispatch table.
    InvalidSyscall,
    /// Process lookup or creation failed.
    Process(task::ProcessError),
    /// Page primitive failed.
    Vm(vm::VmError),
    /// Rendezvous failed.
    Ipc(ipc::IpcError),
    /// The caller blocked; nothing is written to its return register and the
    /// call completes when the process is resumed.
    Suspended,
    /// The caller was terminated and will not observe a return value.
    Killed,
}

impl Error {
    /// Wire error for this failure. `None` for the two control outcomes.
    pub fn to_abi(self) -> Option<AbiError> {
        use ipc::IpcError;
        use task::ProcessError;
        use vm::VmError;

        let vm_err = |err: VmError| match err {
            VmError::BadTarget => AbiError::BadTarget,
            VmError::InvalidArgument => AbiError::InvalidArgument,
            VmError::OutOfMemory => AbiError::OutOfMemory,
        };
        Some(match self {
            Self::InvalidSyscall => AbiError::InvalidArgument,
            Self::Process(ProcessError::BadTarget) => AbiError::BadTarget,
            Self::Process(ProcessError::NoFreeSlot) => AbiError::NoFreeProcess,
            Self::Process(ProcessError::OutOfMemory) => AbiError::OutOfMemory,
            Self::Vm(err) => vm_err(err),
            Self::Ipc(IpcError::NoSuchProcess) => AbiError::BadTarget,
            Self::Ipc(IpcError::NotReceiving) => AbiError::IpcNotReceiving,
            Self::Ipc(IpcError::Vm(err)) => vm_err(err),
            Self::Suspended | Self::Killed => return None,
        })
    }
}

impl From<task::ProcessError> for Error {
    fn from(value: task::ProcessError) -> Self {
        Self::Process(value)
    }
}

impl From<vm::VmError> for Error {
    fn from(value: vm::VmError) -> Self {
        Self::Vm(value)
    }
}

impl From<ipc::IpcError> for Error {
    fn from(value: ipc::IpcError) -> Self {
        Self::Ipc(value)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_abi() {
            Some(err) => write!(f, "{:?} ({})", self, err),
            None => write!(f, "{:?}", self),
        }
    }
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut api::Context<'_>, &Args) -> SysResult<usize>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL],
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SyscallTable {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_SYSCALL] }
    }

    /// Registers a handler.
    pub fn register(&mut self, number: usize, handler: Handler) {
        if number < MAX_SYSCALL {
            self.handlers[number] = Some(handler);
        }
    }

    /// Executes the handler referenced by `number`.
    #[must_use]
    pub fn dispatch(
        &self,
        number: usize,
        ctx: &mut api::Context<'_>,
        args: &Args,
    ) -> SysResult<usize> {
        self.handlers
            .get(number)
            .and_then(|entry| *entry)
            .ok_or(Error::InvalidSyscall)
            .and_then(|handler| handler(ctx, args))
    }
}
