// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-process runtime state and the fault-upcall trampoline.
//!
//! `Runtime` models the library's globals. They live in the process's own
//! memory, so a forked child starts with a copy of its parent's runtime.

use core::fmt::{self, Write as _};

use exo_abi::layout::{PAGE_SIZE, USTACKTOP, UXSTACKTOP};
use exo_abi::{Error, FaultRecord, MemFault, Perm, Pid, Sys};

/// Bounded number of upcalls taken for one access before giving up.
pub const MAX_FAULT_DEPTH: usize = 4;

/// Scratch buffer for console output: the first page of the normal stack.
pub const CONSOLE_BUF: usize = USTACKTOP - PAGE_SIZE;

/// Library-level fault handler invoked from the upcall trampoline.
pub type FaultHandler<S> = fn(&mut Env<S>, &FaultRecord) -> Result<(), UserError>;

/// Errors surfaced to user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserError {
    /// A syscall failed.
    Sys(Error),
    /// The kernel destroyed this process.
    Killed,
    /// The library hit an unrecoverable condition and destroyed the process.
    Fatal,
}

impl From<Error> for UserError {
    fn from(value: Error) -> Self {
        Self::Sys(value)
    }
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sys(err) => write!(f, "{err}"),
            Self::Killed => f.write_str("process killed"),
            Self::Fatal => f.write_str("fatal library error"),
        }
    }
}

/// Process-local library state.
pub struct Runtime<S> {
    /// Identity of the process this runtime belongs to.
    pub this_env: Pid,
    /// Installed page-fault handler.
    pub handler: Option<FaultHandler<S>>,
}

impl<S> Runtime<S> {
    pub const fn new(this_env: Pid) -> Self {
        Self { this_env, handler: None }
    }
}

impl<S> Clone for Runtime<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for Runtime<S> {}

impl<S> fmt::Debug for Runtime<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("this_env", &self.this_env)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// A running process: syscall surface plus library state.
pub struct Env<S> {
    sys: S,
    rt: Runtime<S>,
}

impl<S: Sys> Env<S> {
    /// Starts a fresh process runtime.
    pub fn new(mut sys: S) -> Self {
        let this_env = sys.self_id();
        Self { sys, rt: Runtime::new(this_env) }
    }

    /// Resumes a process whose runtime was copied from elsewhere, e.g. a
    /// forked child. Issues no syscalls.
    pub fn with_runtime(sys: S, rt: Runtime<S>) -> Self {
        Self { sys, rt }
    }

    pub fn runtime(&self) -> Runtime<S> {
        self.rt
    }

    pub fn this_env(&self) -> Pid {
        self.rt.this_env
    }

    pub(crate) fn set_this_env(&mut self, pid: Pid) {
        self.rt.this_env = pid;
    }

    pub(crate) fn set_handler(&mut self, handler: FaultHandler<S>) {
        self.rt.handler = Some(handler);
    }

    pub fn sys(&self) -> &S {
        &self.sys
    }

    pub fn sys_mut(&mut self) -> &mut S {
        &mut self.sys
    }

    pub fn into_sys(self) -> S {
        self.sys
    }

    /// Reads user memory, servicing page faults through the installed handler.
    pub fn load(&mut self, va: usize, buf: &mut [u8]) -> Result<(), UserError> {
        for _ in 0..=MAX_FAULT_DEPTH {
            match self.sys.load(va, buf) {
                Ok(()) => return Ok(()),
                Err(MemFault::Killed) => return Err(UserError::Killed),
                Err(MemFault::Upcall { record_va }) => self.run_upcall(record_va)?,
            }
        }
        Err(self.fatal(format_args!("load {:#x}: fault loop", va)))
    }

    /// Writes user memory, servicing page faults through the installed handler.
    pub fn store(&mut self, va: usize, data: &[u8]) -> Result<(), UserError> {
        for _ in 0..=MAX_FAULT_DEPTH {
            match self.sys.store(va, data) {
                Ok(()) => return Ok(()),
                Err(MemFault::Killed) => return Err(UserError::Killed),
                Err(MemFault::Upcall { record_va }) => self.run_upcall(record_va)?,
            }
        }
        Err(self.fatal(format_args!("store {:#x}: fault loop", va)))
    }

    /// Upcall entry: read the record, run the handler, restore the context.
    fn run_upcall(&mut self, record_va: usize) -> Result<(), UserError> {
        let mut raw = [0u8; FaultRecord::SIZE];
        self.sys.load(record_va, &mut raw).map_err(|_| UserError::Killed)?;
        let record = FaultRecord::from_le_bytes(&raw);
        let Some(handler) = self.rt.handler else {
            return Err(self.fatal(format_args!(
                "unhandled fault va {:#x} ip {:#x}",
                record.fault_va, record.frame.pc
            )));
        };
        handler(self, &record)?;
        self.sys.return_from_upcall(&record.frame);
        Ok(())
    }

    /// Writes `msg` to the console.
    pub fn print(&mut self, msg: &str) -> Result<(), UserError> {
        for chunk in msg.as_bytes().chunks(PAGE_SIZE) {
            self.store(CONSOLE_BUF, chunk)?;
            self.sys.print(CONSOLE_BUF, chunk.len())?;
        }
        Ok(())
    }

    /// Unwraps a syscall result, treating failure as fatal.
    pub fn require<T>(&mut self, result: exo_abi::Result<T>, what: &str) -> Result<T, UserError> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => Err(self.fatal(format_args!("{}: {}", what, err))),
        }
    }

    /// Prints a diagnostic (best effort) and destroys the calling process.
    pub fn fatal(&mut self, args: fmt::Arguments<'_>) -> UserError {
        let mut line = LineBuf::new();
        let _ = writeln!(line, "[{:08x}] user panic: {}", self.rt.this_env.raw(), args);
        // The exception stack is never copy-on-write, so prefer it.
        let xstack = UXSTACKTOP - PAGE_SIZE;
        let scratch = match self.sys.page_perm(xstack) {
            Some(perm) if perm.contains(Perm::WRITE) => xstack,
            _ => CONSOLE_BUF,
        };
        if self.sys.store(scratch, line.as_bytes()).is_ok() {
            let _ = self.sys.print(scratch, line.as_bytes().len());
        }
        let _ = self.sys.destroy(Pid::SELF);
        UserError::Fatal
    }
}

/// Fixed-size line buffer; output past the end is dropped.
struct LineBuf {
    buf: [u8; 160],
    len: usize,
}

impl LineBuf {
    const fn new() -> Self {
        Self { buf: [0; 160], len: 0 }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl fmt::Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}
