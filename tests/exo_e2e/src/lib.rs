// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Shared harness for end-to-end scenarios over the exo kernel and user library
//! OWNERS: @kernel-team
//! PUBLIC API: boot(), Task (exo_abi::Sys over a shared kernel), standard images
//! DEPENDS_ON: exo, exo-abi, exo-ulib, spin
//! INVARIANTS: Each Sys call takes the kernel lock exactly once; calls never nest

#![forbid(unsafe_code)]

use std::sync::Arc;

use exo::hal::BufferConsole;
use exo::{Image, Kernel, KernelConfig, UserEnv};
use exo_abi::layout::{PAGE_SIZE, UTEXT};
use exo_abi::{
    Error, IpcMessage, MemFault, Perm, Pid, ProcStatus, RecvState, Result, Sys, TrapFrame,
};
use exo_ulib::Env;
use spin::Mutex;

pub type SharedKernel = Arc<Mutex<Kernel>>;

/// Read-write user page permission.
pub const RW: Perm = Perm::PRESENT.union(Perm::USER).union(Perm::WRITE);
/// Read-only user page permission.
pub const RO: Perm = Perm::PRESENT.union(Perm::USER);

/// Writable data page in [`standard_image`].
pub const DATA_VA: usize = UTEXT + PAGE_SIZE;
/// Read-only data page in [`standard_image`].
pub const RODATA_VA: usize = UTEXT + 2 * PAGE_SIZE;

pub const DATA_INIT: &[u8] = b"parent data page";
pub const RODATA_INIT: &[u8] = b"read-only page";

/// Boots a kernel behind a lock with an in-memory console.
pub fn boot(config: KernelConfig) -> (SharedKernel, BufferConsole) {
    let (kernel, console) = Kernel::with_buffer_console(config);
    (Arc::new(Mutex::new(kernel)), console)
}

/// Text page at `UTEXT`, one writable and one read-only data page.
pub fn standard_image() -> Image {
    Image::new(UTEXT)
        .with_segment(UTEXT, b"\x90\x90\xc3", RO)
        .with_segment(DATA_VA, DATA_INIT, RW)
        .with_segment(RODATA_VA, RODATA_INIT, RO)
}

/// Spawns `image` and returns a handle running as the new process.
pub fn spawn(kernel: &SharedKernel, image: &Image) -> Task {
    let pid = kernel.lock().spawn(image).expect("spawn");
    Task::new(kernel.clone(), pid)
}

/// One process's view of a shared kernel.
#[derive(Clone)]
pub struct Task {
    kernel: SharedKernel,
    pid: Pid,
}

impl Task {
    pub fn new(kernel: SharedKernel, pid: Pid) -> Self {
        Self { kernel, pid }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn kernel(&self) -> &SharedKernel {
        &self.kernel
    }

    /// Fresh user-library environment for this process.
    pub fn env(&self) -> Env<Task> {
        Env::new(self.clone())
    }

    fn with<R>(&self, gone: R, f: impl FnOnce(&mut UserEnv<'_>) -> R) -> R {
        let mut kernel = self.kernel.lock();
        match kernel.user(self.pid) {
            Some(mut env) => f(&mut env),
            None => gone,
        }
    }
}

impl Sys for Task {
    fn print(&mut self, va: usize, len: usize) -> Result<()> {
        self.with(Err(Error::BadTarget), |u| u.print(va, len))
    }

    fn read_char(&mut self) -> Option<u8> {
        self.with(None, |u| u.read_char())
    }

    fn self_id(&mut self) -> Pid {
        self.with(Pid::SELF, |u| u.self_id())
    }

    fn destroy(&mut self, pid: Pid) -> Result<()> {
        self.with(Err(Error::BadTarget), |u| u.destroy(pid))
    }

    fn yield_now(&mut self) {
        self.with((), |u| u.yield_now())
    }

    fn exofork(&mut self) -> Result<Pid> {
        self.with(Err(Error::BadTarget), |u| u.exofork())
    }

    fn set_status(&mut self, pid: Pid, status: ProcStatus) -> Result<()> {
        self.with(Err(Error::BadTarget), |u| u.set_status(pid, status))
    }

    fn set_fault_upcall(&mut self, pid: Pid, entry: usize) -> Result<()> {
        self.with(Err(Error::BadTarget), |u| u.set_fault_upcall(pid, entry))
    }

    fn page_alloc(&mut self, pid: Pid, va: usize, perm: Perm) -> Result<()> {
        self.with(Err(Error::BadTarget), |u| u.page_alloc(pid, va, perm))
    }

    fn page_map(&mut self, src: Pid, src_va: usize, dst: Pid, dst_va: usize, perm: Perm) -> Result<()> {
        self.with(Err(Error::BadTarget), |u| u.page_map(src, src_va, dst, dst_va, perm))
    }

    fn page_unmap(&mut self, pid: Pid, va: usize) -> Result<()> {
        self.with(Err(Error::BadTarget), |u| u.page_unmap(pid, va))
    }

    fn ipc_try_send(&mut self, to: Pid, value: usize, src_va: usize, perm: Perm) -> Result<()> {
        self.with(Err(Error::BadTarget), |u| u.ipc_try_send(to, value, src_va, perm))
    }

    fn ipc_recv(&mut self, dst_va: usize) -> Result<RecvState> {
        self.with(Err(Error::BadTarget), |u| u.ipc_recv(dst_va))
    }

    fn page_perm(&self, va: usize) -> Option<Perm> {
        self.with(None, |u| u.page_perm(va))
    }

    fn table_present(&self, va: usize) -> bool {
        self.with(false, |u| u.table_present(va))
    }

    fn ipc_message(&self) -> IpcMessage {
        self.with(IpcMessage::default(), |u| u.ipc_message())
    }

    fn fault_upcall(&self) -> Option<usize> {
        self.with(None, |u| u.fault_upcall())
    }

    fn load(&mut self, va: usize, buf: &mut [u8]) -> core::result::Result<(), MemFault> {
        self.with(Err(MemFault::Killed), |u| u.load(va, buf))
    }

    fn store(&mut self, va: usize, data: &[u8]) -> core::result::Result<(), MemFault> {
        self.with(Err(MemFault::Killed), |u| u.store(va, data))
    }

    fn return_from_upcall(&mut self, frame: &TrapFrame) {
        self.with((), |u| u.return_from_upcall(frame))
    }
}
