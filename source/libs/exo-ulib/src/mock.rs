// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Single-process `Sys` double for library unit tests.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use exo_abi::layout::{is_page_aligned, page_down, PAGE_SIZE, UXSTACKTOP};
use exo_abi::{
    Error, FaultFlags, FaultRecord, IpcMessage, MemFault, Perm, Pid, ProcStatus, RecvState,
    Result, Sys, TrapFrame,
};

use crate::env::CONSOLE_BUF;

type Frame = Rc<RefCell<Vec<u8>>>;

pub struct MockSys {
    pub id: Pid,
    pages: BTreeMap<usize, (Frame, Perm)>,
    pub upcall: Option<usize>,
    pub frame: TrapFrame,
    pub destroyed: bool,
    pub fail_alloc: Option<Error>,
    pub allocs: usize,
    pub inbox: Option<IpcMessage>,
    pub sent: Vec<(Pid, usize)>,
    pub busy_sends: usize,
    pub yields: usize,
    console: Vec<u8>,
}

impl MockSys {
    pub fn new() -> Self {
        let mut sys = Self {
            id: Pid::from_raw(0x1001),
            pages: BTreeMap::new(),
            upcall: None,
            frame: TrapFrame::default(),
            destroyed: false,
            fail_alloc: None,
            allocs: 0,
            inbox: None,
            sent: Vec::new(),
            busy_sends: 0,
            yields: 0,
            console: Vec::new(),
        };
        sys.map_page(CONSOLE_BUF, Perm::PRESENT | Perm::USER | Perm::WRITE);
        sys
    }

    pub fn map_page(&mut self, va: usize, perm: Perm) {
        let frame = Rc::new(RefCell::new(vec![0u8; PAGE_SIZE]));
        self.pages.insert(page_down(va), (frame, perm));
    }

    /// Another handle to the frame behind `va`.
    pub fn alias(&self, va: usize) -> Frame {
        Rc::clone(&self.pages[&page_down(va)].0)
    }

    /// Writes bytes ignoring permissions.
    pub fn poke(&mut self, va: usize, data: &[u8]) {
        let offset = va - page_down(va);
        let frame = &self.pages[&page_down(va)].0;
        frame.borrow_mut()[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn console_string(&self) -> String {
        String::from_utf8_lossy(&self.console).into_owned()
    }

    fn check(&self, va: usize, len: usize, write: bool) -> core::result::Result<(), FaultFlags> {
        let mut page = page_down(va);
        while page < va + len {
            match self.pages.get(&page) {
                None => return Err(FaultFlags::USER),
                Some((_, perm)) if write && !perm.contains(Perm::WRITE) => {
                    return Err(FaultFlags::PRESENT | FaultFlags::USER)
                }
                Some(_) => {}
            }
            page += PAGE_SIZE;
        }
        Ok(())
    }

    fn copy(&self, va: usize, len: usize, mut f: impl FnMut(usize, &mut [u8])) {
        let mut done = 0;
        while done < len {
            let cur = va + done;
            let offset = cur - page_down(cur);
            let n = (PAGE_SIZE - offset).min(len - done);
            let frame = &self.pages[&page_down(cur)].0;
            f(done, &mut frame.borrow_mut()[offset..offset + n]);
            done += n;
        }
    }

    fn fault(&mut self, va: usize, flags: FaultFlags, write: bool) -> MemFault {
        let xstack = UXSTACKTOP - PAGE_SIZE;
        let Some(entry) = self.upcall.filter(|_| self.pages.contains_key(&xstack)) else {
            self.destroyed = true;
            return MemFault::Killed;
        };
        let flags = if write { flags | FaultFlags::WRITE } else { flags };
        let record = FaultRecord { fault_va: va, flags, frame: self.frame };
        let record_va = UXSTACKTOP - FaultRecord::SIZE;
        self.poke(record_va, &record.to_le_bytes());
        self.frame.pc = entry;
        self.frame.sp = record_va;
        MemFault::Upcall { record_va }
    }
}

impl Default for MockSys {
    fn default() -> Self {
        Self::new()
    }
}

impl Sys for MockSys {
    fn print(&mut self, va: usize, len: usize) -> Result<()> {
        self.check(va, len, false).map_err(|_| Error::Fault)?;
        let mut out = vec![0u8; len];
        self.copy(va, len, |at, chunk| out[at..at + chunk.len()].copy_from_slice(chunk));
        self.console.extend_from_slice(&out);
        Ok(())
    }

    fn read_char(&mut self) -> Option<u8> {
        None
    }

    fn self_id(&mut self) -> Pid {
        self.id
    }

    fn destroy(&mut self, pid: Pid) -> Result<()> {
        if pid.is_self() || pid == self.id {
            self.destroyed = true;
            return Ok(());
        }
        Err(Error::BadTarget)
    }

    fn yield_now(&mut self) {
        self.yields += 1;
    }

    fn exofork(&mut self) -> Result<Pid> {
        Err(Error::NoFreeProcess)
    }

    fn set_status(&mut self, _pid: Pid, _status: ProcStatus) -> Result<()> {
        Err(Error::BadTarget)
    }

    fn set_fault_upcall(&mut self, pid: Pid, entry: usize) -> Result<()> {
        if !pid.is_self() {
            return Err(Error::BadTarget);
        }
        self.upcall = Some(entry);
        Ok(())
    }

    fn page_alloc(&mut self, pid: Pid, va: usize, perm: Perm) -> Result<()> {
        if let Some(err) = self.fail_alloc {
            return Err(err);
        }
        if !pid.is_self() {
            return Err(Error::BadTarget);
        }
        if !is_page_aligned(va) || !perm.is_syscall_valid() {
            return Err(Error::InvalidArgument);
        }
        self.allocs += 1;
        self.map_page(va, perm);
        Ok(())
    }

    fn page_map(&mut self, src: Pid, src_va: usize, dst: Pid, dst_va: usize, perm: Perm) -> Result<()> {
        if !src.is_self() || !dst.is_self() {
            return Err(Error::BadTarget);
        }
        let frame = self.pages.get(&src_va).map(|(f, _)| Rc::clone(f)).ok_or(Error::InvalidArgument)?;
        self.pages.insert(dst_va, (frame, perm));
        Ok(())
    }

    fn page_unmap(&mut self, pid: Pid, va: usize) -> Result<()> {
        if !pid.is_self() {
            return Err(Error::BadTarget);
        }
        self.pages.remove(&va);
        Ok(())
    }

    fn ipc_try_send(&mut self, to: Pid, value: usize, _src_va: usize, _perm: Perm) -> Result<()> {
        if self.busy_sends > 0 {
            self.busy_sends -= 1;
            return Err(Error::IpcNotReceiving);
        }
        self.sent.push((to, value));
        Ok(())
    }

    fn ipc_recv(&mut self, _dst_va: usize) -> Result<RecvState> {
        Ok(if self.inbox.is_some() { RecvState::Delivered } else { RecvState::Waiting })
    }

    fn page_perm(&self, va: usize) -> Option<Perm> {
        self.pages.get(&page_down(va)).map(|(_, perm)| *perm)
    }

    fn table_present(&self, va: usize) -> bool {
        let span = exo_abi::layout::PT_SPAN;
        let base = va - va % span;
        self.pages.range(base..base + span).next().is_some()
    }

    fn ipc_message(&self) -> IpcMessage {
        self.inbox.unwrap_or_default()
    }

    fn fault_upcall(&self) -> Option<usize> {
        self.upcall
    }

    fn load(&mut self, va: usize, buf: &mut [u8]) -> core::result::Result<(), MemFault> {
        if self.destroyed {
            return Err(MemFault::Killed);
        }
        if let Err(flags) = self.check(va, buf.len(), false) {
            return Err(self.fault(va, flags, false));
        }
        self.copy(va, buf.len(), |at, chunk| buf[at..at + chunk.len()].copy_from_slice(chunk));
        Ok(())
    }

    fn store(&mut self, va: usize, data: &[u8]) -> core::result::Result<(), MemFault> {
        if self.destroyed {
            return Err(MemFault::Killed);
        }
        if let Err(flags) = self.check(va, data.len(), true) {
            return Err(self.fault(va, flags, true));
        }
        self.copy(va, data.len(), |at, chunk| chunk.copy_from_slice(&data[at..at + chunk.len()]));
        Ok(())
    }

    fn return_from_upcall(&mut self, frame: &TrapFrame) {
        self.frame = *frame;
    }
}
