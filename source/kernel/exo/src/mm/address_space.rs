// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process address space and simulated MMU access checks
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace, PageFault
//! DEPENDS_ON: mm::page_table, mm::frame
//! INVARIANTS: Raw copies never consult permissions; callers run probe/check_user first

use exo_abi::layout::{page_down, PAGE_SIZE, UTOP};
use exo_abi::{FaultFlags, Perm};

use super::frame::FrameTable;
use super::page_table::{MapError, PageTable, Pte};

/// Fault raised by a user access the MMU would refuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub va: usize,
    pub flags: FaultFlags,
}

/// A process's address space. Owns its page table.
pub struct AddressSpace {
    table: PageTable,
}

impl AddressSpace {
    pub fn new(frames: &mut FrameTable) -> Result<Self, MapError> {
        Ok(Self { table: PageTable::new(frames)? })
    }

    pub fn page_table(&self) -> &PageTable {
        &self.table
    }

    pub(crate) fn page_table_mut(&mut self) -> &mut PageTable {
        &mut self.table
    }

    pub fn lookup(&self, va: usize) -> Option<Pte> {
        self.table.lookup(va)
    }

    /// Checks that every page of `[va, va + len)` lies below the user
    /// ceiling and is mapped with at least `perm | PRESENT`.
    ///
    /// Returns the first offending address on failure.
    pub fn check_user(&self, va: usize, len: usize, perm: Perm) -> Result<(), usize> {
        if len == 0 {
            return Ok(());
        }
        let end = va.checked_add(len).ok_or(va)?;
        let need = perm | Perm::PRESENT;
        let mut page = page_down(va);
        while page < end {
            let ok = page < UTOP
                && self.table.lookup(page).map_or(false, |pte| pte.perm.contains(need));
            if !ok {
                return Err(page.max(va));
            }
            page = match page.checked_add(PAGE_SIZE) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(())
    }

    /// Evaluates a user-mode access the way the MMU does, reporting the first
    /// faulting address with hardware-style flags.
    pub fn probe(&self, va: usize, len: usize, write: bool) -> Result<(), PageFault> {
        let need = if write { Perm::USER | Perm::WRITE } else { Perm::USER };
        let mut flags = FaultFlags::USER;
        if write {
            flags |= FaultFlags::WRITE;
        }
        self.check_user(va, len, need).map_err(|fault_va| {
            let present = fault_va < UTOP && self.table.lookup(fault_va).is_some();
            PageFault {
                va: fault_va,
                flags: if present { flags | FaultFlags::PRESENT } else { flags },
            }
        })
    }

    /// Copies mapped memory out of the space. Fails with the first unmapped
    /// address.
    pub fn copy_in(&self, frames: &FrameTable, va: usize, buf: &mut [u8]) -> Result<(), usize> {
        let mut done = 0;
        while done < buf.len() {
            let cur = va.checked_add(done).ok_or(va)?;
            let offset = cur % PAGE_SIZE;
            let chunk = (PAGE_SIZE - offset).min(buf.len() - done);
            let pte = self.table.lookup(cur).ok_or(cur)?;
            buf[done..done + chunk].copy_from_slice(&frames.data(pte.frame)[offset..offset + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Copies bytes into mapped memory regardless of the write bit.
    pub fn copy_out(&self, frames: &mut FrameTable, va: usize, data: &[u8]) -> Result<(), usize> {
        let mut done = 0;
        while done < data.len() {
            let cur = va.checked_add(done).ok_or(va)?;
            let offset = cur % PAGE_SIZE;
            let chunk = (PAGE_SIZE - offset).min(data.len() - done);
            let pte = self.table.lookup(cur).ok_or(cur)?;
            frames.data_mut(pte.frame)[offset..offset + chunk]
                .copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Releases every mapping and table page.
    pub fn release(self, frames: &mut FrameTable) {
        self.table.release(frames);
    }
}
