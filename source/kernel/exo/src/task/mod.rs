// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process table: generation-checked arena of process records
//! OWNERS: @kernel-sched-team
//! PUBLIC API: ProcessTable, Process, Mailbox, ProcessError
//! DEPENDS_ON: mm::{AddressSpace, FrameTable}
//! INVARIANTS: A stale id never resolves; ids are never 0; every record owns its address space

extern crate alloc;

use alloc::vec::Vec;

use exo_abi::{Perm, Pid, ProcStatus, TrapFrame};

use crate::mm::{AddressSpace, FrameTable};

/// Errors reported by process-table operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    /// The id names no live process or the caller lacks authority over it.
    BadTarget,
    /// Every slot is in use.
    NoFreeSlot,
    /// The page directory frame could not be obtained.
    OutOfMemory,
}

/// Rendezvous mailbox embedded in each process record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mailbox {
    pub receiving: bool,
    /// Requested destination; at or above the ceiling means "no page".
    pub dst_va: usize,
    pub value: usize,
    pub from: Pid,
    pub perm: Perm,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self {
            receiving: false,
            dst_va: exo_abi::layout::UTOP,
            value: 0,
            from: Pid::SELF,
            perm: Perm::empty(),
        }
    }
}

/// Process record.
pub struct Process {
    pub id: Pid,
    pub parent: Option<Pid>,
    pub status: ProcStatus,
    pub frame: TrapFrame,
    pub space: AddressSpace,
    pub fault_upcall: Option<usize>,
    pub mailbox: Mailbox,
    /// Syscall number the process is suspended inside, if any. When the
    /// process resumes, that call completes with `frame.regs[REG_RET]`.
    pub parked: Option<usize>,
}

struct Slot {
    last_id: u32,
    process: Option<Process>,
}

/// Arena of process records indexed by [`Pid::index`].
pub struct ProcessTable {
    slots: Vec<Slot>,
}

impl ProcessTable {
    /// Creates a table with `capacity` slots (capped at [`Pid::MAX_SLOTS`]).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Pid::MAX_SLOTS);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot { last_id: 0, process: None });
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Allocates the lowest free slot with a fresh generation. The new
    /// process starts `NotRunnable` with an empty address space.
    pub fn alloc(&mut self, frames: &mut FrameTable, parent: Option<Pid>) -> Result<Pid, ProcessError> {
        let index = self
            .slots
            .iter()
            .position(|slot| slot.process.is_none())
            .ok_or(ProcessError::NoFreeSlot)?;
        let space = AddressSpace::new(frames).map_err(|_| ProcessError::OutOfMemory)?;

        let slot = &mut self.slots[index];
        let step = 1u32 << Pid::GENERATION_SHIFT;
        let mut generation = slot.last_id.wrapping_add(step) & !((Pid::MAX_SLOTS as u32) - 1);
        if generation == 0 {
            generation = step;
        }
        let id = Pid::from_raw(generation | index as u32);
        slot.last_id = id.raw();
        slot.process = Some(Process {
            id,
            parent,
            status: ProcStatus::NotRunnable,
            frame: TrapFrame::default(),
            space,
            fault_upcall: None,
            mailbox: Mailbox::default(),
            parked: None,
        });
        log_debug!(target: "task", "alloc {} parent={:?}", id, parent);
        Ok(id)
    }

    /// Resolves `id` on behalf of `caller`. [`Pid::SELF`] names the caller.
    /// With `check_perm`, only the caller itself or its children resolve.
    pub fn resolve(&self, caller: Pid, id: Pid, check_perm: bool) -> Result<Pid, ProcessError> {
        let id = if id.is_self() { caller } else { id };
        let process = self.get(id).ok_or(ProcessError::BadTarget)?;
        if check_perm && process.id != caller && process.parent != Some(caller) {
            return Err(ProcessError::BadTarget);
        }
        Ok(id)
    }

    /// Returns the live record for `id`; stale generations and free slots miss.
    pub fn get(&self, id: Pid) -> Option<&Process> {
        self.slots
            .get(id.index())
            .and_then(|slot| slot.process.as_ref())
            .filter(|process| process.id == id && process.status != ProcStatus::Free)
    }

    pub fn get_mut(&mut self, id: Pid) -> Option<&mut Process> {
        self.slots
            .get_mut(id.index())
            .and_then(|slot| slot.process.as_mut())
            .filter(|process| process.id == id && process.status != ProcStatus::Free)
    }

    /// Id of the live process in slot `index`.
    pub fn pid_at(&self, index: usize) -> Option<Pid> {
        self.slots.get(index).and_then(|slot| slot.process.as_ref()).map(|p| p.id)
    }

    pub fn status(&self, id: Pid) -> Option<ProcStatus> {
        self.get(id).map(|process| process.status)
    }

    /// Releases the record and everything its address space holds.
    pub fn free(&mut self, frames: &mut FrameTable, id: Pid) -> Result<(), ProcessError> {
        let slot = self
            .slots
            .get_mut(id.index())
            .filter(|slot| slot.process.as_ref().map_or(false, |p| p.id == id))
            .ok_or(ProcessError::BadTarget)?;
        if let Some(process) = slot.process.take() {
            process.space.release(frames);
        }
        log_debug!(target: "task", "free {}", id);
        Ok(())
    }

    /// Ids of processes marked [`ProcStatus::Dying`].
    pub fn dying(&self) -> impl Iterator<Item = Pid> + '_ {
        self.slots
            .iter()
            .filter_map(|slot| slot.process.as_ref())
            .filter(|process| process.status == ProcStatus::Dying)
            .map(|process| process.id)
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.process.is_some()).count()
    }
}
