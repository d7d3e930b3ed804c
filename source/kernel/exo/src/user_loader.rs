// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Program images and the initial process loader
//! OWNERS: @kernel-team
//! PUBLIC API: Image, Segment, SpawnError, load()
//! DEPENDS_ON: task::ProcessTable, vm::map_fresh
//! INVARIANTS: Segments are page aligned and below UTOP; a failed load leaves no process behind

extern crate alloc;

use alloc::vec::Vec;

use exo_abi::layout::{is_page_aligned, page_up, PAGE_SIZE, USTACKTOP, UTOP};
use exo_abi::{Perm, Pid, ProcStatus};

use crate::mm::FrameTable;
use crate::task::{ProcessError, ProcessTable};
use crate::vm::{self, VmError};

/// One loadable region: `data` followed by zero fill up to `mem_len`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub va: usize,
    pub data: Vec<u8>,
    pub mem_len: usize,
    pub perm: Perm,
}

/// A program: entry point plus segments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Image {
    pub entry: usize,
    pub segments: Vec<Segment>,
}

impl Image {
    pub fn new(entry: usize) -> Self {
        Self { entry, segments: Vec::new() }
    }

    /// Adds a segment initialised from `data`.
    pub fn with_segment(mut self, va: usize, data: &[u8], perm: Perm) -> Self {
        self.segments.push(Segment { va, data: data.to_vec(), mem_len: data.len(), perm });
        self
    }

    /// Adds a zero-filled segment of `len` bytes.
    pub fn with_zeroed(mut self, va: usize, len: usize, perm: Perm) -> Self {
        self.segments.push(Segment { va, data: Vec::new(), mem_len: len, perm });
        self
    }
}

/// Error returned by [`load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// No slot or no directory frame.
    Process(ProcessError),
    /// A segment is misaligned or reaches past UTOP.
    InvalidSegment { va: usize },
    /// Frames ran out while mapping segments.
    OutOfMemory,
}

impl From<ProcessError> for SpawnError {
    fn from(value: ProcessError) -> Self {
        Self::Process(value)
    }
}

fn check_segment(segment: &Segment) -> Result<usize, SpawnError> {
    let len = segment.mem_len.max(segment.data.len());
    let end = segment
        .va
        .checked_add(len)
        .filter(|end| *end <= UTOP)
        .ok_or(SpawnError::InvalidSegment { va: segment.va })?;
    if !is_page_aligned(segment.va) {
        return Err(SpawnError::InvalidSegment { va: segment.va });
    }
    Ok(end)
}

/// Creates a runnable, parentless process from `image`.
pub fn load(
    procs: &mut ProcessTable,
    frames: &mut FrameTable,
    image: &Image,
) -> Result<Pid, SpawnError> {
    for segment in &image.segments {
        check_segment(segment)?;
    }
    let pid = procs.alloc(frames, None)?;
    match populate(procs, frames, pid, image) {
        Ok(()) => {
            log_info!(target: "task", "spawned {} entry={:#x}", pid, image.entry);
            Ok(pid)
        }
        Err(err) => {
            let _ = procs.free(frames, pid);
            Err(err)
        }
    }
}

fn populate(
    procs: &mut ProcessTable,
    frames: &mut FrameTable,
    pid: Pid,
    image: &Image,
) -> Result<(), SpawnError> {
    let process = procs.get_mut(pid).ok_or(SpawnError::Process(ProcessError::BadTarget))?;
    let oom = |_: VmError| SpawnError::OutOfMemory;

    for segment in &image.segments {
        let end = page_up(check_segment(segment)?);
        let perm = segment.perm | Perm::PRESENT | Perm::USER;
        let mut page = segment.va;
        while page < end {
            vm::map_fresh(&mut process.space, frames, page, perm).map_err(oom)?;
            page += PAGE_SIZE;
        }
        process
            .space
            .copy_out(frames, segment.va, &segment.data)
            .map_err(|va| SpawnError::InvalidSegment { va })?;
    }

    let stack = USTACKTOP - PAGE_SIZE;
    vm::map_fresh(&mut process.space, frames, stack, Perm::PRESENT | Perm::USER | Perm::WRITE)
        .map_err(oom)?;

    process.frame.pc = image.entry;
    process.frame.sp = USTACKTOP;
    process.status = ProcStatus::Runnable;
    Ok(())
}
