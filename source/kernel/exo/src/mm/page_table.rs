// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Two-level page table with lazily allocated second-level pages.
//!
//! The directory and every second-level table each consume one frame from
//! the [`FrameTable`], so running out of frames while growing the table is
//! reported as [`MapError::NoMemory`] just like a failed frame allocation.

extern crate alloc;

use alloc::{boxed::Box, vec::Vec};

use exo_abi::layout::{PAGE_SHIFT, PT_ENTRIES};
use exo_abi::Perm;

use super::frame::{FrameId, FrameTable};
use super::PAGE_SIZE;

const PDX_SHIFT: usize = 22;

/// Page-table entry: frame plus permission bits. Present entries always
/// carry [`Perm::PRESENT`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pte {
    pub frame: FrameId,
    pub perm: Perm,
}

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// No frame was available for a page-table page.
    NoMemory,
}

#[inline]
pub const fn pdx(va: usize) -> usize {
    (va >> PDX_SHIFT) & (PT_ENTRIES - 1)
}

#[inline]
pub const fn ptx(va: usize) -> usize {
    (va >> PAGE_SHIFT) & (PT_ENTRIES - 1)
}

struct TablePage {
    frame: FrameId,
    entries: Box<[Option<Pte>; PT_ENTRIES]>,
}

/// Two-level table. Slot `pdx` of the directory is either empty or owns a
/// second-level table page.
pub struct PageTable {
    root: FrameId,
    dir: Vec<Option<TablePage>>,
}

impl PageTable {
    /// Creates an empty table, taking one frame for the directory.
    pub fn new(frames: &mut FrameTable) -> Result<Self, MapError> {
        let root = frames.alloc_zeroed().map_err(|_| MapError::NoMemory)?;
        frames.incref(root);
        let mut dir = Vec::with_capacity(PT_ENTRIES);
        dir.resize_with(PT_ENTRIES, || None);
        Ok(Self { root, dir })
    }

    /// Frame holding the directory.
    pub fn root_frame(&self) -> FrameId {
        self.root
    }

    /// Returns the entry mapping the page that contains `va`.
    pub fn lookup(&self, va: usize) -> Option<Pte> {
        self.dir[pdx(va)].as_ref().and_then(|table| table.entries[ptx(va)])
    }

    /// True when a second-level table covers `va`.
    pub fn table_present(&self, va: usize) -> bool {
        self.dir[pdx(va)].is_some()
    }

    fn walk_create(
        &mut self,
        frames: &mut FrameTable,
        va: usize,
    ) -> Result<&mut Option<Pte>, MapError> {
        let slot = &mut self.dir[pdx(va)];
        if slot.is_none() {
            let frame = frames.alloc_zeroed().map_err(|_| MapError::NoMemory)?;
            frames.incref(frame);
            log_trace!(target: "mm", "page table for {:#x} in {:?}", va & !((1 << PDX_SHIFT) - 1), frame);
            *slot = Some(TablePage { frame, entries: Box::new([None; PT_ENTRIES]) });
        }
        match slot {
            Some(table) => Ok(&mut table.entries[ptx(va)]),
            None => Err(MapError::NoMemory),
        }
    }

    /// Maps `frame` at `va`, replacing any existing mapping.
    ///
    /// The new frame is referenced before the old one is released, so
    /// re-inserting the frame already mapped at `va` (with new permissions)
    /// never drops it to zero. On failure nothing changes.
    pub fn insert(
        &mut self,
        frames: &mut FrameTable,
        va: usize,
        frame: FrameId,
        perm: Perm,
    ) -> Result<(), MapError> {
        debug_assert_eq!(va % PAGE_SIZE, 0);
        let entry = self.walk_create(frames, va)?;
        frames.incref(frame);
        if let Some(old) = entry.take() {
            frames.decref(old.frame);
        }
        *entry = Some(Pte { frame, perm: perm | Perm::PRESENT });
        Ok(())
    }

    /// Removes the mapping at `va`, dropping its frame reference.
    pub fn remove(&mut self, frames: &mut FrameTable, va: usize) -> Option<Pte> {
        let old = self.dir[pdx(va)].as_mut().and_then(|table| table.entries[ptx(va)].take())?;
        frames.decref(old.frame);
        Some(old)
    }

    /// All present mappings in address order.
    pub fn mappings(&self) -> impl Iterator<Item = (usize, Pte)> + '_ {
        self.dir.iter().enumerate().flat_map(|(di, table)| {
            table.iter().flat_map(move |table| {
                table.entries.iter().enumerate().filter_map(move |(ti, pte)| {
                    (*pte).map(|pte| ((di << PDX_SHIFT) | (ti << PAGE_SHIFT), pte))
                })
            })
        })
    }

    /// Number of second-level tables currently allocated.
    pub fn table_count(&self) -> usize {
        self.dir.iter().filter(|slot| slot.is_some()).count()
    }

    /// Drops every mapping, every table page and the directory.
    pub fn release(mut self, frames: &mut FrameTable) {
        for slot in self.dir.iter_mut() {
            if let Some(table) = slot.take() {
                for pte in table.entries.iter().flatten() {
                    frames.decref(pte.frame);
                }
                frames.decref(table.frame);
            }
        }
        frames.decref(self.root);
    }
}
