// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Reference-counted physical frame pool.
//!
//! Frames are identified only by number. A frame's count equals the number
//! of mappings (or page-table slots) holding it; it returns to the free list
//! when the count drops to zero.

extern crate alloc;

use alloc::{boxed::Box, vec::Vec};
use core::fmt;

use super::PAGE_SIZE;

/// Physical frame number.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(u32);

impl FrameId {
    /// Raw frame number.
    pub const fn raw(self) -> u32 {
        self.0
    }

    const fn slot(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({})", self.0)
    }
}

/// Error returned by frame allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The pool has no free frames.
    Exhausted,
}

struct Slot {
    refs: u32,
    data: Option<Box<[u8; PAGE_SIZE]>>,
}

/// Fixed-capacity frame table.
pub struct FrameTable {
    slots: Vec<Slot>,
    free: Vec<FrameId>,
}

impl FrameTable {
    /// Creates a pool of `count` frames. Backing storage is allocated lazily.
    pub fn new(count: usize) -> Self {
        let count = count.min(u32::MAX as usize);
        let mut slots = Vec::with_capacity(count);
        slots.resize_with(count, || Slot { refs: 0, data: None });
        // Lowest frame numbers come off the free list first.
        let free = (0..count as u32).rev().map(FrameId).collect();
        Self { slots, free }
    }

    /// Total number of frames.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Frames currently on the free list.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Takes a zero-filled frame off the free list with a count of zero.
    /// The caller installs it with [`FrameTable::incref`] or hands it back
    /// with [`FrameTable::free`].
    pub fn alloc_zeroed(&mut self) -> Result<FrameId, FrameError> {
        let id = self.free.pop().ok_or(FrameError::Exhausted)?;
        let slot = &mut self.slots[id.slot()];
        debug_assert_eq!(slot.refs, 0);
        match slot.data.as_mut() {
            Some(data) => data.fill(0),
            None => slot.data = Some(Box::new([0u8; PAGE_SIZE])),
        }
        Ok(id)
    }

    /// Returns an unreferenced frame to the pool.
    pub fn free(&mut self, id: FrameId) {
        let slot = &mut self.slots[id.slot()];
        debug_assert_eq!(slot.refs, 0, "freeing referenced frame {:?}", id);
        if slot.refs == 0 {
            self.free.push(id);
        }
    }

    pub fn incref(&mut self, id: FrameId) {
        self.slots[id.slot()].refs += 1;
    }

    /// Drops one reference; frees the frame and returns `true` at zero.
    pub fn decref(&mut self, id: FrameId) -> bool {
        let slot = &mut self.slots[id.slot()];
        debug_assert!(slot.refs > 0, "refcount underflow on {:?}", id);
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 {
            self.free.push(id);
            true
        } else {
            false
        }
    }

    /// Current reference count.
    pub fn refcount(&self, id: FrameId) -> u32 {
        self.slots.get(id.slot()).map_or(0, |slot| slot.refs)
    }

    /// Frame contents. Never-touched frames read as zero.
    pub fn data(&self, id: FrameId) -> &[u8; PAGE_SIZE] {
        const ZERO: [u8; PAGE_SIZE] = [0; PAGE_SIZE];
        match self.slots[id.slot()].data.as_deref() {
            Some(data) => data,
            None => &ZERO,
        }
    }

    /// Mutable frame contents.
    pub fn data_mut(&mut self, id: FrameId) -> &mut [u8; PAGE_SIZE] {
        self.slots[id.slot()]
            .data
            .get_or_insert_with(|| Box::new([0u8; PAGE_SIZE]))
    }
}
