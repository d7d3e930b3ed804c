// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Stable ABI shared by the exo kernel and untrusted user libraries
//! OWNERS: @runtime
//! PUBLIC API: Pid, Perm, FaultFlags, Error, ProcStatus, TrapFrame, FaultRecord, Sys, layout, nr
//! DEPENDS_ON: bitflags, static_assertions
//! INVARIANTS: Syscall numbers and negated error codes never change meaning;
//!             FaultRecord serializes to a fixed little-endian layout
//!
//! Everything a user-level library may rely on lives here: the address
//! space layout, permission bits, process identifiers, the numbered
//! syscall surface and the record the kernel pushes on a page fault.

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

use bitflags::bitflags;
use core::fmt;

/// Result alias used across the syscall surface.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors reported by kernel primitives. Encoded on the wire as negated codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// Target process does not exist or the caller may not act on it.
    BadTarget,
    /// Misaligned address, out-of-range address, bad permission word or
    /// unknown syscall number.
    InvalidArgument,
    /// Physical frames or page-table storage ran out.
    OutOfMemory,
    /// Every process slot is in use.
    NoFreeProcess,
    /// A user pointer failed validation.
    Fault,
    /// The receiver is not blocked in `ipc_recv`.
    IpcNotReceiving,
}

impl Error {
    /// Returns the negated wire code for this error.
    pub const fn code(self) -> isize {
        match self {
            Self::BadTarget => -2,
            Self::InvalidArgument => -3,
            Self::OutOfMemory => -4,
            Self::NoFreeProcess => -5,
            Self::Fault => -6,
            Self::IpcNotReceiving => -7,
        }
    }

    /// Decodes a negated wire code.
    pub const fn from_code(code: isize) -> Option<Self> {
        match code {
            -2 => Some(Self::BadTarget),
            -3 => Some(Self::InvalidArgument),
            -4 => Some(Self::OutOfMemory),
            -5 => Some(Self::NoFreeProcess),
            -6 => Some(Self::Fault),
            -7 => Some(Self::IpcNotReceiving),
            _ => None,
        }
    }

    /// Splits a raw syscall return register into a value or an error.
    pub fn decode_return(raw: usize) -> Result<usize> {
        let signed = raw as isize;
        if signed < 0 {
            Err(Self::from_code(signed).unwrap_or(Self::InvalidArgument))
        } else {
            Ok(raw)
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::BadTarget => "bad process",
            Self::InvalidArgument => "invalid parameter",
            Self::OutOfMemory => "out of memory",
            Self::NoFreeProcess => "out of processes",
            Self::Fault => "segmentation fault",
            Self::IpcNotReceiving => "process is not receiving",
        };
        f.write_str(text)
    }
}

/// Syscall numbers. Any other number fails with [`Error::InvalidArgument`].
pub mod nr {
    /// Write a user buffer to the console.
    pub const PRINT: usize = 0;
    /// Read one character from the console without blocking.
    pub const READ_CHAR: usize = 1;
    /// Return the caller's process identifier.
    pub const SELF_ID: usize = 2;
    /// Destroy a process.
    pub const DESTROY: usize = 3;
    /// Allocate a zero-filled page.
    pub const PAGE_ALLOC: usize = 4;
    /// Share a page between address spaces.
    pub const PAGE_MAP: usize = 5;
    /// Remove a mapping.
    pub const PAGE_UNMAP: usize = 6;
    /// Create a blank child process.
    pub const EXOFORK: usize = 7;
    /// Mark a process runnable or not runnable.
    pub const SET_STATUS: usize = 8;
    /// Register the page-fault upcall entry point.
    pub const SET_FAULT_UPCALL: usize = 9;
    /// Give up the processor.
    pub const YIELD: usize = 10;
    /// Attempt a rendezvous send.
    pub const IPC_TRY_SEND: usize = 11;
    /// Block until a message arrives.
    pub const IPC_RECV: usize = 12;
    /// Size of the dispatch table.
    pub const COUNT: usize = 13;
}

/// User address space layout.
pub mod layout {
    /// Page size in bytes.
    pub const PAGE_SIZE: usize = 4096;
    /// log2 of [`PAGE_SIZE`].
    pub const PAGE_SHIFT: usize = 12;
    /// Entries per page-table page.
    pub const PT_ENTRIES: usize = 1024;
    /// Bytes covered by one page-table page (4 MiB).
    pub const PT_SPAN: usize = PAGE_SIZE * PT_ENTRIES;
    /// Exclusive upper bound of user-controllable addresses.
    pub const UTOP: usize = 0xEEC0_0000;
    /// Top of the one-page exception stack.
    pub const UXSTACKTOP: usize = UTOP;
    /// Top of the normal user stack. One unmapped guard page sits above it.
    pub const USTACKTOP: usize = UTOP - 2 * PAGE_SIZE;
    /// Start of program text.
    pub const UTEXT: usize = 2 * PT_SPAN;
    /// Scratch area for temporary mappings.
    pub const UTEMP: usize = PT_SPAN;
    /// Scratch page used by the copy-on-write handler.
    pub const PFTEMP: usize = UTEMP + PT_SPAN - PAGE_SIZE;
    /// Size of one machine word on the exception stack.
    pub const WORD: usize = core::mem::size_of::<usize>();

    /// Rounds `va` down to its page base.
    pub const fn page_down(va: usize) -> usize {
        va & !(PAGE_SIZE - 1)
    }

    /// Rounds `va` up to the next page boundary, saturating at the top.
    pub const fn page_up(va: usize) -> usize {
        match va.checked_add(PAGE_SIZE - 1) {
            Some(v) => page_down(v),
            None => page_down(usize::MAX),
        }
    }

    /// True when `va` is page aligned.
    pub const fn is_page_aligned(va: usize) -> bool {
        va & (PAGE_SIZE - 1) == 0
    }

    /// True when `va` is a page-aligned user address below [`UTOP`].
    pub const fn is_user_page(va: usize) -> bool {
        va < UTOP && is_page_aligned(va)
    }
}

bitflags! {
    /// Per-page permission word. Bit positions follow the hardware PTE layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Perm: u32 {
        /// Mapping is present.
        const PRESENT = 0x001;
        /// Mapping is writable.
        const WRITE = 0x002;
        /// Mapping is reachable from user mode.
        const USER = 0x004;
        /// Write-through caching.
        const WRITE_THROUGH = 0x008;
        /// Caching disabled.
        const CACHE_DISABLE = 0x010;
        /// Set by hardware on access.
        const ACCESSED = 0x020;
        /// Set by hardware on write.
        const DIRTY = 0x040;
        /// Large page.
        const HUGE = 0x080;
        /// Global mapping.
        const GLOBAL = 0x100;
        /// First software-available bit.
        const AVAIL0 = 0x200;
        /// Second software-available bit.
        const AVAIL1 = 0x400;
        /// Copy-on-write marker, the third software-available bit.
        const COW = 0x800;
    }
}

impl Perm {
    /// Software-available bits, including [`Perm::COW`].
    pub const AVAIL: Perm = Perm::AVAIL0.union(Perm::AVAIL1).union(Perm::COW);
    /// Bits every user-supplied permission word must carry.
    pub const REQUIRED: Perm = Perm::PRESENT.union(Perm::USER);
    /// Bits a user-supplied permission word may carry.
    pub const SYSCALL: Perm = Perm::AVAIL.union(Perm::REQUIRED).union(Perm::WRITE);

    /// Validates a permission word supplied across the syscall boundary.
    pub const fn is_syscall_valid(self) -> bool {
        self.contains(Self::REQUIRED) && Self::SYSCALL.contains(self)
    }
}

bitflags! {
    /// Access description attached to a page fault.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FaultFlags: u32 {
        /// The page was present; the fault is a protection violation.
        const PRESENT = 0x1;
        /// The access was a write.
        const WRITE = 0x2;
        /// The access came from user mode.
        const USER = 0x4;
    }
}

/// Process identifier: a generation counter above a slot index.
///
/// The value 0 never names a live process and means "the caller" in every
/// syscall that takes a process argument.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    /// Alias for the calling process.
    pub const SELF: Pid = Pid(0);
    /// Number of index bits.
    pub const LOG2_SLOTS: u32 = 10;
    /// Maximum number of process slots.
    pub const MAX_SLOTS: usize = 1 << Self::LOG2_SLOTS;
    /// Shift of the generation counter.
    pub const GENERATION_SHIFT: u32 = 12;

    /// Wraps a raw identifier.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Slot index encoded in the identifier.
    pub const fn index(self) -> usize {
        (self.0 as usize) & (Self::MAX_SLOTS - 1)
    }

    /// Generation counter encoded in the identifier.
    pub const fn generation(self) -> u32 {
        self.0 >> Self::GENERATION_SHIFT
    }

    /// True for the [`Pid::SELF`] alias.
    pub const fn is_self(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pid({:08x})", self.0)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Scheduling status of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ProcStatus {
    /// Slot unused.
    Free = 0,
    /// Destroyed while running; reclaimed on the way out of the kernel.
    Dying = 1,
    /// Eligible for scheduling.
    Runnable = 2,
    /// Parked, e.g. a fresh child or a blocked receiver.
    NotRunnable = 4,
}

impl ProcStatus {
    /// Decodes a status argument.
    pub const fn from_raw(raw: usize) -> Option<Self> {
        match raw {
            0 => Some(Self::Free),
            1 => Some(Self::Dying),
            2 => Some(Self::Runnable),
            4 => Some(Self::NotRunnable),
            _ => None,
        }
    }
}

/// Index of the return-value register in [`TrapFrame::regs`].
pub const REG_RET: usize = 0;

/// Saved user register state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrapFrame {
    /// General purpose registers; `regs[REG_RET]` carries syscall results.
    pub regs: [usize; 8],
    /// Program counter.
    pub pc: usize,
    /// Stack pointer.
    pub sp: usize,
    /// Processor flags.
    pub flags: usize,
}

/// Record pushed onto the exception stack before the fault upcall runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    /// Faulting virtual address.
    pub fault_va: usize,
    /// Access description.
    pub flags: FaultFlags,
    /// Register state at the time of the fault.
    pub frame: TrapFrame,
}

impl FaultRecord {
    const WORDS: usize = 2 + 8 + 3;
    /// Serialized size in bytes; every field is one little-endian u64.
    pub const SIZE: usize = Self::WORDS * 8;

    /// Encodes the record.
    pub fn to_le_bytes(&self) -> [u8; Self::SIZE] {
        let mut words = [0u64; Self::WORDS];
        words[0] = self.fault_va as u64;
        words[1] = u64::from(self.flags.bits());
        for (slot, reg) in words[2..10].iter_mut().zip(self.frame.regs.iter()) {
            *slot = *reg as u64;
        }
        words[10] = self.frame.pc as u64;
        words[11] = self.frame.sp as u64;
        words[12] = self.frame.flags as u64;

        let mut out = [0u8; Self::SIZE];
        for (chunk, word) in out.chunks_exact_mut(8).zip(words.iter()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Decodes a record. Unknown fault flag bits are dropped.
    pub fn from_le_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut words = [0u64; Self::WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *word = u64::from_le_bytes(raw);
        }
        let mut regs = [0usize; 8];
        for (reg, word) in regs.iter_mut().zip(words[2..10].iter()) {
            *reg = *word as usize;
        }
        Self {
            fault_va: words[0] as usize,
            flags: FaultFlags::from_bits_truncate(words[1] as u32),
            frame: TrapFrame {
                regs,
                pc: words[10] as usize,
                sp: words[11] as usize,
                flags: words[12] as usize,
            },
        }
    }
}

static_assertions::const_assert_eq!(FaultRecord::SIZE, 104);
static_assertions::const_assert!(FaultRecord::SIZE + layout::WORD < layout::PAGE_SIZE);
static_assertions::const_assert!(layout::is_page_aligned(layout::UTOP));
static_assertions::const_assert!(layout::PFTEMP < layout::UTEXT);

/// Result of a user-mode memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemFault {
    /// The kernel pushed a [`FaultRecord`] at `record_va` and redirected the
    /// process to its fault upcall.
    Upcall {
        /// Exception-stack address of the pushed record.
        record_va: usize,
    },
    /// The process was destroyed.
    Killed,
}

/// Outcome of `ipc_recv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    /// The caller is blocked; no sender has delivered yet.
    Waiting,
    /// A message is in the caller's mailbox.
    Delivered,
}

/// Mailbox contents after a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpcMessage {
    /// Transferred integer.
    pub value: usize,
    /// Sender identifier.
    pub from: Pid,
    /// Permission of the transferred page, empty when no page moved.
    pub perm: Perm,
}

/// The syscall surface as seen from a user process.
///
/// Methods that take a process accept [`Pid::SELF`]. The read-only views
/// (`page_perm`, `table_present`, `ipc_message`, `fault_upcall`) model the
/// kernel's read-only mappings of the caller's own page tables and process
/// record.
pub trait Sys {
    /// Writes `len` bytes starting at user address `va` to the console.
    fn print(&mut self, va: usize, len: usize) -> Result<()>;
    /// Reads one console character, `None` when no input is pending.
    fn read_char(&mut self) -> Option<u8>;
    /// Returns the caller's identifier.
    fn self_id(&mut self) -> Pid;
    /// Destroys `pid` (the caller or one of its children).
    fn destroy(&mut self, pid: Pid) -> Result<()>;
    /// Gives up the processor.
    fn yield_now(&mut self);
    /// Creates a blank child. Returns the child id to the parent and
    /// [`Pid::SELF`] when the child resumes.
    fn exofork(&mut self) -> Result<Pid>;
    /// Sets a process's scheduling status.
    fn set_status(&mut self, pid: Pid, status: ProcStatus) -> Result<()>;
    /// Registers the fault upcall entry point.
    fn set_fault_upcall(&mut self, pid: Pid, entry: usize) -> Result<()>;
    /// Maps a fresh zero-filled page.
    fn page_alloc(&mut self, pid: Pid, va: usize, perm: Perm) -> Result<()>;
    /// Shares the frame behind `src_va` into `dst` at `dst_va`.
    fn page_map(&mut self, src: Pid, src_va: usize, dst: Pid, dst_va: usize, perm: Perm) -> Result<()>;
    /// Removes a mapping; unmapped addresses are a silent success.
    fn page_unmap(&mut self, pid: Pid, va: usize) -> Result<()>;
    /// Attempts a rendezvous send. Pass `src_va >= UTOP` to send no page.
    fn ipc_try_send(&mut self, to: Pid, value: usize, src_va: usize, perm: Perm) -> Result<()>;
    /// Blocks for a message. Pass `dst_va >= UTOP` to refuse pages.
    fn ipc_recv(&mut self, dst_va: usize) -> Result<RecvState>;

    /// Permission of the caller's mapping at `va`, if any.
    fn page_perm(&self, va: usize) -> Option<Perm>;
    /// True when a page-table page covers `va` in the caller's space.
    fn table_present(&self, va: usize) -> bool;
    /// Last delivered message.
    fn ipc_message(&self) -> IpcMessage;
    /// Registered fault upcall entry point.
    fn fault_upcall(&self) -> Option<usize>;

    /// Reads user memory, faulting like hardware would.
    fn load(&mut self, va: usize, buf: &mut [u8]) -> core::result::Result<(), MemFault>;
    /// Writes user memory, faulting like hardware would.
    fn store(&mut self, va: usize, data: &[u8]) -> core::result::Result<(), MemFault>;
    /// Restores the register state saved in a fault record.
    fn return_from_upcall(&mut self, frame: &TrapFrame);
}
