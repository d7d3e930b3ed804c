// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Exokernel mechanism layer: page primitives, rendezvous IPC, syscall boundary
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel, KernelConfig, UserEnv, Image, Segment, syscall::{SyscallTable, Args}
//! DEPENDS_ON: exo-abi, spin, static_assertions
//! INVARIANTS: Only vm:: mutates user page tables; frame refcount == live mappings;
//!             a process becomes runnable only through explicit state transitions

#![cfg_attr(not(test), no_std)]
#![forbid(clippy::unwrap_used)]
#![deny(unsafe_code)]

extern crate alloc;

#[macro_use]
mod diag;

pub mod hal;
pub mod ipc;
pub mod kernel;
pub mod mm;
pub mod sched;
pub mod syscall;
pub mod task;
pub mod trap;
pub mod user;
pub mod user_loader;
pub mod vm;

pub use diag::log;
pub use kernel::{Access, Kernel, KernelConfig, SyscallOutcome};
pub use user::UserEnv;
pub use user_loader::{Image, Segment, SpawnError};
