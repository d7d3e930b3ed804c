// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Untrusted user-mode library built on the exo syscall surface
//! OWNERS: @runtime
//! PUBLIC API: Env, Runtime, UserError, fork(), set_pgfault_handler(), cow_fault(), ipc::{send, recv}
//! DEPENDS_ON: exo-abi
//! INVARIANTS: A forked child is made runnable only after its address space, exception
//!             stack and upcall are in place; any failure inside fork or the fault handler
//!             is fatal to the calling process

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all)]

mod env;
mod fork;
pub mod ipc;
mod pgfault;

pub use env::{Env, FaultHandler, Runtime, UserError, CONSOLE_BUF, MAX_FAULT_DEPTH};
pub use fork::fork;
pub use pgfault::{cow_fault, set_pgfault_handler, UPCALL_ENTRY};

#[cfg(test)]
mod mock;
