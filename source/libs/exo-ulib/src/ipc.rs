// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Blocking-style IPC wrappers over `ipc_try_send` and `ipc_recv`.

use core::task::Poll;

use exo_abi::layout::UTOP;
use exo_abi::{Error, Perm, Pid, RecvState, Sys};

use crate::env::{Env, UserError};

/// How many times [`send`] retries a receiver that is not yet waiting.
pub const SEND_ATTEMPTS: usize = 1024;

/// A delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub value: usize,
    pub from: Pid,
    /// Permission of the received page; empty when no page arrived.
    pub perm: Perm,
}

/// Waits for a message, accepting a page at `page` if given.
///
/// Returns `Poll::Pending` while the caller is blocked; call again after
/// other processes have run.
pub fn recv<S: Sys>(env: &mut Env<S>, page: Option<usize>) -> Result<Poll<Message>, UserError> {
    let dst_va = page.unwrap_or(UTOP);
    match env.sys_mut().ipc_recv(dst_va)? {
        RecvState::Waiting => Ok(Poll::Pending),
        RecvState::Delivered => {
            let message = env.sys().ipc_message();
            Ok(Poll::Ready(Message { value: message.value, from: message.from, perm: message.perm }))
        }
    }
}

/// Sends `value` and optionally the page at `page.0` with permission `page.1`,
/// yielding between attempts while the receiver is not waiting.
pub fn send<S: Sys>(
    env: &mut Env<S>,
    to: Pid,
    value: usize,
    page: Option<(usize, Perm)>,
) -> Result<(), UserError> {
    let (src_va, perm) = page.unwrap_or((UTOP, Perm::empty()));
    for _ in 0..SEND_ATTEMPTS {
        match env.sys_mut().ipc_try_send(to, value, src_va, perm) {
            Ok(()) => return Ok(()),
            Err(Error::IpcNotReceiving) => env.sys_mut().yield_now(),
            Err(err) => return Err(err.into()),
        }
    }
    Err(Error::IpcNotReceiving.into())
}
