// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hardware abstraction traits consumed by the kernel core
//! OWNERS: @kernel-team
//! PUBLIC API: Console, ConsoleWriter, BufferConsole
//! DEPENDS_ON: spin::Mutex
//! INVARIANTS: Console I/O never blocks

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

/// Byte-oriented console device.
pub trait Console: Send {
    /// Writes raw bytes.
    fn put_bytes(&mut self, bytes: &[u8]);
    /// Returns the next pending input byte, if any.
    fn get_byte(&mut self) -> Option<u8>;
}

/// `fmt::Write` adapter over a console.
pub struct ConsoleWriter<'a>(pub &'a mut dyn Console);

impl fmt::Write for ConsoleWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.put_bytes(s.as_bytes());
        Ok(())
    }
}

#[derive(Default)]
struct BufferInner {
    output: Vec<u8>,
    input: VecDeque<u8>,
}

/// In-memory console. Clones share the same buffers, so a caller can keep
/// a handle while the kernel owns another.
#[derive(Clone, Default)]
pub struct BufferConsole {
    inner: Arc<Mutex<BufferInner>>,
}

impl BufferConsole {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues bytes for `read_char`.
    pub fn push_input(&self, bytes: &[u8]) {
        self.inner.lock().input.extend(bytes.iter().copied());
    }

    /// Everything written so far.
    pub fn output(&self) -> Vec<u8> {
        self.inner.lock().output.clone()
    }

    pub fn output_string(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock().output).into_owned()
    }

    pub fn clear_output(&self) {
        self.inner.lock().output.clear();
    }
}

impl Console for BufferConsole {
    fn put_bytes(&mut self, bytes: &[u8]) {
        self.inner.lock().output.extend_from_slice(bytes);
    }

    fn get_byte(&mut self) -> Option<u8> {
        self.inner.lock().input.pop_front()
    }
}
