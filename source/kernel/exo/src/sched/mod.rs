// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Round-robin scheduler over the process table
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Scheduler (current/set_current/schedule)
//! DEPENDS_ON: task::ProcessTable
//! INVARIANTS: Only Runnable processes are chosen; slot order after the current one

use exo_abi::{Pid, ProcStatus};

use crate::task::ProcessTable;

/// Tracks the running process and picks the next one.
#[derive(Debug, Default)]
pub struct Scheduler {
    current: Option<Pid>,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self { current: None }
    }

    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    pub fn set_current(&mut self, pid: Option<Pid>) {
        self.current = pid;
    }

    /// Picks the first runnable process after the current one in slot
    /// order, wrapping around. Falls back to the current process if it is
    /// still runnable; otherwise the processor idles.
    pub fn schedule(&mut self, procs: &ProcessTable) -> Option<Pid> {
        let slots = procs.capacity();
        let start = self.current.map_or(0, |pid| pid.index() + 1);
        let next = (0..slots)
            .map(|offset| (start + offset) % slots)
            .filter_map(|index| procs.pid_at(index))
            .find(|pid| Some(*pid) != self.current && procs.status(*pid) == Some(ProcStatus::Runnable))
            .or_else(|| {
                self.current
                    .filter(|pid| procs.status(*pid) == Some(ProcStatus::Runnable))
            });
        log_trace!(target: "sched", "schedule {:?} -> {:?}", self.current, next);
        self.current = next;
        next
    }
}
