// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-CPU priority round robin.
//!
//! Each CPU keeps one FIFO ready queue per priority level plus a running
//! slot. The most urgent non-empty queue (lowest priority value) is served
//! first, but only when the running slot is empty: a more urgent arrival
//! waits for the current quantum to run out instead of preempting it.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use crate::process::ProcessRecord;
use crate::process::ProcessState;
use crate::types::Pid;
use crate::types::Priority;
use crate::types::Tick;

/// What happened during one unit of work.
#[derive(Debug, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Nothing to run.
    Idle,
    /// The process ran and keeps the CPU.
    Ran(Pid),
    /// The process ran, used up its quantum and went back to its queue.
    Preempted(Pid),
    /// The process ran its last unit. The record is handed back to the
    /// caller, which is responsible for the cleanup.
    Terminated(ProcessRecord),
}

impl UnitOutcome {
    pub fn is_idle(&self) -> bool {
        matches!(self, UnitOutcome::Idle)
    }
}

#[derive(Debug)]
pub struct RoundRobin {
    quantum: Tick,
    queues: BTreeMap<Priority, VecDeque<ProcessRecord>>,
    current: Option<ProcessRecord>,
    slice_used: Tick,
}

impl RoundRobin {
    pub fn new(quantum: Tick) -> Self {
        debug_assert!(quantum > 0, "quantum must be positive");
        Self {
            quantum,
            queues: BTreeMap::new(),
            current: None,
            slice_used: 0,
        }
    }

    pub fn quantum(&self) -> Tick {
        self.quantum
    }

    /// Append `process` to the tail of its priority queue.
    pub fn enqueue(&mut self, mut process: ProcessRecord) {
        if process.state() != ProcessState::Ready {
            process.transition(ProcessState::Ready);
        }
        self.queues
            .entry(process.priority())
            .or_default()
            .push_back(process);
    }

    fn pick_next(&mut self) -> Option<ProcessRecord> {
        let (&prio, queue) = self.queues.iter_mut().find(|(_, q)| !q.is_empty())?;
        let process = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&prio);
        }
        process
    }

    /// Execute exactly one unit of work for `tick`.
    pub fn execute_one_unit(&mut self, tick: Tick) -> UnitOutcome {
        // The running process is taken out for the unit and put back only
        // if it keeps the CPU.
        let mut current = match self.current.take() {
            Some(current) => current,
            None => {
                let mut next = match self.pick_next() {
                    Some(next) => next,
                    None => return UnitOutcome::Idle,
                };
                next.transition(ProcessState::Running);
                self.slice_used = 0;
                next
            }
        };

        let pid = current.pid();
        let remaining = current.run_unit(tick);
        self.slice_used += 1;

        if remaining == 0 {
            return UnitOutcome::Terminated(current);
        }

        if self.slice_used >= self.quantum {
            self.enqueue(current);
            return UnitOutcome::Preempted(pid);
        }

        self.current = Some(current);
        UnitOutcome::Ran(pid)
    }

    /// Number of queued processes plus the running one.
    pub fn load(&self) -> usize {
        self.nr_queued() + self.current.is_some() as usize
    }

    pub fn nr_queued(&self) -> usize {
        self.queues.values().map(|q| q.len()).sum()
    }

    /// Remove the least urgent, most recently queued process.
    pub fn steal(&mut self) -> Option<ProcessRecord> {
        let (&prio, queue) = self
            .queues
            .iter_mut()
            .rev()
            .find(|(_, q)| !q.is_empty())?;
        let process = queue.pop_back();
        if queue.is_empty() {
            self.queues.remove(&prio);
        }
        process
    }

    /// Take over a process stolen from another CPU. It goes straight into
    /// the running slot with a fresh quantum unless something is already
    /// running there.
    pub fn install_stolen(&mut self, mut process: ProcessRecord) {
        if self.current.is_some() {
            self.enqueue(process);
            return;
        }
        process.transition(ProcessState::Running);
        self.current = Some(process);
        self.slice_used = 0;
    }

    pub fn current(&self) -> Option<&ProcessRecord> {
        self.current.as_ref()
    }

    /// Copy of the ready queues, most urgent first.
    pub fn queues(&self) -> Vec<(Priority, Vec<ProcessRecord>)> {
        self.queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(prio, q)| (*prio, q.iter().cloned().collect()))
            .collect()
    }

    /// Every process held by this CPU, running one first.
    pub fn processes(&self) -> Vec<ProcessRecord> {
        self.current
            .iter()
            .chain(self.queues.values().flatten())
            .cloned()
            .collect()
    }
}
