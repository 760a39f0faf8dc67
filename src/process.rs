// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Simulated processes and their state machine.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;

use crate::memory::parse_mem_kb;
use crate::types::Pid;
use crate::types::Priority;
use crate::types::Tick;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    New,
    Ready,
    Running,
    Suspended,
    Terminated,
}

impl ProcessState {
    /// Whether the state machine allows moving from `self` to `to`.
    pub fn can_become(self, to: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, to),
            (New, Ready)
                | (New, Suspended)
                | (Ready, Suspended)
                | (Ready, Running)
                | (Running, Ready)
                | (Running, Terminated)
                | (Suspended, Ready)
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::New => write!(f, "NEW"),
            ProcessState::Ready => write!(f, "READY"),
            ProcessState::Running => write!(f, "RUNNING"),
            ProcessState::Suspended => write!(f, "SUSPENDED"),
            ProcessState::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// A submission that has not been validated yet.
///
/// Values are signed so that bad input coming from the outside can be
/// rejected with a proper error instead of wrapping around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessRequest {
    pub priority: i64,
    pub burst: i64,
    pub memory_kb: i64,
}

impl ProcessRequest {
    pub fn new(priority: i64, burst: i64, memory_kb: i64) -> Self {
        Self {
            priority,
            burst,
            memory_kb,
        }
    }

    /// Check the request and build the record it describes.
    pub fn validate(&self, pid: Pid) -> Result<ProcessRecord> {
        if self.burst <= 0 {
            bail!("burst must be positive, got {}", self.burst);
        }
        if self.priority < 0 {
            bail!("priority must not be negative, got {}", self.priority);
        }
        if self.memory_kb < 0 {
            bail!("memory must not be negative, got {}KB", self.memory_kb);
        }
        let priority = Priority::try_from(self.priority)
            .with_context(|| format!("priority {} is out of range", self.priority))?;

        Ok(ProcessRecord::new(
            pid,
            priority,
            self.burst as Tick,
            self.memory_kb as u64,
        ))
    }
}

/// Parses `PRIO:BURST[:MEM]`, e.g. `1:10` or `2:6:512kb`.
impl FromStr for ProcessRequest {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.trim().split(':').collect();
        if fields.len() < 2 || fields.len() > 3 {
            bail!("expected PRIO:BURST[:MEM], got {:?}", s);
        }

        let priority = fields[0]
            .trim()
            .parse::<i64>()
            .with_context(|| format!("invalid priority {:?}", fields[0]))?;
        let burst = fields[1]
            .trim()
            .parse::<i64>()
            .with_context(|| format!("invalid burst {:?}", fields[1]))?;
        let memory_kb = match fields.get(2) {
            Some(mem) => i64::try_from(parse_mem_kb(mem)?)
                .with_context(|| format!("memory {:?} is out of range", mem))?,
            None => 0,
        };

        Ok(Self::new(priority, burst, memory_kb))
    }
}

/// One simulated job.
///
/// A record is owned by value by whichever container currently holds it:
/// a ready queue, a CPU's running slot, the suspended list or the
/// terminated list. Handing it over is a move, so it can never sit in two
/// places at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pid: Pid,
    priority: Priority,
    arrival: Tick,
    start: Option<Tick>,
    finish: Option<Tick>,
    burst: Tick,
    remaining: Tick,
    memory_kb: u64,
    state: ProcessState,
}

impl ProcessRecord {
    pub fn new(pid: Pid, priority: Priority, burst: Tick, memory_kb: u64) -> Self {
        Self {
            pid,
            priority,
            arrival: 0,
            start: None,
            finish: None,
            burst,
            remaining: burst,
            memory_kb,
            state: ProcessState::New,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn arrival(&self) -> Tick {
        self.arrival
    }

    pub fn start(&self) -> Option<Tick> {
        self.start
    }

    pub fn finish(&self) -> Option<Tick> {
        self.finish
    }

    pub fn burst(&self) -> Tick {
        self.burst
    }

    pub fn remaining(&self) -> Tick {
        self.remaining
    }

    pub fn memory_kb(&self) -> u64 {
        self.memory_kb
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub(crate) fn set_arrival(&mut self, arrival: Tick) {
        self.arrival = arrival;
    }

    pub(crate) fn transition(&mut self, to: ProcessState) {
        debug_assert!(
            self.state.can_become(to),
            "{} cannot go from {} to {}",
            self.pid,
            self.state,
            to
        );
        self.state = to;
    }

    /// Run the process for the unit of work that ends at `tick`, i.e. the
    /// interval `[tick - 1, tick)`. Returns the remaining burst.
    pub(crate) fn run_unit(&mut self, tick: Tick) -> Tick {
        debug_assert_eq!(self.state, ProcessState::Running);
        debug_assert!(self.remaining > 0, "{} ran with no burst left", self.pid);

        if self.start.is_none() {
            self.start = Some(tick.saturating_sub(1));
        }
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.finish = Some(tick);
            self.transition(ProcessState::Terminated);
        }
        self.remaining
    }

    /// CPU time received so far.
    pub fn executed(&self) -> Tick {
        self.burst - self.remaining
    }

    /// start - arrival
    pub fn response_time(&self) -> Option<Tick> {
        self.start.map(|start| start.saturating_sub(self.arrival))
    }

    /// finish - arrival
    pub fn turnaround_time(&self) -> Option<Tick> {
        self.finish.map(|finish| finish.saturating_sub(self.arrival))
    }

    /// turnaround - burst
    pub fn waiting_time(&self) -> Option<Tick> {
        self.turnaround_time()
            .map(|turnaround| turnaround.saturating_sub(self.burst))
    }

    /// Time spent waiting up to `now`. Once terminated this is the final
    /// waiting time.
    pub fn waiting_time_at(&self, now: Tick) -> Tick {
        match self.waiting_time() {
            Some(waiting) => waiting,
            None => now
                .saturating_sub(self.arrival)
                .saturating_sub(self.executed()),
        }
    }
}

impl fmt::Display for ProcessRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(R={},Pr={})", self.pid, self.remaining, self.priority)
    }
}
