// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Simulated CPU workers.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use log::debug;
use log::trace;
use metrics::counter;
use metrics::Counter;

use crate::dispatcher::Dispatcher;
use crate::process::ProcessRecord;
use crate::rr::RoundRobin;
use crate::rr::UnitOutcome;
use crate::types::lock;
use crate::types::CpuId;
use crate::types::Priority;
use crate::types::Tick;

/// Point-in-time view of one CPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuSnapshot {
    pub cpu: CpuId,
    pub running: Option<ProcessRecord>,
    pub queues: Vec<(Priority, Vec<ProcessRecord>)>,
    pub ticks_worked: u64,
    pub ticks_total: u64,
}

impl CpuSnapshot {
    /// Share of ticks spent running a process, in percent.
    pub fn utilization(&self) -> f64 {
        match self.ticks_total {
            0 => 0.0,
            total => 100.0 * self.ticks_worked as f64 / total as f64,
        }
    }
}

struct Metrics {
    worked: Counter,
    idle: Counter,
}

impl Metrics {
    fn new(id: CpuId) -> Self {
        Self {
            worked: counter!("cpu_ticks_total", "cpu" => id.0.to_string(), "type" => "worked"),
            idle: counter!("cpu_ticks_total", "cpu" => id.0.to_string(), "type" => "idle"),
        }
    }
}

/// One CPU: a round robin scheduler plus its tick accounting.
///
/// The scheduler sits behind its own lock so that a peer stealing from it
/// and the owning thread never race. A worker never holds its lock while
/// talking to the dispatcher.
pub struct CpuWorker {
    id: CpuId,
    rr: Mutex<RoundRobin>,
    ticks_worked: AtomicU64,
    ticks_total: AtomicU64,
    metrics: Metrics,
}

impl CpuWorker {
    pub fn new(id: CpuId, quantum: Tick) -> Self {
        Self {
            id,
            rr: Mutex::new(RoundRobin::new(quantum)),
            ticks_worked: AtomicU64::new(0),
            ticks_total: AtomicU64::new(0),
            metrics: Metrics::new(id),
        }
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    pub fn enqueue(&self, process: ProcessRecord) {
        lock(&self.rr).enqueue(process);
    }

    pub fn load(&self) -> usize {
        lock(&self.rr).load()
    }

    pub fn steal(&self) -> Option<ProcessRecord> {
        lock(&self.rr).steal()
    }

    pub fn install_stolen(&self, process: ProcessRecord) {
        lock(&self.rr).install_stolen(process);
    }

    pub fn ticks_worked(&self) -> u64 {
        self.ticks_worked.load(Ordering::Relaxed)
    }

    pub fn ticks_total(&self) -> u64 {
        self.ticks_total.load(Ordering::Relaxed)
    }

    /// One lock-step iteration for `tick`: execute a unit, account for it,
    /// and hand a finished process back to the dispatcher or, when there was
    /// nothing to do, ask it for work from a busier CPU. A terminated
    /// process comes back as a read-only copy of what the dispatcher filed.
    pub fn run_unit(&self, tick: Tick, dispatcher: &Dispatcher) -> UnitOutcome {
        let outcome = lock(&self.rr).execute_one_unit(tick);

        self.ticks_total.fetch_add(1, Ordering::Relaxed);
        match &outcome {
            UnitOutcome::Idle => {
                self.metrics.idle.increment(1);
                trace!("{} idle at tick {}", self.id, tick);
            }
            UnitOutcome::Ran(pid) | UnitOutcome::Preempted(pid) => {
                self.ticks_worked.fetch_add(1, Ordering::Relaxed);
                self.metrics.worked.increment(1);
                trace!("{} ran {} at tick {}", self.id, pid, tick);
            }
            UnitOutcome::Terminated(process) => {
                self.ticks_worked.fetch_add(1, Ordering::Relaxed);
                self.metrics.worked.increment(1);
                trace!("{} finished {} at tick {}", self.id, process.pid(), tick);
            }
        }

        match outcome {
            UnitOutcome::Terminated(process) => {
                dispatcher.on_terminated(process.clone());
                UnitOutcome::Terminated(process)
            }
            UnitOutcome::Idle => {
                if let Some(stolen) = dispatcher.steal_request(self.id) {
                    debug!("{} stole {} at tick {}", self.id, stolen.pid(), tick);
                    self.install_stolen(stolen);
                }
                UnitOutcome::Idle
            }
            other => other,
        }
    }

    /// Lock-step loop. Waits for each new tick, runs exactly one unit for
    /// it and acknowledges it. Stopping the clock is the cancellation
    /// signal: the loop returns once the clock is stopped and every tick it
    /// issued has been executed.
    pub fn run(&self, dispatcher: &Dispatcher, mut seen: Tick) {
        let clock = dispatcher.clock();
        debug!("{} starting at tick {}", self.id, seen);
        while let Some(tick) = clock.wait_for_tick(seen) {
            self.run_unit(tick, dispatcher);
            clock.ack();
            seen = tick;
        }
        debug!("{} stopped at tick {}", self.id, seen);
    }

    pub fn snapshot(&self) -> CpuSnapshot {
        let rr = lock(&self.rr);
        CpuSnapshot {
            cpu: self.id,
            running: rr.current().cloned(),
            queues: rr.queues(),
            ticks_worked: self.ticks_worked(),
            ticks_total: self.ticks_total(),
        }
    }

    /// Every process currently on this CPU, running one first.
    pub fn processes(&self) -> Vec<ProcessRecord> {
        lock(&self.rr).processes()
    }
}
