// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Dispatcher
//!
//! The dispatcher ties the CPUs to the memory allocator:
//!
//! 1. Admission. A new process gets its arrival tick and a memory block. If
//!    no block fits it is suspended, otherwise it is queued on the CPU with
//!    the lowest load (queued plus running, ties to the lowest CPU index).
//!
//! 2. Termination. Finished processes give their block back and are filed in
//!    the terminated list, where they stay for reporting.
//!
//! 3. Reactivation. Once per tick, before the CPUs run, suspended processes
//!    retry allocation in the order they were suspended, so the oldest
//!    waiter gets the first chance at memory freed during the previous tick.
//!
//! 4. Work stealing. A CPU that found nothing to do asks for work. The
//!    victim is the other CPU with the highest load by count. This does not
//!    look at how much burst is left: a CPU holding one very long process is
//!    passed over for one holding several short ones.
//!
//! Lock order is suspended list, then allocator, then a single CPU. No path
//! holds two CPU locks at once.

use std::sync::Arc;
use std::sync::Mutex;

use anyhow::bail;
use anyhow::Result;
use log::debug;
use log::info;
use log::warn;
use metrics::counter;
use metrics::Counter;

use crate::clock::GlobalClock;
use crate::cpu::CpuSnapshot;
use crate::cpu::CpuWorker;
use crate::memory::MemoryAllocator;
use crate::memory::MemorySnapshot;
use crate::process::ProcessRecord;
use crate::process::ProcessState;
use crate::types::lock;
use crate::types::CpuId;
use crate::types::Tick;

/// Where an admitted process ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued(CpuId),
    Suspended,
}

struct Metrics {
    admitted: Counter,
    suspended: Counter,
    reactivated: Counter,
    terminated: Counter,
    stolen: Counter,
    release_errors: Counter,
}

impl Metrics {
    fn new() -> Self {
        Self {
            admitted: counter!("processes_total", "type" => "admitted"),
            suspended: counter!("processes_total", "type" => "suspended"),
            reactivated: counter!("processes_total", "type" => "reactivated"),
            terminated: counter!("processes_total", "type" => "terminated"),
            stolen: counter!("steals_total"),
            release_errors: counter!("release_errors_total"),
        }
    }
}

pub struct Dispatcher {
    clock: Arc<GlobalClock>,
    memory: MemoryAllocator,
    cpus: Vec<CpuWorker>,
    suspended: Mutex<Vec<ProcessRecord>>,
    terminated: Mutex<Vec<ProcessRecord>>,
    metrics: Metrics,
}

impl Dispatcher {
    pub fn new(
        clock: Arc<GlobalClock>,
        nr_cpus: usize,
        quantum: Tick,
        memory_kb: u64,
    ) -> Result<Self> {
        if nr_cpus == 0 {
            bail!("dispatcher requires at least one CPU");
        }
        if quantum == 0 {
            bail!("quantum must be positive");
        }

        Ok(Self {
            clock,
            memory: MemoryAllocator::new(memory_kb),
            cpus: (0..nr_cpus)
                .map(|id| CpuWorker::new(CpuId(id), quantum))
                .collect(),
            suspended: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
            metrics: Metrics::new(),
        })
    }

    pub fn clock(&self) -> &GlobalClock {
        &self.clock
    }

    pub fn memory(&self) -> &MemoryAllocator {
        &self.memory
    }

    pub fn cpus(&self) -> &[CpuWorker] {
        &self.cpus
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    fn least_loaded(&self) -> &CpuWorker {
        // Ties keep the lowest index. `new()` guarantees at least one CPU.
        let mut best = &self.cpus[0];
        let mut min = best.load();
        for cpu in self.cpus[1..].iter() {
            let load = cpu.load();
            if load < min {
                best = cpu;
                min = load;
            }
        }
        best
    }

    fn place(&self, process: ProcessRecord) -> CpuId {
        let cpu = self.least_loaded();
        cpu.enqueue(process);
        cpu.id()
    }

    /// Admit a new process: stamp its arrival, reserve its memory and queue
    /// it on the least loaded CPU, or suspend it if memory is short.
    pub fn admit(&self, mut process: ProcessRecord) -> Admission {
        process.set_arrival(self.clock.get());

        if !self.memory.try_allocate(&process) {
            info!(
                "{} suspended, not enough memory ({}KB)",
                process.pid(),
                process.memory_kb()
            );
            process.transition(ProcessState::Suspended);
            lock(&self.suspended).push(process);
            self.metrics.suspended.increment(1);
            return Admission::Suspended;
        }

        let pid = process.pid();
        let cpu = self.place(process);
        debug!("{} admitted on {}", pid, cpu);
        self.metrics.admitted.increment(1);
        Admission::Queued(cpu)
    }

    /// Clean up after a process finished its burst.
    pub fn on_terminated(&self, process: ProcessRecord) {
        debug_assert_eq!(process.state(), ProcessState::Terminated);

        if let Err(e) = self.memory.release(&process) {
            warn!("Failed to release memory of {}: {:?}", process.pid(), e);
            self.metrics.release_errors.increment(1);
        }
        debug!(
            "{} terminated at tick {:?}",
            process.pid(),
            process.finish()
        );
        lock(&self.terminated).push(process);
        self.metrics.terminated.increment(1);
    }

    /// Retry allocation for every suspended process, oldest first. Returns
    /// how many were brought back.
    pub fn reactivate_suspended(&self) -> usize {
        let mut suspended = lock(&self.suspended);
        let mut nr = 0;
        let mut idx = 0;
        while idx < suspended.len() {
            if !self.memory.try_allocate(&suspended[idx]) {
                idx += 1;
                continue;
            }

            let mut process = suspended.remove(idx);
            let pid = process.pid();
            process.transition(ProcessState::Ready);
            let cpu = self.place(process);
            info!("{} reactivated on {}, memory available", pid, cpu);
            self.metrics.reactivated.increment(1);
            nr += 1;
        }
        nr
    }

    /// Find work for an idle CPU. The victim is the most loaded other CPU;
    /// nothing is returned if every other CPU is empty or the victim has
    /// nothing queued.
    pub fn steal_request(&self, thief: CpuId) -> Option<ProcessRecord> {
        let mut victim: Option<(usize, &CpuWorker)> = None;
        for cpu in self.cpus.iter().filter(|cpu| cpu.id() != thief) {
            let load = cpu.load();
            if load > victim.map_or(0, |(max, _)| max) {
                victim = Some((load, cpu));
            }
        }

        let (_, victim) = victim?;
        let process = victim.steal()?;
        debug!("{} steals {} from {}", thief, process.pid(), victim.id());
        self.metrics.stolen.increment(1);
        Some(process)
    }

    /// Run one tick synchronously: reactivation, the tick itself, then one
    /// unit on every CPU in index order.
    pub fn step(&self) -> Tick {
        self.reactivate_suspended();
        let tick = self.clock.tick();
        for cpu in self.cpus.iter() {
            cpu.run_unit(tick, self);
        }
        tick
    }

    pub fn snapshot_cpus(&self) -> Vec<CpuSnapshot> {
        self.cpus.iter().map(|cpu| cpu.snapshot()).collect()
    }

    pub fn snapshot_memory(&self) -> MemorySnapshot {
        self.memory.snapshot()
    }

    /// Processes on a CPU, running or queued.
    pub fn list_active(&self) -> Vec<ProcessRecord> {
        self.cpus.iter().flat_map(|cpu| cpu.processes()).collect()
    }

    /// Suspended processes, oldest first.
    pub fn list_suspended(&self) -> Vec<ProcessRecord> {
        lock(&self.suspended).clone()
    }

    pub fn nr_terminated(&self) -> usize {
        lock(&self.terminated).len()
    }

    /// Terminated processes in order of completion.
    pub fn list_terminated(&self) -> Vec<ProcessRecord> {
        lock(&self.terminated).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Pid;

    fn dispatcher(nr_cpus: usize, quantum: Tick, memory_kb: u64) -> Dispatcher {
        Dispatcher::new(Arc::new(GlobalClock::new()), nr_cpus, quantum, memory_kb).unwrap()
    }

    fn proc(pid: u32, priority: u32, burst: Tick, memory_kb: u64) -> ProcessRecord {
        ProcessRecord::new(Pid(pid), priority, burst, memory_kb)
    }

    #[test]
    fn test_admit_to_least_loaded() {
        let d = dispatcher(3, 4, 1024);
        assert_eq!(d.admit(proc(1, 0, 5, 0)), Admission::Queued(CpuId(0)));
        assert_eq!(d.admit(proc(2, 0, 5, 0)), Admission::Queued(CpuId(1)));
        assert_eq!(d.admit(proc(3, 0, 5, 0)), Admission::Queued(CpuId(2)));
        assert_eq!(d.admit(proc(4, 0, 5, 0)), Admission::Queued(CpuId(0)));
        assert_eq!(d.cpus[0].load(), 2);
    }

    #[test]
    fn test_new_rejects_empty_config() {
        let clock = Arc::new(GlobalClock::new());
        assert!(Dispatcher::new(clock.clone(), 0, 4, 1024).is_err());
        assert!(Dispatcher::new(clock.clone(), 2, 0, 1024).is_err());
        assert!(Dispatcher::new(clock, 1, 1, 0).is_ok());
    }

    #[test]
    fn test_admit_stamps_arrival() {
        let d = dispatcher(1, 4, 1024);
        d.step();
        d.step();
        d.admit(proc(1, 0, 5, 0));
        assert_eq!(d.list_active()[0].arrival(), 2);
    }

    #[test]
    fn test_suspend_and_reactivate_in_fifo_order() {
        let d = dispatcher(2, 4, 100);
        assert_eq!(d.admit(proc(1, 0, 2, 100)), Admission::Queued(CpuId(0)));
        assert_eq!(d.admit(proc(2, 0, 2, 60)), Admission::Suspended);
        assert_eq!(d.admit(proc(3, 0, 2, 60)), Admission::Suspended);
        assert_eq!(d.list_suspended()[0].state(), ProcessState::Suspended);

        // Nothing freed yet.
        assert_eq!(d.reactivate_suspended(), 0);

        d.step();
        d.step();
        assert_eq!(d.list_terminated().len(), 1);
        assert_eq!(d.snapshot_memory().used_capacity, 0);

        // Only one of the two fits: the older one.
        assert_eq!(d.reactivate_suspended(), 1);
        let suspended = d.list_suspended();
        assert_eq!(suspended.len(), 1);
        assert_eq!(suspended[0].pid(), Pid(3));

        let active = d.list_active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].pid(), Pid(2));
        assert_eq!(active[0].state(), ProcessState::Ready);
    }

    #[test]
    fn test_termination_releases_memory() {
        let d = dispatcher(1, 4, 64);
        d.admit(proc(1, 0, 1, 32));
        assert_eq!(d.snapshot_memory().used_capacity, 32);
        d.step();
        let snap = d.snapshot_memory();
        assert_eq!(snap.used_capacity, 0);
        assert_eq!(snap.blocks.len(), 1);
        assert_eq!(d.list_terminated()[0].finish(), Some(1));
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_terminated_without_block_is_still_recorded() {
        let d = dispatcher(1, 4, 64);
        d.admit(proc(1, 0, 5, 32));
        d.admit(proc(2, 0, 5, 16));
        let layout = d.snapshot_memory();

        // P3 never went through admission and owns no block.
        let mut p3 = proc(3, 0, 1, 8);
        p3.transition(ProcessState::Ready);
        p3.transition(ProcessState::Running);
        assert_eq!(p3.run_unit(1), 0);
        d.on_terminated(p3);

        assert_eq!(d.snapshot_memory(), layout);
        let terminated = d.list_terminated();
        assert_eq!(terminated.len(), 1);
        assert_eq!(terminated[0].pid(), Pid(3));
        assert_eq!(terminated[0].state(), ProcessState::Terminated);
        assert_eq!(d.list_active().len(), 2);
    }

    #[test]
    fn test_steal_from_lowest_priority_tail() {
        let d = dispatcher(2, 4, 0);
        d.cpus[0].enqueue(proc(1, 2, 8, 0));
        d.cpus[0].enqueue(proc(2, 5, 8, 0));

        d.step();

        // CPU0 picked P1; CPU1 was idle and took P2 straight into its
        // running slot.
        let cpus = d.snapshot_cpus();
        assert_eq!(cpus[0].running.as_ref().unwrap().pid(), Pid(1));
        assert!(cpus[0].queues.is_empty());
        assert_eq!(cpus[1].running.as_ref().unwrap().pid(), Pid(2));
        assert_eq!(cpus[1].running.as_ref().unwrap().remaining(), 8);
        assert_eq!(cpus[1].ticks_worked, 0);

        d.step();
        let cpus = d.snapshot_cpus();
        assert_eq!(cpus[1].running.as_ref().unwrap().remaining(), 7);
        assert_eq!(cpus[1].running.as_ref().unwrap().start(), Some(1));
        assert_eq!(cpus[0].running.as_ref().unwrap().pid(), Pid(1));
        assert_eq!(cpus[1].ticks_worked, 1);
        assert_eq!(cpus[1].ticks_total, 2);
    }

    #[test]
    fn test_steal_picks_most_loaded_by_count() {
        let d = dispatcher(3, 4, 0);
        // One long process on CPU0, three short ones on CPU1.
        d.cpus[0].enqueue(proc(1, 0, 1000, 0));
        d.cpus[1].enqueue(proc(2, 0, 1, 0));
        d.cpus[1].enqueue(proc(3, 0, 1, 0));
        d.cpus[1].enqueue(proc(4, 0, 1, 0));

        let stolen = d.steal_request(CpuId(2)).unwrap();
        assert_eq!(stolen.pid(), Pid(4));
    }

    #[test]
    fn test_steal_ties_go_to_lowest_index() {
        let d = dispatcher(3, 4, 0);
        d.cpus[1].enqueue(proc(1, 0, 5, 0));
        d.cpus[2].enqueue(proc(2, 0, 5, 0));
        assert_eq!(d.steal_request(CpuId(0)).unwrap().pid(), Pid(1));
    }

    #[test]
    fn test_steal_nothing_available() {
        let d = dispatcher(2, 4, 0);
        assert!(d.steal_request(CpuId(0)).is_none());

        // Only a running process on the victim: nothing to take.
        d.cpus[1].enqueue(proc(1, 0, 5, 0));
        d.cpus[1].run_unit(d.clock().tick(), &d);
        assert_eq!(d.cpus[1].load(), 1);
        assert!(d.steal_request(CpuId(0)).is_none());

        // A thief never steals from itself.
        d.cpus[0].enqueue(proc(2, 0, 5, 0));
        d.cpus[0].enqueue(proc(3, 0, 5, 0));
        assert!(d.steal_request(CpuId(0)).is_none());
    }
}
