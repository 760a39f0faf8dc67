// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;
use std::time::Instant;

use scx_mpsim::Pid;
use scx_mpsim::ProcessRecord;
use scx_mpsim::ProcessState;
use scx_mpsim::SimConfig;
use scx_mpsim::Simulator;
use scx_mpsim::Tick;

/// Route log output through the test harness. Safe to call from every test;
/// only the first call installs the logger.
pub fn setup_test() {
    let _ = simplelog::TestLogger::init(
        simplelog::LevelFilter::Debug,
        simplelog::Config::default(),
    );
}

pub fn sim(nr_cpus: usize, quantum: Tick, memory_kb: u64) -> Simulator {
    setup_test();
    Simulator::new(SimConfig {
        nr_cpus,
        quantum,
        memory_kb,
        ..Default::default()
    })
    .unwrap()
}

/// Same as [`sim`] with a short real-time tick, for tests that start the
/// threads.
pub fn threaded_sim(nr_cpus: usize, quantum: Tick, memory_kb: u64) -> Simulator {
    setup_test();
    Simulator::new(SimConfig {
        nr_cpus,
        quantum,
        memory_kb,
        tick_interval: Duration::from_millis(2),
    })
    .unwrap()
}

/// Step until nothing is left, checking the invariants after every tick.
/// Returns the tick at which the last process finished.
pub fn step_until_drained(sim: &Simulator, max_ticks: Tick) -> Tick {
    while !sim.is_drained() {
        let tick = sim.step().unwrap();
        check_invariants(sim);
        assert!(tick <= max_ticks, "not drained after {} ticks", max_ticks);
    }
    sim.now()
}

/// Poll `cond` until it holds or `timeout` expires.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

pub fn pids(processes: &[ProcessRecord]) -> Vec<u32> {
    processes.iter().map(|p| p.pid().0).collect()
}

/// Memory layout is a valid partition, every process sits in exactly one
/// container in a matching state, and every process holding memory owns
/// exactly one block of its size.
pub fn check_invariants(sim: &Simulator) {
    let memory = sim.snapshot_memory();
    memory.validate().unwrap();

    let mut seen: BTreeMap<Pid, &'static str> = BTreeMap::new();
    let mut record = |p: &ProcessRecord, container: &'static str| {
        if let Some(prev) = seen.insert(p.pid(), container) {
            panic!("{} is both {} and {}", p.pid(), prev, container);
        }
    };

    let cpus = sim.snapshot_cpus();
    let mut active = Vec::new();
    for cpu in cpus.iter() {
        if let Some(running) = cpu.running.as_ref() {
            assert_eq!(running.state(), ProcessState::Running, "{}", running.pid());
            record(running, "running");
            active.push(running.clone());
        }
        for (prio, queue) in cpu.queues.iter() {
            assert!(!queue.is_empty());
            for p in queue {
                assert_eq!(p.priority(), *prio);
                assert_eq!(p.state(), ProcessState::Ready, "{}", p.pid());
                record(p, "queued");
                active.push(p.clone());
            }
        }
    }
    for p in sim.list_suspended().iter() {
        assert_eq!(p.state(), ProcessState::Suspended, "{}", p.pid());
        record(p, "suspended");
    }
    for p in sim.list_terminated().iter() {
        assert_eq!(p.state(), ProcessState::Terminated, "{}", p.pid());
        assert_eq!(p.remaining(), 0);
        record(p, "terminated");
    }

    let mut used = 0;
    for p in active.iter().filter(|p| p.memory_kb() > 0) {
        let owned: Vec<_> = memory
            .blocks
            .iter()
            .filter(|b| b.owner == Some(p.pid()))
            .collect();
        assert_eq!(owned.len(), 1, "{} owns {} blocks", p.pid(), owned.len());
        assert_eq!(owned[0].size, p.memory_kb());
        used += p.memory_kb();
    }
    assert_eq!(used, memory.used_capacity);
}
