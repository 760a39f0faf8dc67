// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Runs on the real-time clock with CPU threads.

use std::thread;
use std::time::Duration;

use scx_mpsim::*;

mod common;

const TIMEOUT: Duration = Duration::from_secs(10);

#[test]
fn test_threaded_run_drains() {
    let sim = common::threaded_sim(3, 3, 512);
    let workload = [(0, 5, 128), (2, 3, 256), (1, 8, 0), (0, 2, 512), (3, 4, 64)];
    for (prio, burst, mem) in workload {
        sim.submit(prio, burst, mem).unwrap();
    }

    sim.start().unwrap();
    assert!(sim.is_running());
    assert!(common::wait_until(TIMEOUT, || sim.is_drained()));
    sim.stop();
    assert!(!sim.is_running());
    common::check_invariants(&sim);

    let now = sim.now();
    let cpus = sim.snapshot_cpus();
    // Every CPU executed every tick that was issued, exactly once.
    for cpu in cpus.iter() {
        assert_eq!(cpu.ticks_total, now, "{}", cpu.cpu);
    }
    let worked: u64 = cpus.iter().map(|cpu| cpu.ticks_worked).sum();
    let burst: u64 = workload.iter().map(|(_, burst, _)| *burst as u64).sum();
    assert_eq!(worked, burst);
    assert_eq!(sim.list_terminated().len(), workload.len());
    assert_eq!(sim.snapshot_memory().used_capacity, 0);
}

#[test]
fn test_submit_while_running() {
    let sim = common::threaded_sim(2, 4, 1024);
    sim.start().unwrap();
    assert!(common::wait_until(TIMEOUT, || sim.now() >= 2));

    let pid = sim.submit(1, 3, 100).unwrap();
    assert_eq!(pid, Pid(1));
    assert!(common::wait_until(TIMEOUT, || sim.list_terminated().len() == 1));
    sim.stop();

    let p1 = &sim.list_terminated()[0];
    assert!(p1.arrival() >= 2);
    assert!(p1.start().unwrap() >= p1.arrival());
    assert_eq!(p1.turnaround_time(), Some(p1.finish().unwrap() - p1.arrival()));
}

#[test]
fn test_pause_holds_the_clock() {
    let sim = common::threaded_sim(2, 4, 1024);
    sim.submit(0, 1000, 0).unwrap();
    sim.start().unwrap();
    assert!(common::wait_until(TIMEOUT, || sim.now() >= 3));

    sim.pause();
    assert!(sim.is_paused());
    // A tick already in flight when pausing may still land.
    thread::sleep(Duration::from_millis(30));
    let held = sim.now();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(sim.now(), held);

    sim.resume();
    assert!(!sim.is_paused());
    assert!(common::wait_until(TIMEOUT, || sim.now() > held + 2));
    sim.stop();
    common::check_invariants(&sim);
}

#[test]
fn test_stop_while_paused() {
    let sim = common::threaded_sim(2, 4, 1024);
    sim.start().unwrap();
    sim.pause();
    sim.stop();
    assert!(!sim.is_running());
}

#[test]
fn test_restart_after_stop() {
    let sim = common::threaded_sim(2, 2, 1024);
    sim.submit(0, 40, 0).unwrap();
    sim.submit(1, 40, 0).unwrap();

    sim.start().unwrap();
    assert!(common::wait_until(TIMEOUT, || sim.now() >= 5));
    sim.stop();
    let stopped_at = sim.now();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(sim.now(), stopped_at);

    // Stepping in between keeps the same schedule going.
    sim.step().unwrap();
    assert_eq!(sim.now(), stopped_at + 1);

    sim.start().unwrap();
    assert!(common::wait_until(TIMEOUT, || sim.is_drained()));
    sim.stop();

    let now = sim.now();
    for cpu in sim.snapshot_cpus() {
        assert_eq!(cpu.ticks_total, now);
    }
    assert_eq!(sim.list_terminated().len(), 2);
}

#[test]
fn test_drop_stops_threads() {
    let sim = common::threaded_sim(4, 4, 1024);
    sim.submit(0, 100, 0).unwrap();
    sim.start().unwrap();
    assert!(common::wait_until(TIMEOUT, || sim.now() >= 1));
    drop(sim);
}

#[test]
fn test_repeated_start_stop_under_load() {
    let sim = common::threaded_sim(4, 2, 1024);
    for _ in 0..8 {
        sim.submit(0, 50, 0).unwrap();
    }

    // Stops land at every point of the tick cycle: sleeping, waiting for
    // acks and right after issuing a tick.
    for round in 0..20u64 {
        sim.start().unwrap();
        let before = sim.now();
        assert!(common::wait_until(TIMEOUT, || sim.now() > before));
        thread::sleep(Duration::from_micros(round * 150));
        sim.stop();
        assert!(!sim.is_running());

        let now = sim.now();
        for cpu in sim.snapshot_cpus() {
            assert_eq!(cpu.ticks_total, now, "{} round {}", cpu.cpu, round);
        }
    }
    common::check_invariants(&sim);
}
