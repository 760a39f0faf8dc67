// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The simulator front end.
//!
//! [`Simulator`] owns the dispatcher and, while started, one thread per CPU
//! plus a clock thread. The clock thread sleeps for one tick interval on a
//! channel that doubles as the stop signal, waits for every CPU to
//! acknowledge the previous tick, runs reactivation and issues the next
//! tick. CPU threads execute one unit per tick and acknowledge it.
//!
//! The same schedule can be produced without any threads through
//! [`Simulator::step`].

use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use crossbeam::channel;
use crossbeam::channel::Receiver;
use crossbeam::channel::RecvTimeoutError;
use crossbeam::channel::Sender;
use log::debug;
use log::info;
use log::warn;

use crate::clock::GlobalClock;
use crate::cpu::CpuSnapshot;
use crate::dispatcher::Admission;
use crate::dispatcher::Dispatcher;
use crate::memory::MemorySnapshot;
use crate::process::ProcessRecord;
use crate::process::ProcessRequest;
use crate::stats::SimStats;
use crate::types::lock;
use crate::types::Pid;
use crate::types::Tick;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
    pub nr_cpus: usize,
    /// Ticks a process may run before it goes back to its queue.
    pub quantum: Tick,
    /// Total memory capacity in KB.
    pub memory_kb: u64,
    /// Real time between two ticks when driven by [`Simulator::start`].
    pub tick_interval: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            nr_cpus: 3,
            quantum: 4,
            memory_kb: 1024,
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<()> {
        if self.nr_cpus == 0 {
            bail!("at least one CPU is required");
        }
        if self.quantum == 0 {
            bail!("quantum must be positive");
        }
        if self.tick_interval.is_zero() {
            bail!("tick interval must be positive");
        }
        Ok(())
    }
}

struct Running {
    stop_tx: Sender<()>,
    clock_thread: JoinHandle<()>,
    cpu_threads: Vec<JoinHandle<()>>,
}

pub struct Simulator {
    config: SimConfig,
    dispatcher: Arc<Dispatcher>,
    next_pid: Mutex<u32>,
    running: Mutex<Option<Running>>,
}

impl Simulator {
    pub fn new(config: SimConfig) -> Result<Self> {
        config.validate().context("invalid simulator configuration")?;

        let clock = Arc::new(GlobalClock::new());
        let dispatcher = Arc::new(Dispatcher::new(
            clock,
            config.nr_cpus,
            config.quantum,
            config.memory_kb,
        )?);
        info!(
            "Simulating {} CPUs, quantum {} ticks, {}KB memory",
            config.nr_cpus, config.quantum, config.memory_kb
        );

        Ok(Self {
            config,
            dispatcher,
            next_pid: Mutex::new(1),
            running: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Validate and admit a new process. Pids are handed out from 1 in
    /// submission order; a rejected submission does not use one up.
    pub fn submit(&self, priority: i64, burst: i64, memory_kb: i64) -> Result<Pid> {
        self.submit_request(ProcessRequest::new(priority, burst, memory_kb))
    }

    pub fn submit_request(&self, request: ProcessRequest) -> Result<Pid> {
        let mut next_pid = lock(&self.next_pid);
        let pid = Pid(*next_pid);
        let process = request
            .validate(pid)
            .with_context(|| format!("rejected submission {:?}", request))?;
        *next_pid += 1;

        match self.dispatcher.admit(process) {
            Admission::Queued(cpu) => info!("{} submitted to {}", pid, cpu),
            Admission::Suspended => info!("{} submitted and suspended", pid),
        }
        Ok(pid)
    }

    pub fn snapshot_cpus(&self) -> Vec<CpuSnapshot> {
        self.dispatcher.snapshot_cpus()
    }

    pub fn snapshot_memory(&self) -> MemorySnapshot {
        self.dispatcher.snapshot_memory()
    }

    pub fn list_active(&self) -> Vec<ProcessRecord> {
        self.dispatcher.list_active()
    }

    pub fn list_suspended(&self) -> Vec<ProcessRecord> {
        self.dispatcher.list_suspended()
    }

    pub fn list_terminated(&self) -> Vec<ProcessRecord> {
        self.dispatcher.list_terminated()
    }

    pub fn now(&self) -> Tick {
        self.dispatcher.clock().get()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.dispatcher.clock().is_paused()
    }

    /// True when every submitted process has terminated. Counting
    /// terminations stays exact while a stolen process is between two CPUs.
    pub fn is_drained(&self) -> bool {
        let submitted = lock(&self.next_pid).saturating_sub(1) as usize;
        self.dispatcher.nr_terminated() == submitted
    }

    /// Suspended processes that need more memory than exists in total.
    /// They can never be reactivated.
    pub fn list_unplaceable(&self) -> Vec<ProcessRecord> {
        let capacity = self.dispatcher.memory().capacity();
        self.dispatcher
            .list_suspended()
            .into_iter()
            .filter(|p| p.memory_kb() > capacity)
            .collect()
    }

    /// True when processes are left but none of them can ever run: every
    /// submitted process either terminated or can never be reactivated.
    pub fn is_stalled(&self) -> bool {
        let unplaceable = self.list_unplaceable().len();
        if unplaceable == 0 {
            return false;
        }
        let submitted = lock(&self.next_pid).saturating_sub(1) as usize;
        submitted.saturating_sub(self.dispatcher.nr_terminated()) == unplaceable
    }

    pub fn stats(&self) -> SimStats {
        SimStats::collect(&self.dispatcher)
    }

    /// Run one tick in the calling thread. Not available while the threads
    /// started by [`Simulator::start`] are driving the clock.
    pub fn step(&self) -> Result<Tick> {
        let running = lock(&self.running);
        if running.is_some() {
            bail!("cannot step while the simulator is running");
        }
        Ok(self.dispatcher.step())
    }

    /// Spawn the CPU threads and the clock thread. Starting an already
    /// running simulator is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut running = lock(&self.running);
        if running.is_some() {
            warn!("Simulator already running");
            return Ok(());
        }

        let clock = self.dispatcher.clock();
        clock.rearm();

        // Read once so that no CPU thread can miss the first tick.
        let seen = clock.get();

        let mut cpu_threads = Vec::with_capacity(self.dispatcher.nr_cpus());
        for idx in 0..self.dispatcher.nr_cpus() {
            let dispatcher = self.dispatcher.clone();
            let handle = thread::Builder::new()
                .name(format!("cpu{}", idx))
                .spawn(move || dispatcher.cpus()[idx].run(&dispatcher, seen));
            match handle {
                Ok(handle) => cpu_threads.push(handle),
                Err(e) => {
                    Self::abort_spawn(clock, cpu_threads);
                    return Err(e).context("failed to spawn CPU thread");
                }
            }
        }

        let (stop_tx, stop_rx) = channel::bounded(1);
        let dispatcher = self.dispatcher.clone();
        let interval = self.config.tick_interval;
        let clock_thread = match thread::Builder::new()
            .name("clock".into())
            .spawn(move || Self::drive_clock(&dispatcher, &stop_rx, interval))
        {
            Ok(handle) => handle,
            Err(e) => {
                Self::abort_spawn(clock, cpu_threads);
                return Err(e).context("failed to spawn clock thread");
            }
        };

        info!("Simulator started at tick {}", seen);
        *running = Some(Running {
            stop_tx,
            clock_thread,
            cpu_threads,
        });
        Ok(())
    }

    fn abort_spawn(clock: &GlobalClock, cpu_threads: Vec<JoinHandle<()>>) {
        clock.stop();
        for handle in cpu_threads {
            let _ = handle.join();
        }
    }

    /// Every blocking point returns once [`Simulator::stop`] signals the
    /// channel and stops the clock.
    fn drive_clock(dispatcher: &Dispatcher, stop_rx: &Receiver<()>, interval: Duration) {
        let clock = dispatcher.clock();
        let mut ticked = false;

        loop {
            if !clock.wait_while_paused() {
                break;
            }
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            // Paused during the sleep.
            if clock.is_paused() {
                continue;
            }

            if ticked && !clock.wait_for_acks(dispatcher.nr_cpus()) {
                break;
            }

            let nr = dispatcher.reactivate_suspended();
            let tick = match clock.try_tick() {
                Some(tick) => tick,
                None => break,
            };
            ticked = true;
            debug!("tick {} ({} reactivated)", tick, nr);
        }
        debug!("clock stopped at tick {}", clock.get());
    }

    /// Stop every thread and wait for them to exit. A unit of work in
    /// progress is finished first. Stopping a simulator that is not running
    /// is a no-op.
    pub fn stop(&self) {
        let running = match lock(&self.running).take() {
            Some(running) => running,
            None => return,
        };

        let _ = running.stop_tx.try_send(());
        drop(running.stop_tx);
        self.dispatcher.clock().stop();

        if running.clock_thread.join().is_err() {
            warn!("clock thread panicked");
        }
        for (idx, handle) in running.cpu_threads.into_iter().enumerate() {
            if handle.join().is_err() {
                warn!("cpu{} thread panicked", idx);
            }
        }
        info!("Simulator stopped at tick {}", self.now());
    }

    /// Hold the clock. Already issued ticks still complete.
    pub fn pause(&self) {
        self.dispatcher.clock().pause();
        info!("Simulator paused at tick {}", self.now());
    }

    pub fn resume(&self) {
        self.dispatcher.clock().resume();
        info!("Simulator resumed at tick {}", self.now());
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.stop();
    }
}
