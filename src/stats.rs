// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::Write;

use anyhow::Result;

use crate::dispatcher::Dispatcher;
use crate::process::ProcessRecord;
use crate::types::CpuId;
use crate::types::Pid;
use crate::types::Priority;
use crate::types::Tick;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessStats {
    pub pid: Pid,
    pub priority: Priority,
    pub burst: Tick,
    pub memory_kb: u64,
    pub arrival: Tick,
    pub start: Tick,
    pub finish: Tick,
    pub response: Tick,
    pub waiting: Tick,
    pub turnaround: Tick,
}

impl ProcessStats {
    /// None unless `process` ran to completion.
    pub fn from_record(process: &ProcessRecord) -> Option<Self> {
        Some(Self {
            pid: process.pid(),
            priority: process.priority(),
            burst: process.burst(),
            memory_kb: process.memory_kb(),
            arrival: process.arrival(),
            start: process.start()?,
            finish: process.finish()?,
            response: process.response_time()?,
            waiting: process.waiting_time()?,
            turnaround: process.turnaround_time()?,
        })
    }

    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "  {:>5} prio={:<3} burst={:<5} mem={:>6}KB arr={:<5} start={:<5} fin={:<5} \
             resp={:<5} wait={:<5} tat={:<5}",
            self.pid.to_string(),
            self.priority,
            self.burst,
            self.memory_kb,
            self.arrival,
            self.start,
            self.finish,
            self.response,
            self.waiting,
            self.turnaround,
        )?;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CpuStats {
    pub cpu: CpuId,
    pub ticks_worked: u64,
    pub ticks_total: u64,
    /// Percent.
    pub utilization: f64,
}

impl CpuStats {
    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "  {:>5} util={:6.2}% worked={:<6} total={:<6}",
            self.cpu.to_string(),
            self.utilization,
            self.ticks_worked,
            self.ticks_total
        )?;
        Ok(())
    }
}

fn average(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, nr) = values.fold((0.0, 0usize), |(sum, nr), v| (sum + v, nr + 1));
    match nr {
        0 => 0.0,
        nr => sum / nr as f64,
    }
}

/// End-of-run report: per-process timings for everything that terminated
/// and per-CPU utilization.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SimStats {
    pub now: Tick,
    pub processes: Vec<ProcessStats>,
    pub cpus: Vec<CpuStats>,
    pub nr_active: usize,
    pub nr_suspended: usize,
}

impl SimStats {
    pub fn collect(dispatcher: &Dispatcher) -> Self {
        let mut processes: Vec<ProcessStats> = dispatcher
            .list_terminated()
            .iter()
            .filter_map(ProcessStats::from_record)
            .collect();
        processes.sort_by_key(|p| p.pid);

        let cpus = dispatcher
            .snapshot_cpus()
            .iter()
            .map(|snap| CpuStats {
                cpu: snap.cpu,
                ticks_worked: snap.ticks_worked,
                ticks_total: snap.ticks_total,
                utilization: snap.utilization(),
            })
            .collect();

        Self {
            now: dispatcher.clock().get(),
            processes,
            cpus,
            nr_active: dispatcher.list_active().len(),
            nr_suspended: dispatcher.list_suspended().len(),
        }
    }

    /// Mean CPU utilization in percent, every CPU weighted equally.
    pub fn avg_utilization(&self) -> f64 {
        average(self.cpus.iter().map(|cpu| cpu.utilization))
    }

    pub fn avg_response(&self) -> f64 {
        average(self.processes.iter().map(|p| p.response as f64))
    }

    pub fn avg_waiting(&self) -> f64 {
        average(self.processes.iter().map(|p| p.waiting as f64))
    }

    pub fn avg_turnaround(&self) -> f64 {
        average(self.processes.iter().map(|p| p.turnaround as f64))
    }

    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "tick={} terminated={} active={} suspended={}",
            self.now,
            self.processes.len(),
            self.nr_active,
            self.nr_suspended
        )?;

        writeln!(w, "processes:")?;
        for process in self.processes.iter() {
            process.format(w)?;
        }
        writeln!(
            w,
            "  avg resp={:.2} wait={:.2} tat={:.2}",
            self.avg_response(),
            self.avg_waiting(),
            self.avg_turnaround()
        )?;

        writeln!(w, "cpus:")?;
        for cpu in self.cpus.iter() {
            cpu.format(w)?;
        }
        writeln!(w, "  avg util={:6.2}%", self.avg_utilization())?;
        Ok(())
    }
}
