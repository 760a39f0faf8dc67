// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::BufRead;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use crossbeam::channel;
use crossbeam::channel::Receiver;
use crossbeam::channel::RecvTimeoutError;
use log::info;
use log::warn;
use metrics_exporter_prometheus::PrometheusBuilder;

use scx_mpsim::parse_mem_kb;
use scx_mpsim::ProcessRequest;
use scx_mpsim::SimConfig;
use scx_mpsim::Simulator;
use scx_mpsim::Tick;

/// scx_mpsim: a multiprocessor scheduling simulator.
///
/// Each simulated CPU runs a priority round robin: one FIFO queue per
/// priority level, lower values first, with a fixed quantum. Processes are
/// placed on the least loaded CPU and need a contiguous block of memory,
/// handed out best-fit. A process that does not fit is suspended until
/// memory frees up. Idle CPUs steal the least urgent queued process from the
/// busiest CPU.
///
/// Processes are given on the command line as PRIO:BURST[:MEM], e.g.
/// `-p 1:10 -p 2:6:512kb`, or typed at runtime with --interactive as
/// `add PRIO BURST [MEM]`.
#[derive(Debug, Parser)]
struct Opts {
    /// Number of simulated CPUs.
    #[clap(short = 'c', long, default_value = "3")]
    cpus: usize,

    /// Round robin quantum, in ticks.
    #[clap(short = 'q', long, default_value = "4")]
    quantum: Tick,

    /// Memory capacity. A bare number is KB; `kb` and `mb` suffixes are
    /// accepted.
    #[clap(short = 'm', long, default_value = "1024", value_parser = parse_mem_kb)]
    memory: u64,

    /// Real time between two ticks, in seconds.
    #[clap(short = 'i', long, default_value = "1.0")]
    interval: f64,

    /// Process to submit at startup, as PRIO:BURST[:MEM]. Can be repeated.
    #[clap(short = 'p', long = "process")]
    processes: Vec<ProcessRequest>,

    /// Stop after this many ticks even if work is left.
    #[clap(short = 't', long)]
    max_ticks: Option<Tick>,

    /// Run the ticks back to back in the main thread instead of on the
    /// real-time clock. The schedule is the same.
    #[clap(short = 's', long, action = clap::ArgAction::SetTrue)]
    step: bool,

    /// Read `add PRIO BURST [MEM]` commands from stdin while running. An
    /// empty line ends the simulation.
    #[clap(short = 'I', long, action = clap::ArgAction::SetTrue, conflicts_with = "step")]
    interactive: bool,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable the Prometheus endpoint for metrics on port 9000.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    enable_prometheus: bool,
}

impl Opts {
    fn config(&self) -> Result<SimConfig> {
        if !self.interval.is_finite() || self.interval <= 0.0 {
            bail!("interval must be positive, got {}", self.interval);
        }
        Ok(SimConfig {
            nr_cpus: self.cpus,
            quantum: self.quantum,
            memory_kb: self.memory,
            tick_interval: Duration::try_from_secs_f64(self.interval)
                .with_context(|| format!("interval {} out of range", self.interval))?,
        })
    }
}

enum Command {
    Add(ProcessRequest),
    Quit,
}

fn parse_command(line: &str) -> Result<Command> {
    let mut words = line.split_whitespace();
    match words.next() {
        None => Ok(Command::Quit),
        Some(cmd) if cmd.eq_ignore_ascii_case("add") => {
            let fields: Vec<&str> = words.collect();
            let request = fields
                .join(":")
                .parse::<ProcessRequest>()
                .context("usage: add PRIO BURST [MEM]")?;
            Ok(Command::Add(request))
        }
        Some(cmd) => bail!("unknown command {:?}, use 'add' or an empty line", cmd),
    }
}

fn spawn_stdin_reader() -> Result<Receiver<String>> {
    let (tx, rx) = channel::unbounded();
    thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Failed to read stdin: {}", e);
                        break;
                    }
                }
            }
        })
        .context("failed to spawn stdin reader")?;
    Ok(rx)
}

fn finished(sim: &Simulator, opts: &Opts) -> bool {
    if let Some(max) = opts.max_ticks {
        if sim.now() >= max {
            return true;
        }
    }
    if opts.interactive {
        return false;
    }
    if sim.is_stalled() {
        for process in sim.list_unplaceable() {
            warn!(
                "{} needs {}KB but only {}KB exist, it can never run",
                process.pid(),
                process.memory_kb(),
                sim.config().memory_kb
            );
        }
        return true;
    }
    sim.is_drained()
}

fn run_stepped(sim: &Simulator, opts: &Opts, shutdown: &AtomicBool) -> Result<()> {
    while !shutdown.load(Ordering::Relaxed) && !finished(sim, opts) {
        sim.step()?;
    }
    Ok(())
}

fn run_threaded(sim: &Simulator, opts: &Opts, shutdown: &AtomicBool) -> Result<()> {
    let commands = if opts.interactive {
        Some(spawn_stdin_reader()?)
    } else {
        None
    };
    let poll = Duration::from_millis(100);

    sim.start()?;
    while !shutdown.load(Ordering::Relaxed) && !finished(sim, opts) {
        let commands = match commands.as_ref() {
            Some(commands) => commands,
            None => {
                thread::sleep(poll);
                continue;
            }
        };

        let line = match commands.recv_timeout(poll) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match parse_command(&line) {
            Ok(Command::Add(request)) => match sim.submit_request(request) {
                Ok(pid) => println!("{} added at tick {}", pid, sim.now()),
                Err(e) => println!("{:#}", e),
            },
            Ok(Command::Quit) => break,
            Err(e) => println!("{:#}", e),
        }
    }
    sim.stop();
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    if opts.enable_prometheus {
        info!("Enabling Prometheus endpoint: http://localhost:9000");
        PrometheusBuilder::new()
            .install()
            .context("failed to install Prometheus recorder")?;
    }

    let sim = Simulator::new(opts.config()?)?;
    for request in opts.processes.iter() {
        sim.submit_request(*request)?;
    }

    if opts.step {
        run_stepped(&sim, &opts, &shutdown)?;
    } else {
        run_threaded(&sim, &opts, &shutdown)?;
    }

    sim.stats().format(&mut std::io::stdout())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        match parse_command("add 1 10 2mb").unwrap() {
            Command::Add(request) => assert_eq!(request, ProcessRequest::new(1, 10, 2048)),
            Command::Quit => panic!("expected add"),
        }
        match parse_command("  ADD 0 3 ").unwrap() {
            Command::Add(request) => assert_eq!(request, ProcessRequest::new(0, 3, 0)),
            Command::Quit => panic!("expected add"),
        }
        assert!(matches!(parse_command("   ").unwrap(), Command::Quit));
        assert!(parse_command("add 1").is_err());
        assert!(parse_command("add x 3").is_err());
        assert!(parse_command("kill 3").is_err());
    }

    #[test]
    fn test_opts() {
        let opts = Opts::parse_from(["scx_mpsim", "-c", "2", "-m", "4mb", "-p", "1:10", "-p", "2:6:512"]);
        assert_eq!(opts.cpus, 2);
        assert_eq!(opts.memory, 4096);
        assert_eq!(
            opts.processes,
            vec![ProcessRequest::new(1, 10, 0), ProcessRequest::new(2, 6, 512)]
        );
        assert_eq!(opts.config().unwrap().tick_interval, Duration::from_secs(1));

        let opts = Opts::parse_from(["scx_mpsim", "-i", "0"]);
        assert!(opts.config().is_err());
        let opts = Opts::parse_from(["scx_mpsim", "-i", "1e30"]);
        assert!(opts.config().is_err());
        let opts = Opts::parse_from(["scx_mpsim", "-i", "0.25"]);
        assert_eq!(opts.config().unwrap().tick_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_stepped_run_ends_when_nothing_fits() {
        let opts = Opts::parse_from(["scx_mpsim", "--step", "-p", "0:3:2mb", "-p", "1:2"]);
        let sim = Simulator::new(opts.config().unwrap()).unwrap();
        for request in opts.processes.iter() {
            sim.submit_request(*request).unwrap();
        }

        run_stepped(&sim, &opts, &AtomicBool::new(false)).unwrap();
        assert_eq!(sim.now(), 2);
        assert!(!sim.is_drained());
        assert_eq!(sim.list_terminated().len(), 1);
        assert_eq!(sim.list_suspended().len(), 1);
    }
}
