// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # scx_mpsim
//!
//! A tick-driven simulator of a small multiprocessor: N CPUs, each running
//! a priority round robin scheduler, share a fixed pool of memory handed out
//! in contiguous blocks. Processes that do not fit in memory are suspended
//! until a block frees up, and idle CPUs steal work from busy ones.
//!
//! [`Simulator`] is the entry point. It can be driven by its own threads on
//! a real-time interval with [`Simulator::start`], or one tick at a time
//! with [`Simulator::step`], which produces exactly the same schedule and is
//! what the tests use.

pub mod clock;
pub mod cpu;
pub mod dispatcher;
pub mod engine;
pub mod memory;
pub mod process;
pub mod rr;
pub mod stats;
pub mod types;

pub use clock::GlobalClock;
pub use cpu::CpuSnapshot;
pub use dispatcher::Admission;
pub use engine::SimConfig;
pub use engine::Simulator;
pub use memory::parse_mem_kb;
pub use memory::MemoryBlock;
pub use memory::MemorySnapshot;
pub use process::ProcessRecord;
pub use process::ProcessRequest;
pub use process::ProcessState;
pub use stats::SimStats;
pub use types::CpuId;
pub use types::Pid;
pub use types::Priority;
pub use types::Tick;
