// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The global clock.
//!
//! A single tick counter doubles as a generation number: a worker remembers
//! the last tick it executed and waits until the counter moves past it, so a
//! broadcast that happens before the worker starts waiting is never lost.
//! Workers acknowledge every tick, which lets the clock thread hold the next
//! tick back until every CPU has executed its unit for the current one.
//!
//! The clock is an ordinary value shared through an `Arc`. Nothing about it
//! is process-global, so independent simulations and tests each get their
//! own.

use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::types::lock;
use crate::types::Tick;

#[derive(Debug, Default)]
struct ClockState {
    now: Tick,
    acked: usize,
    paused: bool,
    stopped: bool,
}

#[derive(Debug, Default)]
pub struct GlobalClock {
    state: Mutex<ClockState>,
    // Signalled on every tick, on resume and on stop.
    tick_cv: Condvar,
    // Signalled on every acknowledgement and on stop.
    ack_cv: Condvar,
}

impl GlobalClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn wait<'a>(
        cv: &Condvar,
        guard: MutexGuard<'a, ClockState>,
    ) -> MutexGuard<'a, ClockState> {
        cv.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    /// Current tick, without advancing.
    pub fn get(&self) -> Tick {
        lock(&self.state).now
    }

    /// Advance by one tick and wake every waiting worker. Returns the new
    /// tick.
    pub fn tick(&self) -> Tick {
        let mut state = lock(&self.state);
        let now = Self::advance(&mut state);
        drop(state);

        self.tick_cv.notify_all();
        now
    }

    /// Like [`GlobalClock::tick`], but does nothing once the clock has been
    /// stopped. Workers leave as soon as they see the stop, so a tick issued
    /// after it would never be executed.
    pub fn try_tick(&self) -> Option<Tick> {
        let mut state = lock(&self.state);
        if state.stopped {
            return None;
        }
        let now = Self::advance(&mut state);
        drop(state);

        self.tick_cv.notify_all();
        Some(now)
    }

    fn advance(state: &mut ClockState) -> Tick {
        state.now += 1;
        state.acked = 0;
        state.now
    }

    /// Block until the clock moves past `seen`. Returns the new tick, or
    /// `None` once the clock has been stopped. A tick issued before the stop
    /// is still handed out, so every worker executes every issued tick.
    pub fn wait_for_tick(&self, seen: Tick) -> Option<Tick> {
        let mut state = lock(&self.state);
        loop {
            if state.now > seen {
                return Some(state.now);
            }
            if state.stopped {
                return None;
            }
            state = Self::wait(&self.tick_cv, state);
        }
    }

    /// Report that the caller finished its unit for the current tick.
    pub fn ack(&self) {
        lock(&self.state).acked += 1;
        self.ack_cv.notify_all();
    }

    /// Block until `nr_workers` acknowledgements arrived for the current
    /// tick. Returns false if the clock was stopped while waiting.
    pub fn wait_for_acks(&self, nr_workers: usize) -> bool {
        let mut state = lock(&self.state);
        loop {
            if state.stopped {
                return false;
            }
            if state.acked >= nr_workers {
                return true;
            }
            state = Self::wait(&self.ack_cv, state);
        }
    }

    pub fn pause(&self) {
        lock(&self.state).paused = true;
    }

    pub fn resume(&self) {
        lock(&self.state).paused = false;
        self.tick_cv.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.state).paused
    }

    /// Block while the clock is paused. Returns false if it was stopped.
    pub fn wait_while_paused(&self) -> bool {
        let mut state = lock(&self.state);
        loop {
            if state.stopped {
                return false;
            }
            if !state.paused {
                return true;
            }
            state = Self::wait(&self.tick_cv, state);
        }
    }

    /// Wake everyone blocked on the clock and make all further waits return
    /// immediately.
    pub fn stop(&self) {
        lock(&self.state).stopped = true;
        self.tick_cv.notify_all();
        self.ack_cv.notify_all();
    }

    /// Undo `stop()` so the clock can drive another run. The tick counter
    /// is left alone.
    pub fn rearm(&self) {
        let mut state = lock(&self.state);
        state.stopped = false;
        state.acked = 0;
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.state).stopped
    }

    /// Back to tick 0. Only meaningful between runs.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        state.now = 0;
        state.acked = 0;
    }
}
