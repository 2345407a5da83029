//! One-shot and periodic alarms with virtual-time polling
//!
//! Stores values to be yielded at points in the future. Time is expressed as
//! `Instant`s supplied by the caller, so the queue is fully deterministic
//! under test. Timers are identified by a [`TimerToken`]; restarting a
//! running timer reschedules it, and stopping one is idempotent. The heap
//! holds stale entries after a reset or stop; each entry carries the
//! generation it was scheduled under and is discarded on mismatch.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use slab::Slab;

/// Identifies a timer for restart, stop, and removal
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TimerToken(usize);

#[derive(Debug)]
struct TimerState<T> {
    expiry: Instant,
    period: Option<Duration>,
    generation: u64,
    armed: bool,
    value: T,
}

/// A collection of pending timers ordered by expiry time
#[derive(Debug)]
pub struct TimerQueue<T> {
    timers: Slab<TimerState<T>>,
    heap: BinaryHeap<Reverse<(Instant, usize, u64)>>,
    /// Monotonic across the whole queue, so a slot reused after `remove`
    /// can never match a stale heap entry
    generation: u64,
}

impl<T: Clone> TimerQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            timers: Slab::new(),
            heap: BinaryHeap::new(),
            generation: 0,
        }
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Register a timer yielding `value` at `expiry`
    ///
    /// With a `period`, the timer re-arms itself one period after each
    /// expiry until stopped; otherwise it disarms after firing once.
    pub fn insert(&mut self, value: T, expiry: Instant, period: Option<Duration>) -> TimerToken {
        let generation = self.next_generation();
        let key = self.timers.insert(TimerState {
            expiry,
            period,
            generation,
            armed: true,
            value,
        });
        self.heap.push(Reverse((expiry, key, generation)));
        TimerToken(key)
    }

    /// Restart `token` to fire at `expiry`, whether or not it was running
    pub fn reset(&mut self, token: TimerToken, expiry: Instant) {
        let generation = self.next_generation();
        let Some(state) = self.timers.get_mut(token.0) else {
            return;
        };
        state.generation = generation;
        state.expiry = expiry;
        state.armed = true;
        self.heap.push(Reverse((expiry, token.0, generation)));
    }

    /// Disarm `token` without forgetting it; a no-op if already stopped
    pub fn stop(&mut self, token: TimerToken) {
        let generation = self.next_generation();
        if let Some(state) = self.timers.get_mut(token.0) {
            state.generation = generation;
            state.armed = false;
        }
    }

    /// Forget `token` entirely; a no-op if already removed
    pub fn remove(&mut self, token: TimerToken) {
        if self.timers.contains(token.0) {
            self.timers.remove(token.0);
        }
    }

    /// The earliest pending expiry, if any timer is armed
    pub fn next_timeout(&mut self) -> Option<Instant> {
        self.prune();
        self.heap.peek().map(|Reverse((expiry, _, _))| *expiry)
    }

    /// Yield the value of a timer that has expired by `now`, if any
    ///
    /// Call repeatedly to drain everything due. Periodic timers re-arm at
    /// `expiry + period` before their value is returned.
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        loop {
            let Reverse((expiry, key, generation)) = *self.heap.peek()?;
            if expiry > now {
                return None;
            }
            self.heap.pop();
            let Some(state) = self.timers.get_mut(key) else {
                continue;
            };
            if !state.armed || state.generation != generation {
                continue;
            }
            match state.period {
                Some(period) => {
                    self.generation += 1;
                    state.generation = self.generation;
                    state.expiry = expiry + period;
                    self.heap.push(Reverse((state.expiry, key, state.generation)));
                    return Some(state.value.clone());
                }
                None => {
                    state.armed = false;
                    return Some(state.value.clone());
                }
            }
        }
    }

    /// Drop stale heap entries so `next_timeout` reflects live timers
    fn prune(&mut self) {
        while let Some(&Reverse((_, key, generation))) = self.heap.peek() {
            let live = self
                .timers
                .get(key)
                .map_or(false, |s| s.armed && s.generation == generation);
            if live {
                return;
            }
            self.heap.pop();
        }
    }
}

impl<T: Clone> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
