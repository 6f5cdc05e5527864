//! Cooperative software timers.
//!
//! Nothing in the core blocks: every delayed or periodic action is a timer in
//! this pool, and everything advances only when [`Scheduler::tick`] runs.
//! Timers are identified by a caller-chosen key; a key can own at most one
//! live registration.
//!
//! Timers that fall due in the same tick fire in slot order, not in deadline
//! order. Slots are handed out lowest-index first, so in practice this is
//! registration order for a freshly started system.

mod clock;

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

pub use clock::{deadline_reached, Clock, ManualClock, MonotonicClock};

/// Longest period a wrap-safe deadline can express.
pub const MAX_DURATION_MS: u32 = i32::MAX as u32;

use crate::{config::SchedulerConfig, TimerError};

/// Identities of the timers armed by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Audio(AudioTimer),
    /// Periodic level meter publication.
    Meter,
    /// Proximity ping responder.
    Ping,
    /// Free for the embedding application.
    App(u16),
}

/// Timers owned by the audio arbiter and crossfade engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioTimer {
    FadeIn,
    Sustain,
    FadeOut,
    PcmStop,
}

impl From<AudioTimer> for TimerKey {
    fn from(value: AudioTimer) -> Self {
        TimerKey::Audio(value)
    }
}

#[derive(Debug, Clone)]
struct Timer<K> {
    key: K,
    duration_ms: u32,
    deadline: u32,
    /// 0 = infinite, 1 = last firing, N = N firings left.
    repeat: u32,
    /// Time left until the deadline, captured when paused.
    paused_remaining: Option<u32>,
}

#[derive(Debug)]
struct Slot<K> {
    timer: Option<Timer<K>>,
    generation: u32,
}

/// Fixed-capacity timer pool.
pub struct Scheduler<K = TimerKey> {
    clock: Box<dyn Clock>,
    slots: Vec<Slot<K>>,
    /// Free slot indices; popped from the back, lowest index last pushed.
    free: Vec<usize>,
    index: HashMap<K, usize>,
    min_duration_ms: u32,
    low_water: usize,
    /// Minimum already logged by [`Scheduler::report_usage`].
    reported_low_water: usize,
}

impl<K> Scheduler<K>
where
    K: Copy + Eq + Hash + Debug,
{
    pub fn new(config: &SchedulerConfig, clock: impl Clock + 'static) -> Self {
        let capacity = config.capacity;
        let slots = (0..capacity)
            .map(|_| Slot {
                timer: None,
                generation: 0,
            })
            .collect();
        Self {
            clock: Box::new(clock),
            slots,
            free: (0..capacity).rev().collect(),
            index: HashMap::with_capacity(capacity),
            min_duration_ms: config.min_duration_ms.clamp(1, MAX_DURATION_MS),
            low_water: capacity,
            reported_low_water: capacity,
        }
    }

    /// Current reading of the scheduler's clock.
    pub fn now_ms(&self) -> u32 {
        self.clock.now_ms()
    }

    /// Registers a new timer.
    ///
    /// `repeat` is 0 for an infinite periodic timer, 1 for a one-shot and N
    /// for N firings. Fails if `key` is already registered or the pool is
    /// full; the pool never grows. Durations are clamped to
    /// [`MAX_DURATION_MS`].
    pub fn create(&mut self, duration_ms: u32, repeat: u32, key: K) -> Result<(), TimerError> {
        if self.index.contains_key(&key) {
            tracing::debug!(?key, "timer creation refused: identity already registered");
            return Err(TimerError::Duplicate);
        }

        let Some(slot) = self.free.pop() else {
            tracing::warn!(?key, capacity = self.slots.len(), "no free timer slots");
            return Err(TimerError::PoolExhausted {
                capacity: self.slots.len(),
            });
        };

        let duration_ms = duration_ms.clamp(self.min_duration_ms, MAX_DURATION_MS);
        let entry = &mut self.slots[slot];
        entry.generation = entry.generation.wrapping_add(1);
        entry.timer = Some(Timer {
            key,
            duration_ms,
            deadline: self.clock.now_ms().wrapping_add(duration_ms),
            repeat,
            paused_remaining: None,
        });
        self.index.insert(key, slot);
        self.track_low_water();
        Ok(())
    }

    /// Cancels any registration of `key` and creates it afresh.
    pub fn restart(&mut self, duration_ms: u32, repeat: u32, key: K) -> Result<(), TimerError> {
        self.cancel(key);
        self.create(duration_ms, repeat, key)
    }

    /// Removes the registration of `key`. Unknown keys are ignored.
    pub fn cancel(&mut self, key: K) {
        if let Some(slot) = self.index.remove(&key) {
            self.release(slot);
        }
    }

    /// Freezes elapsed-time accrual for `key`.
    pub fn pause(&mut self, key: K) -> bool {
        let now = self.clock.now_ms();
        match self.timer_mut(key) {
            Some(timer) if timer.paused_remaining.is_none() => {
                let remaining = if deadline_reached(now, timer.deadline) {
                    0
                } else {
                    timer.deadline.wrapping_sub(now)
                };
                timer.paused_remaining = Some(remaining);
                true
            }
            _ => false,
        }
    }

    /// Resumes a paused timer with the progress it had when paused.
    pub fn resume(&mut self, key: K) -> bool {
        let now = self.clock.now_ms();
        match self.timer_mut(key) {
            Some(timer) => match timer.paused_remaining.take() {
                Some(remaining) => {
                    timer.deadline = now.wrapping_add(remaining);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    pub fn is_active(&self, key: K) -> bool {
        self.index.contains_key(&key)
    }

    pub fn is_paused(&self, key: K) -> bool {
        self.timer(key)
            .map(|timer| timer.paused_remaining.is_some())
            .unwrap_or(false)
    }

    /// Milliseconds until `key` next fires, if registered.
    pub fn remaining_ms(&self, key: K) -> Option<u32> {
        let now = self.clock.now_ms();
        self.timer(key).map(|timer| match timer.paused_remaining {
            Some(remaining) => remaining,
            None if deadline_reached(now, timer.deadline) => 0,
            None => timer.deadline.wrapping_sub(now),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn active_count(&self) -> usize {
        self.index.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Fires every due, unpaused timer once, in slot order.
    ///
    /// `fire` runs synchronously with the scheduler itself so it can cancel,
    /// create or restart timers. A timer cancelled by an earlier callback in
    /// the same scan does not fire. Returns the number of callbacks invoked.
    pub fn tick<F>(&mut self, mut fire: F) -> usize
    where
        F: FnMut(&mut Self, K),
    {
        let now = self.clock.now_ms();
        let mut fired = 0;

        for slot in 0..self.slots.len() {
            let generation = self.slots[slot].generation;
            let key = match &self.slots[slot].timer {
                Some(timer)
                    if timer.paused_remaining.is_none()
                        && deadline_reached(now, timer.deadline) =>
                {
                    timer.key
                }
                _ => continue,
            };

            fire(self, key);
            fired += 1;

            // The callback cancelled or re-armed its own identity.
            if self.slots[slot].generation != generation {
                continue;
            }
            self.reschedule(slot, now);
        }

        fired
    }

    /// Logs the free-slot count when it reached a new historical minimum
    /// since the previous report, or unconditionally when `always` is set.
    /// Returns whether a new minimum was reported.
    pub fn report_usage(&mut self, always: bool) -> bool {
        let new_minimum = self.low_water < self.reported_low_water;
        if new_minimum {
            self.reported_low_water = self.low_water;
            tracing::warn!(
                free = self.free.len(),
                min_free = self.low_water,
                capacity = self.slots.len(),
                "timer pool reached a new minimum of free slots"
            );
        } else if always {
            tracing::info!(
                free = self.free.len(),
                min_free = self.low_water,
                capacity = self.slots.len(),
                "timer pool usage"
            );
        }
        new_minimum
    }

    /// Fewest free slots seen since creation.
    pub fn low_water(&self) -> usize {
        self.low_water
    }

    /// Logs every live timer at debug level.
    pub fn dump(&self) {
        let now = self.clock.now_ms();
        for (slot, entry) in self.slots.iter().enumerate() {
            if let Some(timer) = &entry.timer {
                tracing::debug!(
                    slot,
                    key = ?timer.key,
                    duration_ms = timer.duration_ms,
                    due_in_ms = timer.deadline.wrapping_sub(now) as i32,
                    repeat = timer.repeat,
                    paused = timer.paused_remaining.is_some(),
                    "live timer"
                );
            }
        }
    }

    fn reschedule(&mut self, slot: usize, now: u32) {
        let Some(timer) = self.slots[slot].timer.as_mut() else {
            return;
        };

        match timer.repeat {
            1 => {
                let key = timer.key;
                self.index.remove(&key);
                self.release(slot);
            }
            repeat => {
                if repeat > 1 {
                    timer.repeat -= 1;
                }
                timer.deadline = timer.deadline.wrapping_add(timer.duration_ms);
                if deadline_reached(now, timer.deadline) {
                    timer.deadline = now.wrapping_add(timer.duration_ms);
                }
            }
        }
    }

    fn release(&mut self, slot: usize) {
        let entry = &mut self.slots[slot];
        entry.timer = None;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(slot);
        // Keep handing out the lowest free index first.
        self.free.sort_unstable_by(|a, b| b.cmp(a));
    }

    fn track_low_water(&mut self) {
        let free = self.free.len();
        if free < self.low_water {
            self.low_water = free;
            tracing::trace!(free, "timer pool low-water mark moved");
        }
    }

    fn timer(&self, key: K) -> Option<&Timer<K>> {
        let slot = *self.index.get(&key)?;
        self.slots[slot].timer.as_ref()
    }

    fn timer_mut(&mut self, key: K) -> Option<&mut Timer<K>> {
        let slot = *self.index.get(&key)?;
        self.slots[slot].timer.as_mut()
    }
}

impl<K: Debug> std::fmt::Debug for Scheduler<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("capacity", &self.slots.len())
            .field("free", &self.free.len())
            .field("min_duration_ms", &self.min_duration_ms)
            .finish()
    }
}
