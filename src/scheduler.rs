//! Cycle-driven event scheduler.
//!
//! Peripherals book callbacks a number of CPU cycles ahead. Events are
//! delivered in (target cycle, insertion) order once the processor's cycle
//! counter reaches their target, each with the overshoot past the target.

use crate::types::DeviceId;
use log::trace;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledEvent {
    pub owner: DeviceId,
    pub time: u64,
    pub parameter: i64,
}

/// An event taken off the queue, ready for delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueEvent {
    pub owner: DeviceId,
    pub parameter: i64,
    pub delay: u64, // Cycles elapsed since the target cycle
}

#[derive(Debug, Default)]
pub struct Scheduler {
    events: BTreeMap<(u64, u64), ScheduledEvent>,
    sequence: u64,
    now: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler::default()
    }

    /// Cycle counter value last seen by the scheduler
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Move the scheduler's notion of the current cycle forward
    pub fn advance_to(&mut self, now: u64) {
        if now > self.now {
            self.now = now;
        }
    }

    /// Book an event `delay` cycles after the current cycle
    pub fn schedule_relative(&mut self, owner: DeviceId, delay: u64, parameter: i64) -> u64 {
        let time = self.now.saturating_add(delay);
        self.schedule_absolute(owner, time, parameter);
        time
    }

    pub fn schedule_absolute(&mut self, owner: DeviceId, time: u64, parameter: i64) {
        let key = (time, self.sequence);
        self.sequence += 1;
        trace!("scheduling event for {} at cycle {}", owner, time);
        self.events.insert(
            key,
            ScheduledEvent {
                owner,
                time,
                parameter,
            },
        );
    }

    /// Drop every pending event of `owner`; returns how many were removed
    pub fn cancel_all(&mut self, owner: DeviceId) -> usize {
        let before = self.events.len();
        self.events.retain(|_, event| event.owner != owner);
        before - self.events.len()
    }

    /// Cycles left until the earliest event of `owner`
    pub fn remaining_time(&self, owner: DeviceId) -> Option<u64> {
        self.events
            .values()
            .find(|event| event.owner == owner)
            .map(|event| event.time.saturating_sub(self.now))
    }

    /// Take the first event due at or before `now`
    pub fn pop_due(&mut self, now: u64) -> Option<DueEvent> {
        let (&key, event) = self.events.iter().next()?;
        if event.time > now {
            return None;
        }
        let event = *event;
        self.events.remove(&key);
        Some(DueEvent {
            owner: event.owner,
            parameter: event.parameter,
            delay: now - event.time,
        })
    }

    pub fn next_time(&self) -> Option<u64> {
        self.events.values().next().map(|event| event.time)
    }

    pub fn pending(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> impl Iterator<Item = &ScheduledEvent> {
        self.events.values()
    }
}
