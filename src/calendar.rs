//! Calendar
//!
//! Owns the logical clock, the queue of triggered events and the
//! active-process slot. Entries are ordered by `(time, priority, seq)`
//! where `seq` is assigned here at scheduling time, so equal
//! `(time, priority)` entries fire in submission order.

use crate::event::Event;
use crate::pq::{Key, MinPq};
use crate::process::Process;

/// The simulation calendar.
pub struct Calendar {
    now: f64,

    /// Deterministic sequence counter.
    seq: u64,

    queue: MinPq<Event>,

    /// Process currently being resumed.
    active: Option<Process>,
}

impl Calendar {
    pub fn new(start_time: f64) -> Self {
        Self {
            now: start_time,
            seq: 0,
            queue: MinPq::new(),
            active: None,
        }
    }

    /// Current logical time.
    pub fn now(&self) -> f64 {
        self.now
    }

    fn alloc_seq(&mut self) -> u64 {
        let s = self.seq;
        self.seq += 1;
        s
    }

    /// Insert `event` at the current time.
    pub fn schedule(&mut self, event: Event, priority: i32) -> Key {
        let now = self.now;
        self.schedule_at(event, now, priority)
    }

    /// Insert `event` at `time`. Times in the past are clamped to now.
    pub fn schedule_at(&mut self, event: Event, time: f64, priority: i32) -> Key {
        let time = if time >= self.now { time } else { self.now };
        let key = Key {
            time,
            priority,
            seq: self.alloc_seq(),
        };
        self.queue.push(key, event);
        key
    }

    /// Time of the earliest entry.
    pub fn peek_time(&self) -> Option<f64> {
        self.queue.peek_key().map(|k| k.time)
    }

    /// Pop the earliest entry and advance the clock to it.
    pub fn pop(&mut self) -> Option<(Key, Event)> {
        let (key, event) = self.queue.pop()?;
        self.now = key.time;
        Some((key, event))
    }

    /// Move the clock forward without dispatching anything.
    pub fn advance_to(&mut self, time: f64) {
        if time > self.now {
            self.now = time;
        }
    }

    pub fn active(&self) -> Option<&Process> {
        self.active.as_ref()
    }

    /// Replace the active process, returning the previous one.
    pub fn set_active(&mut self, process: Option<Process>) -> Option<Process> {
        std::mem::replace(&mut self.active, process)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::Simulation;

    #[test]
    fn test_fifo_at_same_time_and_priority() {
        let sim = Simulation::new();
        let mut cal = Calendar::new(0.0);

        let a = sim.event();
        let b = sim.event();
        let c = sim.event();
        cal.schedule(a.clone(), 0);
        cal.schedule(b.clone(), 0);
        cal.schedule(c.clone(), 0);

        assert_eq!(cal.pop().map(|(_, e)| e), Some(a));
        assert_eq!(cal.pop().map(|(_, e)| e), Some(b));
        assert_eq!(cal.pop().map(|(_, e)| e), Some(c));
        assert!(cal.pop().is_none());
    }

    #[test]
    fn test_pop_advances_clock() {
        let sim = Simulation::new();
        let mut cal = Calendar::new(10.0);

        cal.schedule_at(sim.event(), 15.0, 0);
        cal.schedule_at(sim.event(), 12.0, 5);
        assert_eq!(cal.peek_time(), Some(12.0));

        let (key, _) = cal.pop().unwrap();
        assert_eq!(key.priority, 5);
        assert_eq!(cal.now(), 12.0);

        cal.pop().unwrap();
        assert_eq!(cal.now(), 15.0);
        assert!(cal.is_empty());
    }

    #[test]
    fn test_past_times_are_clamped() {
        let sim = Simulation::new();
        let mut cal = Calendar::new(5.0);
        let key = cal.schedule_at(sim.event(), 1.0, 0);
        assert_eq!(key.time, 5.0);
    }

    #[test]
    fn test_advance_never_goes_back() {
        let mut cal = Calendar::new(5.0);
        cal.advance_to(3.0);
        assert_eq!(cal.now(), 5.0);
        cal.advance_to(8.0);
        assert_eq!(cal.now(), 8.0);
    }
}
