//! Events
//!
//! An event is an outcome cell with a callback list. It is the only thing a
//! process can wait on and the only thing the calendar schedules.
//!
//! Lifecycle: idle -> triggered (outcome decided, entry in the calendar)
//! -> processed (callbacks ran once and were cleared). The outcome never
//! changes after it is triggered.

use crate::error::{SimError, SimResult};
use crate::process::Process;
use crate::simulation::{SimShared, Simulation};
use crate::value::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

/// Default scheduling priority. Smaller values are dispatched first.
pub const DEFAULT_PRIORITY: i32 = 0;

/// Token returned by [`Event::add_callback`], used to unregister it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Something to run when an event is processed.
pub(crate) enum Callback {
    Action(Box<dyn FnOnce(&Event)>),
    /// Resume a suspended process. Compared by process identity.
    Resume(Process),
}

struct Registration {
    id: CallbackId,
    callback: Callback,
}

pub(crate) struct EventInner {
    id: u64,
    value: Value,
    ok: bool,
    triggered: bool,
    processed: bool,
    callbacks: Vec<Registration>,
    next_callback: u64,
    sim: Weak<SimShared>,
}

/// A shared handle to an event.
#[derive(Clone)]
pub struct Event(Rc<RefCell<EventInner>>);

impl Event {
    /// Create an idle event in `sim`.
    pub fn new(sim: &Simulation) -> Self {
        Event(Rc::new(RefCell::new(EventInner {
            id: sim.next_id(),
            value: Value::none(),
            ok: true,
            triggered: false,
            processed: false,
            callbacks: Vec::new(),
            next_callback: 0,
            sim: Rc::downgrade(&sim.shared),
        })))
    }

    /// An event with no simulation behind it. It can never be triggered.
    pub(crate) fn detached() -> Self {
        Event(Rc::new(RefCell::new(EventInner {
            id: u64::MAX,
            value: Value::none(),
            ok: true,
            triggered: false,
            processed: false,
            callbacks: Vec::new(),
            next_callback: 0,
            sim: Weak::new(),
        })))
    }

    /// Create an event whose outcome is already decided. The caller is
    /// responsible for putting it into the calendar.
    pub(crate) fn triggered(sim: &Simulation, ok: bool, value: Value) -> Self {
        let event = Event::new(sim);
        {
            let mut inner = event.0.borrow_mut();
            inner.ok = ok;
            inner.value = value;
            inner.triggered = true;
        }
        event
    }

    pub fn id(&self) -> u64 {
        self.0.borrow().id
    }

    pub fn value(&self) -> Value {
        self.0.borrow().value.clone()
    }

    pub fn is_ok(&self) -> bool {
        self.0.borrow().ok
    }

    pub fn is_triggered(&self) -> bool {
        self.0.borrow().triggered
    }

    pub fn is_processed(&self) -> bool {
        self.0.borrow().processed
    }

    /// Number of callbacks still waiting for this event.
    pub fn callback_count(&self) -> usize {
        self.0.borrow().callbacks.len()
    }

    /// The simulation this event belongs to.
    pub fn simulation(&self) -> SimResult<Simulation> {
        let inner = self.0.borrow();
        inner
            .sim
            .upgrade()
            .map(|shared| Simulation { shared })
            .ok_or(SimError::Detached { event: inner.id })
    }

    /// Resolve successfully at the current time with default priority.
    pub fn succeed(&self, value: Value) -> SimResult<()> {
        self.trigger(true, value, DEFAULT_PRIORITY)
    }

    /// Resolve successfully at the current time.
    pub fn succeed_with_priority(&self, value: Value, priority: i32) -> SimResult<()> {
        self.trigger(true, value, priority)
    }

    /// Resolve as failed at the current time with default priority.
    pub fn fail(&self, value: Value) -> SimResult<()> {
        self.trigger(false, value, DEFAULT_PRIORITY)
    }

    /// Resolve as failed at the current time.
    pub fn fail_with_priority(&self, value: Value, priority: i32) -> SimResult<()> {
        self.trigger(false, value, priority)
    }

    fn trigger(&self, ok: bool, value: Value, priority: i32) -> SimResult<()> {
        let sim = self.simulation()?;
        {
            let mut inner = self.0.borrow_mut();
            if inner.triggered {
                return Err(SimError::AlreadyTriggered { event: inner.id });
            }
            inner.ok = ok;
            inner.value = value;
            inner.triggered = true;
        }
        sim.schedule(self.clone(), priority);
        Ok(())
    }

    /// Register `f` to run when this event is processed.
    ///
    /// If the event has already been processed `f` runs immediately, at the
    /// same logical time.
    pub fn add_callback<F>(&self, f: F) -> CallbackId
    where
        F: FnOnce(&Event) + 'static,
    {
        let (id, processed) = {
            let mut inner = self.0.borrow_mut();
            let id = CallbackId(inner.next_callback);
            inner.next_callback += 1;
            (id, inner.processed)
        };
        if processed {
            f(self);
        } else {
            self.push(id, Callback::Action(Box::new(f)));
        }
        id
    }

    /// Unregister a callback. Returns false if it was absent or already ran.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut inner = self.0.borrow_mut();
        match inner.callbacks.iter().position(|r| r.id == id) {
            Some(idx) => {
                inner.callbacks.remove(idx);
                true
            }
            None => false,
        }
    }

    pub(crate) fn add_resume(&self, process: Process) {
        let id = {
            let mut inner = self.0.borrow_mut();
            let id = CallbackId(inner.next_callback);
            inner.next_callback += 1;
            id
        };
        self.push(id, Callback::Resume(process));
    }

    /// Remove the first resume registration of `process`.
    pub(crate) fn remove_resume(&self, process: &Process) -> bool {
        let mut inner = self.0.borrow_mut();
        let idx = inner
            .callbacks
            .iter()
            .position(|r| matches!(&r.callback, Callback::Resume(p) if p == process));
        match idx {
            Some(idx) => {
                inner.callbacks.remove(idx);
                true
            }
            None => false,
        }
    }

    fn push(&self, id: CallbackId, callback: Callback) {
        self.0
            .borrow_mut()
            .callbacks
            .push(Registration { id, callback });
    }

    /// Mark processed and hand the callback list to the dispatcher.
    pub(crate) fn take_callbacks(&self) -> Vec<Callback> {
        let mut inner = self.0.borrow_mut();
        inner.processed = true;
        std::mem::take(&mut inner.callbacks)
            .into_iter()
            .map(|r| r.callback)
            .collect()
    }

    /// Overwrite polarity and value of an undecided event. Processes use
    /// this to carry a pending fault on their own outcome.
    pub(crate) fn set_pending_outcome(&self, ok: bool, value: Value) {
        let mut inner = self.0.borrow_mut();
        if !inner.triggered {
            inner.ok = ok;
            inner.value = value;
        }
    }

    /// Reset a pending fault. Returns whether there was one.
    pub(crate) fn clear_fault(&self) -> bool {
        let mut inner = self.0.borrow_mut();
        if inner.triggered || inner.ok {
            return false;
        }
        inner.ok = true;
        true
    }
}

impl AsRef<Event> for Event {
    fn as_ref(&self) -> &Event {
        self
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Event {}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        f.debug_struct("Event")
            .field("id", &inner.id)
            .field("ok", &inner.ok)
            .field("triggered", &inner.triggered)
            .field("processed", &inner.processed)
            .field("value", &inner.value)
            .finish()
    }
}
