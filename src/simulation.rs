//! Simulation - calendar dispatch and run loops
//!
//! The simulation ties together the calendar, the process driver and the
//! pacing hook.
//! - `step` / `run*`: synchronous stepping; a resumption that crosses a
//!   genuine async boundary surfaces as `SimError::ResumptionPending`
//! - `step_async` / `run_async`: the same loop, waiting for such
//!   resumptions instead of failing

use crate::calendar::Calendar;
use crate::error::{SimError, SimResult};
use crate::event::{Callback, Event, DEFAULT_PRIORITY};
use crate::pacing::{Pacing, PacingMode};
use crate::process::{Ctx, Process, ProcessOptions, ProcessSlot, Resumption};
use crate::value::Value;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::rc::Rc;
use std::task::{Context, Poll};
use tracing::{debug, trace, warn};

/// Configuration for a simulation.
#[derive(Clone, Debug, PartialEq)]
pub struct SimulationConfig {
    /// Logical time the clock starts at.
    pub start_time: f64,
    /// Start in realtime pacing at this scale instead of virtual time.
    pub realtime_scale: Option<f64>,
    /// Maximum number of entries a single run call may dispatch. A run
    /// that still has work after that many entries fails.
    pub step_limit: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            start_time: 0.0,
            realtime_scale: None,
            step_limit: None,
        }
    }
}

/// Dispatch of one calendar entry, kept across polls while a resumption is
/// in flight.
struct Dispatch {
    event: Event,
    callbacks: VecDeque<Callback>,
    in_flight: Option<Resumption>,
    /// First protocol violation raised by a callback of this entry.
    error: Option<SimError>,
}

pub(crate) struct SimShared {
    calendar: RefCell<Calendar>,
    pacing: RefCell<Pacing>,
    dispatch: RefCell<Option<Dispatch>>,
    stepping: Cell<bool>,
    next_id: Cell<u64>,
    processed: Cell<u64>,
    /// Every process created here, for releasing suspended bodies on drop.
    processes: RefCell<Vec<ProcessSlot>>,
    config: SimulationConfig,
}

impl Drop for SimShared {
    fn drop(&mut self) {
        for slot in self.processes.get_mut().drain(..) {
            slot.release();
        }
    }
}

/// A discrete-event simulation. Clones share the same state.
#[derive(Clone)]
pub struct Simulation {
    pub(crate) shared: Rc<SimShared>,
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}

/// Clears the stepping flag when a step returns.
struct SteppingGuard<'a>(&'a Cell<bool>);

impl Drop for SteppingGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Simulation {
    pub fn new() -> Self {
        Self::with_config(SimulationConfig::default())
    }

    pub fn with_config(config: SimulationConfig) -> Self {
        let mut pacing = Pacing::new();
        if let Some(scale) = config.realtime_scale {
            pacing.set_realtime(scale, config.start_time);
        }
        Self {
            shared: Rc::new(SimShared {
                calendar: RefCell::new(Calendar::new(config.start_time)),
                pacing: RefCell::new(pacing),
                dispatch: RefCell::new(None),
                stepping: Cell::new(false),
                next_id: Cell::new(0),
                processed: Cell::new(0),
                processes: RefCell::new(Vec::new()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.shared.config
    }

    pub(crate) fn next_id(&self) -> u64 {
        let id = self.shared.next_id.get();
        self.shared.next_id.set(id + 1);
        id
    }

    /// Current logical time.
    pub fn now(&self) -> f64 {
        self.shared.calendar.borrow().now()
    }

    /// Time of the next calendar entry.
    pub fn peek(&self) -> Option<f64> {
        self.shared.calendar.borrow().peek_time()
    }

    /// Number of calendar entries dispatched so far.
    pub fn processed_count(&self) -> u64 {
        self.shared.processed.get()
    }

    /// Number of entries waiting in the calendar.
    pub fn pending_count(&self) -> usize {
        self.shared.calendar.borrow().len()
    }

    /// The process currently being resumed, if any.
    pub fn active_process(&self) -> Option<Process> {
        self.shared.calendar.borrow().active().cloned()
    }

    pub(crate) fn set_active(&self, process: Option<Process>) -> Option<Process> {
        self.shared.calendar.borrow_mut().set_active(process)
    }

    pub(crate) fn schedule(&self, event: Event, priority: i32) {
        self.shared.calendar.borrow_mut().schedule(event, priority);
    }

    // ==================== EVENT FACTORIES ====================

    /// A new idle event.
    pub fn event(&self) -> Event {
        Event::new(self)
    }

    /// An event that succeeds with no value `delay` time units from now.
    pub fn timeout(&self, delay: f64) -> Event {
        self.timeout_with(delay, Value::none(), DEFAULT_PRIORITY)
    }

    /// An event that succeeds with `value` `delay` time units from now.
    /// Negative or non-finite delays are treated as zero.
    pub fn timeout_with(&self, delay: f64, value: Value, priority: i32) -> Event {
        let d = if delay.is_finite() && delay > 0.0 { delay } else { 0.0 };
        let event = Event::triggered(self, true, value);
        let mut cal = self.shared.calendar.borrow_mut();
        let at = cal.now() + d;
        cal.schedule_at(event.clone(), at, priority);
        event
    }

    /// An event that has already succeeded with `value` at the current time.
    pub fn resolved(&self, value: Value) -> Event {
        let event = Event::triggered(self, true, value);
        self.schedule(event.clone(), DEFAULT_PRIORITY);
        event
    }

    // ==================== PROCESSES ====================

    /// Start a process at the current time with default options.
    pub fn process<F, Fut>(&self, f: F) -> Process
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = SimResult<()>> + 'static,
    {
        self.process_with(ProcessOptions::default(), f)
    }

    /// Start a process. Its body first runs when the bootstrap event,
    /// scheduled now at `options.priority`, is dispatched.
    pub fn process_with<F, Fut>(&self, options: ProcessOptions, f: F) -> Process
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = SimResult<()>> + 'static,
    {
        let process = Process::new(self, options.realtime_scale);
        let body = f(Ctx::new(process.clone()));

        let bootstrap = Event::triggered(self, true, Value::none());
        bootstrap.add_resume(process.clone());
        process.install(Box::pin(body), bootstrap.clone());
        self.schedule(bootstrap, options.priority);
        self.track(&process);

        debug!(process = process.id(), priority = options.priority, time = self.now(), "process created");
        process
    }

    fn track(&self, process: &Process) {
        let mut slots = self.shared.processes.borrow_mut();
        if slots.len() >= 64 && slots.len().is_power_of_two() {
            slots.retain(ProcessSlot::is_live);
        }
        slots.push(process.slot());
    }

    // ==================== PACING ====================

    /// Pace subsequent steps against the wall clock.
    pub fn set_realtime(&self, scale: f64) {
        let now = self.now();
        self.shared.pacing.borrow_mut().set_realtime(scale, now);
    }

    /// Stop pacing; steps jump straight to the next entry.
    pub fn set_virtual_time(&self) {
        self.shared.pacing.borrow_mut().set_virtual();
    }

    pub fn pacing_mode(&self) -> PacingMode {
        self.shared.pacing.borrow().mode()
    }

    // ==================== STEPPING ====================

    /// Whether an entry is partially dispatched.
    pub fn is_dispatching(&self) -> bool {
        self.shared.dispatch.borrow().is_some()
    }

    /// Dispatch one calendar entry.
    ///
    /// Returns `Ok(false)` when the calendar is empty. All callbacks of the
    /// entry run even if one reports a protocol violation; the first such
    /// error is returned afterwards and the simulation can keep running.
    pub fn step(&self) -> SimResult<bool> {
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        match self.poll_step(&mut cx) {
            Poll::Ready(result) => result,
            Poll::Pending => Err(SimError::ResumptionPending),
        }
    }

    /// Dispatch one calendar entry, waiting for resumptions that cross an
    /// async boundary.
    pub async fn step_async(&self) -> SimResult<bool> {
        futures::future::poll_fn(|cx| self.poll_step(cx)).await
    }

    fn poll_step(&self, cx: &mut Context<'_>) -> Poll<SimResult<bool>> {
        if self.shared.stepping.replace(true) {
            return Poll::Ready(Err(SimError::ReentrantStep));
        }
        let _stepping = SteppingGuard(&self.shared.stepping);

        let pending = self.shared.dispatch.borrow_mut().take();
        let mut dispatch = match pending {
            Some(d) => d,
            None => match self.begin_dispatch() {
                Some(d) => d,
                None => return Poll::Ready(Ok(false)),
            },
        };

        if self.drive(&mut dispatch, cx).is_pending() {
            *self.shared.dispatch.borrow_mut() = Some(dispatch);
            return Poll::Pending;
        }

        self.shared.processed.set(self.shared.processed.get() + 1);
        match dispatch.error {
            Some(e) => Poll::Ready(Err(e)),
            None => Poll::Ready(Ok(true)),
        }
    }

    fn begin_dispatch(&self) -> Option<Dispatch> {
        let next = self.peek()?;
        self.shared.pacing.borrow().wait_until(next);

        let (key, event) = self.shared.calendar.borrow_mut().pop()?;
        let callbacks: VecDeque<Callback> = event.take_callbacks().into();
        trace!(
            event = event.id(),
            time = key.time,
            priority = key.priority,
            seq = key.seq,
            callbacks = callbacks.len(),
            "dispatch"
        );
        Some(Dispatch {
            event,
            callbacks,
            in_flight: None,
            error: None,
        })
    }

    fn drive(&self, dispatch: &mut Dispatch, cx: &mut Context<'_>) -> Poll<()> {
        loop {
            if let Some(resumption) = dispatch.in_flight.as_mut() {
                let result = match resumption.poll(self, cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(result) => result,
                };
                dispatch.in_flight = None;
                if let Err(e) = result {
                    warn!(event = dispatch.event.id(), error = %e, "protocol violation");
                    dispatch.error.get_or_insert(e);
                }
            }

            match dispatch.callbacks.pop_front() {
                None => return Poll::Ready(()),
                Some(Callback::Action(f)) => f(&dispatch.event),
                Some(Callback::Resume(process)) if !process.awaits(&dispatch.event) => {
                    // interrupted after this entry was popped
                    trace!(process = process.id(), event = dispatch.event.id(), "stale resume skipped");
                }
                Some(Callback::Resume(process)) => {
                    let event = dispatch.event.clone();
                    dispatch.in_flight = Some(Resumption::start(self, process, event));
                }
            }
        }
    }

    // ==================== RUN LOOPS ====================

    fn check_limit(&self, steps: u64) -> SimResult<()> {
        match self.shared.config.step_limit {
            Some(limit) if steps >= limit => Err(SimError::StepLimitExceeded { limit }),
            _ => Ok(()),
        }
    }

    fn run_while<F>(&self, mut keep_going: F) -> SimResult<u64>
    where
        F: FnMut(&Simulation) -> bool,
    {
        let mut steps = 0u64;
        while self.is_dispatching() || (self.peek().is_some() && keep_going(self)) {
            self.check_limit(steps)?;
            if !self.step()? {
                break;
            }
            steps += 1;
        }
        Ok(steps)
    }

    /// Run until the calendar is empty. Returns the number of entries
    /// dispatched.
    pub fn run(&self) -> SimResult<u64> {
        self.run_while(|_| true)
    }

    /// Dispatch every entry due at or before `until`, then set the clock to
    /// `until`.
    pub fn run_until(&self, until: f64) -> SimResult<u64> {
        let steps = self.run_while(|sim| sim.peek().is_some_and(|t| t <= until))?;
        self.shared.calendar.borrow_mut().advance_to(until);
        Ok(steps)
    }

    /// Run until `stop` has been processed or the calendar is empty.
    pub fn run_until_event(&self, stop: &Event) -> SimResult<u64> {
        self.run_while(|_| !stop.is_processed())
    }

    /// Async variant of [`Simulation::run`].
    pub async fn run_async(&self) -> SimResult<u64> {
        let mut steps = 0u64;
        while self.is_dispatching() || self.peek().is_some() {
            self.check_limit(steps)?;
            if !self.step_async().await? {
                break;
            }
            steps += 1;
        }
        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_empty_simulation() {
        let sim = Simulation::new();
        assert_eq!(sim.run().unwrap(), 0);
        assert!(!sim.step().unwrap());
        assert_eq!(sim.now(), 0.0);
    }

    #[test]
    fn test_start_time() {
        let sim = Simulation::with_config(SimulationConfig {
            start_time: 100.0,
            ..Default::default()
        });
        let t = sim.timeout(5.0);
        sim.run().unwrap();
        assert!(t.is_processed());
        assert_eq!(sim.now(), 105.0);
    }

    #[test]
    fn test_run_until_time() {
        let sim = Simulation::new();
        let a = sim.timeout(1.0);
        let b = sim.timeout(2.0);
        let c = sim.timeout(3.0);

        assert_eq!(sim.run_until(2.0).unwrap(), 2);
        assert!(a.is_processed() && b.is_processed());
        assert!(!c.is_processed());
        assert_eq!(sim.now(), 2.0);

        sim.run_until(2.5).unwrap();
        assert_eq!(sim.now(), 2.5);
        assert_eq!(sim.peek(), Some(3.0));
    }

    #[test]
    fn test_run_until_stop_event() {
        let sim = Simulation::new();
        let stop = sim.timeout(4.0);
        let later = sim.timeout(9.0);
        sim.run_until_event(&stop).unwrap();
        assert!(stop.is_processed());
        assert!(!later.is_processed());
        assert_eq!(sim.now(), 4.0);
    }

    #[test]
    fn test_negative_delay_clamped() {
        let sim = Simulation::new();
        sim.timeout(-5.0);
        sim.timeout(f64::NAN);
        sim.run().unwrap();
        assert_eq!(sim.now(), 0.0);
        assert_eq!(sim.processed_count(), 2);
    }

    #[test]
    fn test_resolved_event() {
        let sim = Simulation::new();
        let ev = sim.resolved(Value::new(3i64));
        assert!(ev.is_triggered());
        sim.step().unwrap();
        assert!(ev.is_processed());
        assert_eq!(ev.value().get::<i64>(), Some(3));
    }

    #[test]
    fn test_step_limit() {
        let sim = Simulation::with_config(SimulationConfig {
            step_limit: Some(3),
            ..Default::default()
        });
        for i in 0..10 {
            sim.timeout(i as f64);
        }
        assert_eq!(sim.run(), Err(SimError::StepLimitExceeded { limit: 3 }));
        assert_eq!(sim.processed_count(), 3);
    }

    #[test]
    fn test_step_limit_exactly_reached() {
        let sim = Simulation::with_config(SimulationConfig {
            step_limit: Some(3),
            ..Default::default()
        });
        for i in 0..3 {
            sim.timeout(i as f64);
        }
        assert_eq!(sim.run(), Ok(3));
        assert_eq!(sim.run_until(10.0), Ok(0));
    }

    #[test]
    fn test_dropping_simulation_releases_suspended_processes() {
        let sim = Simulation::new();
        let p = sim.process(|ctx| async move {
            ctx.wait(ctx.timeout(100.0)).await;
            Ok(())
        });
        let idle = sim.event();
        let waiting_on_idle = sim.process(move |ctx| async move {
            ctx.wait(&idle).await;
            Ok(())
        });
        sim.run_until(1.0).unwrap();
        assert!(p.is_alive());
        assert!(p.target().is_some());

        let shared = Rc::downgrade(&sim.shared);
        drop(sim);
        assert!(shared.upgrade().is_none());
        // bodies and targets were let go
        assert!(p.target().is_none());
        assert!(waiting_on_idle.target().is_none());
    }

    #[test]
    fn test_ctx_outliving_simulation() {
        let escaped = Rc::new(RefCell::new(None));
        {
            let sim = Simulation::new();
            let e = escaped.clone();
            sim.process(move |ctx| async move {
                *e.borrow_mut() = Some(ctx.clone());
                Ok(())
            });
            sim.run().unwrap();
        }
        let ctx = escaped.borrow_mut().take().unwrap();
        assert!(ctx.now().is_nan());
        assert!(matches!(ctx.simulation(), Err(SimError::Detached { .. })));
        let ev = ctx.timeout(1.0);
        assert!(ev.succeed(Value::none()).is_err());
        assert!(ctx.spawn(|_c| async move { Ok(()) }).is_err());
    }

    #[test]
    fn test_reentrant_step_rejected() {
        let sim = Simulation::new();
        let ev = sim.timeout(1.0);
        let seen = Rc::new(RefCell::new(None));
        let s = seen.clone();
        let inner = sim.clone();
        ev.add_callback(move |_| {
            *s.borrow_mut() = Some(inner.step());
        });
        sim.run().unwrap();
        assert_eq!(*seen.borrow(), Some(Err(SimError::ReentrantStep)));
    }

    #[test]
    fn test_realtime_pacing_waits() {
        let sim = Simulation::with_config(SimulationConfig {
            realtime_scale: Some(100.0),
            ..Default::default()
        });
        sim.timeout(2.0);
        let started = Instant::now();
        sim.run().unwrap();
        // 2 logical seconds at 100x = 20ms of wall time
        assert!(started.elapsed() >= Duration::from_millis(15));

        sim.set_virtual_time();
        assert_eq!(sim.pacing_mode(), PacingMode::Virtual);
    }

    #[test]
    fn test_deterministic_replay() {
        fn trace() -> Vec<(u64, f64)> {
            let sim = Simulation::new();
            let log = Rc::new(RefCell::new(Vec::new()));
            for (delay, prio) in [(5.0, 0), (3.0, 1), (5.0, -1), (3.0, 1), (0.0, 0)] {
                let ev = sim.timeout_with(delay, Value::none(), prio);
                let l = log.clone();
                ev.add_callback(move |e| l.borrow_mut().push(e.id()));
            }
            sim.run().unwrap();
            let ids = log.borrow().clone();
            ids.into_iter().map(|id| (id, sim.now())).collect()
        }
        assert_eq!(trace(), trace());
    }
}
