//! Processes
//!
//! A process wraps an `async` body and is itself an [`Event`] that resolves
//! when the body terminates. The body suspends by awaiting
//! [`Ctx::wait`]; the driver ([`Resumption`]) reads the event the body
//! yielded, registers the process on it and resumes the body once the
//! calendar fires that event.
//!
//! Faults are data, not panics: when an awaited event fails, the process
//! outcome is marked faulted and the body must call
//! [`Ctx::handle_fault`] before it may await anything else.
//!
//! A poll that returns `Pending` without yielding an event means the body
//! crossed a genuine async boundary (awaited something other than a
//! simulation event). The resumption then stays in flight and the
//! simulation does not dispatch anything else until it completes.

use crate::error::{SimError, SimResult};
use crate::event::{Event, DEFAULT_PRIORITY};
use crate::simulation::Simulation;
use crate::value::Value;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use tracing::{debug, trace, warn};

pub(crate) type Body = Pin<Box<dyn Future<Output = SimResult<()>>>>;

/// Options for creating a process.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProcessOptions {
    /// Priority of the bootstrap event among processes started at the same time.
    pub priority: i32,
    /// Request realtime pacing at this scale before every resumption.
    pub realtime_scale: Option<f64>,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            realtime_scale: None,
        }
    }
}

impl ProcessOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_realtime_scale(mut self, scale: f64) -> Self {
        self.realtime_scale = Some(scale);
        self
    }
}

pub(crate) struct ProcessState {
    /// Event currently awaited (the bootstrap event initially).
    target: Option<Event>,
    body: Option<Body>,
    /// Event deposited by the most recent `Wait` poll.
    yielded: Option<Event>,
    concurrent_wait: bool,
    realtime_scale: Option<f64>,
}

/// Handle to a process. Clones refer to the same process.
#[derive(Clone)]
pub struct Process {
    event: Event,
    state: Rc<RefCell<ProcessState>>,
}

impl Process {
    pub(crate) fn new(sim: &Simulation, realtime_scale: Option<f64>) -> Self {
        Self {
            event: Event::new(sim),
            state: Rc::new(RefCell::new(ProcessState {
                target: None,
                body: None,
                yielded: None,
                concurrent_wait: false,
                realtime_scale,
            })),
        }
    }

    pub(crate) fn install(&self, body: Body, bootstrap: Event) {
        let mut st = self.state.borrow_mut();
        st.body = Some(body);
        st.target = Some(bootstrap);
    }

    /// The event that resolves when this process terminates.
    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn id(&self) -> u64 {
        self.event.id()
    }

    /// Last value seen by the process, or its final value once terminated.
    pub fn value(&self) -> Value {
        self.event.value()
    }

    /// False while an unacknowledged fault is pending, or if the process
    /// terminated as failed.
    pub fn is_ok(&self) -> bool {
        self.event.is_ok()
    }

    pub fn is_triggered(&self) -> bool {
        self.event.is_triggered()
    }

    pub fn is_processed(&self) -> bool {
        self.event.is_processed()
    }

    /// A process is alive until its outcome is decided.
    pub fn is_alive(&self) -> bool {
        !self.event.is_triggered()
    }

    /// The event the process is currently waiting on.
    pub fn target(&self) -> Option<Event> {
        self.state.borrow().target.clone()
    }

    pub(crate) fn set_target(&self, event: Event) {
        self.state.borrow_mut().target = Some(event);
    }

    pub fn realtime_scale(&self) -> Option<f64> {
        self.state.borrow().realtime_scale
    }

    /// Terminate the process successfully.
    pub fn succeed(&self, value: Value) -> SimResult<()> {
        self.event.succeed(value)
    }

    /// Terminate the process as failed.
    pub fn fail(&self, value: Value) -> SimResult<()> {
        self.event.fail(value)
    }

    fn deposit(&self, event: Event) {
        let mut st = self.state.borrow_mut();
        if st.yielded.is_some() {
            st.concurrent_wait = true;
        }
        st.yielded = Some(event);
    }

    /// Carry the outcome of the event that resumed us.
    fn absorb(&self, incoming: &Event) {
        self.event
            .set_pending_outcome(incoming.is_ok(), incoming.value());
    }

    /// Drop the body; the process will never be driven again.
    fn abandon(&self) {
        let body = self.state.borrow_mut().body.take();
        drop(body);
    }

    pub(crate) fn slot(&self) -> ProcessSlot {
        ProcessSlot(Rc::downgrade(&self.state))
    }

    /// Whether `event` is what this process is waiting on.
    pub(crate) fn awaits(&self, event: &Event) -> bool {
        self.state.borrow().target.as_ref() == Some(event)
    }

    /// Advance the body by one poll.
    fn poll_body(&self, cx: &mut Context<'_>) -> Poll<BodyStep> {
        // The body calls back into this process, so it is polled without
        // holding the state borrow.
        let Some(mut body) = self.state.borrow_mut().body.take() else {
            return Poll::Ready(BodyStep::Detached);
        };
        let poll = body.as_mut().poll(cx);

        let mut st = self.state.borrow_mut();
        let yielded = st.yielded.take();
        let conflict = std::mem::take(&mut st.concurrent_wait);
        match poll {
            Poll::Ready(Ok(())) => Poll::Ready(BodyStep::Finished),
            Poll::Ready(Err(e)) => Poll::Ready(BodyStep::Failed(e)),
            Poll::Pending if conflict => Poll::Ready(BodyStep::Failed(SimError::ConcurrentWait {
                process: self.event.id(),
            })),
            Poll::Pending => {
                st.body = Some(body);
                match yielded {
                    Some(event) => Poll::Ready(BodyStep::Yielded(event)),
                    None => Poll::Pending,
                }
            }
        }
    }

    /// Make `next` the target. Returns true if the process suspended,
    /// false if `next` is already processed and the driver should continue.
    fn proceed_to_event(&self, next: &Event) -> bool {
        self.set_target(next.clone());
        if next.is_processed() {
            return false;
        }
        next.add_resume(self.clone());
        true
    }
}

impl AsRef<Event> for Process {
    fn as_ref(&self) -> &Event {
        &self.event
    }
}

impl PartialEq for Process {
    fn eq(&self, other: &Self) -> bool {
        self.event == other.event
    }
}

impl Eq for Process {}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id())
            .field("alive", &self.is_alive())
            .field("ok", &self.is_ok())
            .finish()
    }
}

/// Weak handle the simulation keeps on every process it created, used to
/// release suspended bodies when the simulation goes away.
pub(crate) struct ProcessSlot(Weak<RefCell<ProcessState>>);

impl ProcessSlot {
    pub(crate) fn is_live(&self) -> bool {
        self.0.strong_count() > 0
    }

    /// Drop the body and the target. Both can point back at the process.
    pub(crate) fn release(&self) {
        let Some(state) = self.0.upgrade() else {
            return;
        };
        let Ok(mut st) = state.try_borrow_mut() else {
            return;
        };
        let body = st.body.take();
        let target = st.target.take();
        st.yielded = None;
        drop(st);
        drop(body);
        drop(target);
    }
}

enum BodyStep {
    Yielded(Event),
    Finished,
    Failed(SimError),
    /// No body left to drive.
    Detached,
}

/// Sets the calendar's active-process slot for the duration of one poll
/// and restores it on every exit path.
struct ActiveGuard<'a> {
    sim: &'a Simulation,
    previous: Option<Process>,
}

impl<'a> ActiveGuard<'a> {
    fn enter(sim: &'a Simulation, process: &Process) -> Self {
        let previous = sim.set_active(Some(process.clone()));
        Self { sim, previous }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.sim.set_active(self.previous.take());
    }
}

/// One resumption of a process, possibly spanning several polls when the
/// body crosses an async boundary.
pub(crate) struct Resumption {
    process: Process,
    incoming: Event,
}

impl Resumption {
    pub(crate) fn start(sim: &Simulation, process: Process, incoming: Event) -> Self {
        if let Some(scale) = process.realtime_scale() {
            sim.set_realtime(scale);
        }
        process.absorb(&incoming);
        Self { process, incoming }
    }

    pub(crate) fn poll(&mut self, sim: &Simulation, cx: &mut Context<'_>) -> Poll<SimResult<()>> {
        let _active = ActiveGuard::enter(sim, &self.process);
        loop {
            let step = match self.process.poll_body(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(step) => step,
            };
            match step {
                BodyStep::Detached => return Poll::Ready(Ok(())),
                BodyStep::Failed(e) => {
                    warn!(process = self.process.id(), error = %e, "process body failed");
                    self.process.abandon();
                    return Poll::Ready(Err(e));
                }
                BodyStep::Finished => {
                    if self.process.is_alive() {
                        let value = self.incoming.value();
                        let result = if self.process.is_ok() {
                            self.process.succeed(value)
                        } else {
                            self.process.fail(value)
                        };
                        debug!(process = self.process.id(), ok = self.process.is_ok(), "process finished");
                        return Poll::Ready(result);
                    }
                    return Poll::Ready(Ok(()));
                }
                BodyStep::Yielded(next) => {
                    if self.process.is_triggered() {
                        // the body resolved its own outcome
                        self.process.abandon();
                        return Poll::Ready(Ok(()));
                    }
                    if !self.process.awaits(&self.incoming) {
                        // interrupted while crossing an async boundary; the
                        // interrupt event now holds the only resume
                        trace!(process = self.process.id(), "yield superseded by interrupt");
                        return Poll::Ready(Ok(()));
                    }
                    if !self.process.is_ok() {
                        let e = SimError::UnhandledFault {
                            process: self.process.id(),
                        };
                        warn!(process = self.process.id(), "{}", e);
                        self.process.abandon();
                        return Poll::Ready(Err(e));
                    }
                    if self.process.proceed_to_event(&next) {
                        return Poll::Ready(Ok(()));
                    }
                    self.process.absorb(&next);
                    self.incoming = next;
                }
            }
        }
    }
}

/// Future returned by [`Ctx::wait`].
///
/// The first poll hands the event to the driver and suspends; the second
/// poll happens after the process was resumed and yields the value it was
/// resumed with.
#[must_use = "a wait does nothing unless awaited"]
pub struct Wait {
    process: Process,
    event: Option<Event>,
}

impl Future for Wait {
    type Output = Value;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Value> {
        let this = self.get_mut();
        match this.event.take() {
            Some(event) => {
                this.process.deposit(event);
                Poll::Pending
            }
            None => Poll::Ready(this.process.value()),
        }
    }
}

/// Context handed to every process body.
///
/// The simulation is reached through the process event's weak link, so a
/// suspended body does not keep its simulation alive.
#[derive(Clone)]
pub struct Ctx {
    process: Process,
}

impl Ctx {
    pub(crate) fn new(process: Process) -> Self {
        Self { process }
    }

    /// Current logical time, or NaN once the simulation is gone.
    pub fn now(&self) -> f64 {
        self.simulation().map_or(f64::NAN, |sim| sim.now())
    }

    pub fn simulation(&self) -> SimResult<Simulation> {
        self.process.event().simulation()
    }

    /// The process running this body.
    pub fn process(&self) -> &Process {
        &self.process
    }

    /// Suspend until `event` is processed.
    ///
    /// Resolves to the value the process was resumed with: the event's
    /// value, or the interrupt cause when interrupted.
    pub fn wait(&self, event: impl AsRef<Event>) -> Wait {
        Wait {
            process: self.process.clone(),
            event: Some(event.as_ref().clone()),
        }
    }

    /// An event that succeeds `delay` time units from now. Once the
    /// simulation is gone this is a detached event that never fires.
    pub fn timeout(&self, delay: f64) -> Event {
        match self.simulation() {
            Ok(sim) => sim.timeout(delay),
            Err(_) => Event::detached(),
        }
    }

    /// Start a child process.
    pub fn spawn<F, Fut>(&self, f: F) -> SimResult<Process>
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = SimResult<()>> + 'static,
    {
        Ok(self.simulation()?.process(f))
    }

    pub fn spawn_with<F, Fut>(&self, options: ProcessOptions, f: F) -> SimResult<Process>
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = SimResult<()>> + 'static,
    {
        Ok(self.simulation()?.process_with(options, f))
    }

    /// Acknowledge a pending fault. Returns whether there was one.
    pub fn handle_fault(&self) -> bool {
        self.process.handle_fault()
    }

    pub fn is_ok(&self) -> bool {
        self.process.is_ok()
    }

    /// Value the process was last resumed with.
    pub fn value(&self) -> Value {
        self.process.value()
    }

    /// Terminate this process successfully. The body stops being driven at
    /// its next await.
    pub fn succeed(&self, value: Value) -> SimResult<()> {
        self.process.succeed(value)
    }

    /// Terminate this process as failed.
    pub fn fail(&self, value: Value) -> SimResult<()> {
        self.process.fail(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_body_runs_at_bootstrap() {
        let sim = Simulation::new();
        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();
        let p = sim.process(move |_ctx| async move {
            r.set(true);
            Ok(())
        });

        assert!(p.is_alive());
        assert!(!ran.get());
        sim.step().unwrap();
        assert!(ran.get());
        assert!(!p.is_alive());
        assert!(p.is_ok());
    }

    #[test]
    fn test_target_tracks_awaited_event() {
        let sim = Simulation::new();
        let ev = sim.timeout(5.0);
        let awaited = ev.clone();
        let p = sim.process(move |ctx| async move {
            ctx.wait(&awaited).await;
            Ok(())
        });

        // bootstrap
        sim.step().unwrap();
        assert_eq!(p.target(), Some(ev.clone()));
        assert_eq!(ev.callback_count(), 1);

        sim.run().unwrap();
        assert!(!p.is_alive());
    }

    #[test]
    fn test_finishing_takes_last_value() {
        let sim = Simulation::new();
        let p = sim.process(|ctx| async move {
            let ev = ctx.simulation().unwrap().timeout_with(2.0, Value::new(7i64), 0);
            let v = ctx.wait(&ev).await;
            assert_eq!(v.get::<i64>(), Some(7));
            Ok(())
        });
        sim.run().unwrap();
        assert!(p.is_ok());
        assert_eq!(p.value().get::<i64>(), Some(7));
    }

    #[test]
    fn test_body_error_propagates() {
        let sim = Simulation::new();
        let p = sim.process(|ctx| async move {
            let ev = ctx.simulation().unwrap().event();
            ev.succeed(Value::none())?;
            ev.succeed(Value::none())?;
            Ok::<(), SimError>(())
        });
        let err = sim.run().unwrap_err();
        assert!(matches!(err, SimError::AlreadyTriggered { .. }));
        // never resolved
        assert!(p.is_alive());
    }

    #[test]
    fn test_concurrent_wait_rejected() {
        let sim = Simulation::new();
        sim.process(|ctx| async move {
            let a = ctx.wait(ctx.timeout(1.0));
            let b = ctx.wait(ctx.timeout(2.0));
            futures::future::join(a, b).await;
            Ok(())
        });
        let err = sim.run().unwrap_err();
        assert!(matches!(err, SimError::ConcurrentWait { .. }));
    }

    #[test]
    fn test_options_builder() {
        let opts = ProcessOptions::default()
            .with_priority(-3)
            .with_realtime_scale(2.0);
        assert_eq!(opts.priority, -3);
        assert_eq!(opts.realtime_scale, Some(2.0));
    }
}
