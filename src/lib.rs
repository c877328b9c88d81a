//! Process-Oriented Discrete-Event Simulation
//!
//! A deterministic logical-time simulation engine with:
//! - Events as the single suspension primitive (succeed / fail once, callbacks)
//! - A calendar ordered by (time, priority, submission order)
//! - Processes written as `async` bodies that await events through [`Ctx::wait`]
//! - Interrupts delivered as faults that the body must acknowledge
//! - Virtual-time stepping or realtime pacing (spin_sleep)
//!
//! ```ignore
//! let sim = Simulation::new();
//! sim.process(|ctx| async move {
//!     ctx.wait(ctx.timeout(1.5)).await;
//!     ctx.succeed(Value::new(ctx.now()))
//! });
//! sim.run()?;
//! ```

pub mod error;
pub mod value;
pub mod pq;
pub mod event;
pub mod calendar;
pub mod pacing;
pub mod process;
pub mod interrupt;
pub mod simulation;


pub use error::{SimError, SimResult};
pub use event::{CallbackId, Event, DEFAULT_PRIORITY};
pub use pacing::{Pacing, PacingMode};
pub use process::{Ctx, Process, ProcessOptions, Wait};
pub use simulation::{Simulation, SimulationConfig};
pub use value::Value;
