//! Interrupts and fault acknowledgment
//!
//! An interrupt fails a fresh event with the cause and makes it the only
//! thing that will resume the victim: the victim's registration on its
//! current target is removed in the same call, so the previous target
//! firing later does not resume it a second time.

use crate::error::{SimError, SimResult};
use crate::event::DEFAULT_PRIORITY;
use crate::process::Process;
use crate::value::Value;
use tracing::debug;

impl Process {
    /// Interrupt this process with `cause` at default priority.
    pub fn interrupt(&self, cause: Value) -> SimResult<()> {
        self.interrupt_with_priority(cause, DEFAULT_PRIORITY)
    }

    /// Interrupt this process with `cause`.
    ///
    /// The process is resumed at the current time with a fault carrying
    /// `cause` and must acknowledge it with `handle_fault` before awaiting
    /// again.
    ///
    /// Interrupting again before the first interrupt is delivered replaces
    /// it: the process is resumed once, with the latest cause, and the
    /// earlier cause is dropped.
    pub fn interrupt_with_priority(&self, cause: Value, priority: i32) -> SimResult<()> {
        if self.is_triggered() {
            return Err(SimError::InterruptTerminated { process: self.id() });
        }
        let sim = self.event().simulation()?;
        if sim.active_process().as_ref() == Some(self) {
            return Err(SimError::SelfInterrupt { process: self.id() });
        }

        let interrupt = sim.event();
        interrupt.add_resume(self.clone());
        interrupt.fail_with_priority(cause, priority)?;

        if let Some(target) = self.target() {
            target.remove_resume(self);
        }
        // A second interrupt before delivery supersedes this one.
        self.set_target(interrupt);

        debug!(process = self.id(), priority, time = sim.now(), "process interrupted");
        Ok(())
    }

    /// Acknowledge a pending fault and return to normal polarity.
    ///
    /// Returns false if there was nothing to handle.
    pub fn handle_fault(&self) -> bool {
        self.event().clear_fault()
    }
}
