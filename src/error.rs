//! Error types
//!
//! Data-level faults (an awaited event failed) never show up here: they are
//! carried on the process outcome and acknowledged with `handle_fault`.
//! Everything in `SimError` is a protocol violation or a usage error and
//! aborts the current scheduling step.

use thiserror::Error;

/// Fatal simulation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    /// `succeed`/`fail` called on an event whose outcome is already decided.
    #[error("event #{event} has already been triggered")]
    AlreadyTriggered { event: u64 },

    /// Interrupt targeted a process that has already terminated.
    #[error("process #{process} has terminated and cannot be interrupted")]
    InterruptTerminated { process: u64 },

    /// A process tried to interrupt itself.
    #[error("process #{process} is not allowed to interrupt itself")]
    SelfInterrupt { process: u64 },

    /// A faulted process yielded again without calling `handle_fault`.
    #[error("process #{process} did not react to being faulted")]
    UnhandledFault { process: u64 },

    /// A process body awaited more than one event at the same time.
    #[error("process #{process} awaited two events concurrently")]
    ConcurrentWait { process: u64 },

    /// A resumption crossed a genuine async boundary and has not finished yet.
    #[error("a process resumption is still in flight")]
    ResumptionPending,

    /// `step` was called from inside a callback or a process body.
    #[error("cannot step the simulation from inside a dispatch")]
    ReentrantStep,

    /// A single run call processed more entries than the configured limit.
    #[error("run exceeded the step limit of {limit} entries")]
    StepLimitExceeded { limit: u64 },

    /// The event outlived the simulation it belongs to.
    #[error("event #{event} is detached from its simulation")]
    Detached { event: u64 },
}

/// Convenience alias for `Result<T, SimError>`.
pub type SimResult<T> = Result<T, SimError>;
