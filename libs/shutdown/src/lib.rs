//! Graceful shutdown for long-running relaybot services.
//!
//! A [`ShutdownCoordinator`] counts in-flight requests and consults the
//! conditions in its [`ShutdownRegistry`] before letting the process stop.
//! Background work runs under a [`BackgroundJobSupervisor`], which cancels
//! and awaits it once the coordinator has stopped.

mod condition;
mod coordinator;
mod jobs;
mod signal;

pub use condition::{
    AllowGuard, ConditionId, FnCondition, HoldGuard, PreventShutdown, ShutdownCondition,
    ShutdownRegistry,
};
pub use coordinator::{
    DEFAULT_POLL_INTERVAL, InFlightGuard, ShutdownCoordinator, ShutdownRejection, ShutdownState,
};
pub use jobs::{BackgroundJobSupervisor, DEFAULT_CANCEL_TIMEOUT, JobId};
pub use signal::listen_for_signals;
