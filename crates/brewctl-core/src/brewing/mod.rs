//! Mash process control: schedules, heater PID and the brew state machine.

pub mod pid;
pub mod schedule;
pub mod state_machine;

pub use pid::{Pid, PidGains};
pub use schedule::{MashSchedule, MashStep, ScheduleBook, ScheduleSource};
pub use state_machine::{BrewEvent, BrewPhase, BrewProgress, BrewStateMachine, DataPoint, TickOutput};

use thiserror_no_std::Error;

/// Reasons a brew command is refused. None of these are fatal; the API
/// reports them back to the dashboard.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrewError {
    #[error("schedule has no steps")]
    EmptySchedule,
    #[error("schedule not found")]
    ScheduleNotFound,
    #[error("no brew is running")]
    NotRunning,
    #[error("brew is already paused")]
    AlreadyPaused,
    #[error("brew is not paused")]
    NotPaused,
    #[error("brew is paused")]
    IsPaused,
    #[error("current step is not holding")]
    NotHolding,
    #[error("session {0} not found")]
    SessionNotFound(u32),
    #[error("session {0} is already completed")]
    SessionCompleted(u32),
    #[error("checkpoint does not match the schedule")]
    InvalidCheckpoint,
}
