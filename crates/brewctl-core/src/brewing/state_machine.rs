//! Brew process state machine.
//!
//! ```text
//!            start                reached target
//!   Idle ───────────▶ Heating ─────────────────▶ Holding
//!    ▲                  ▲  │                       │ │
//!    │   schedule done  │  │ skip      timer/continue/skip
//!    ├──────────────────┼──┴───────────────────────┘ │
//!    │                  └── next step ◀──────────────┘
//!    │
//!    └── stop (from any phase)      Heating/Holding ◀──resume── Paused
//! ```
//!
//! The machine is pure: it never touches storage. The controller feeds it
//! sensor readings once per tick and acts on the returned [`TickOutput`].

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::BrewError;
use super::pid::{Pid, PidGains};
use super::schedule::{MashSchedule, MashStep};
use crate::config::ControllerConfig;
use crate::sensors::{SensorReading, control_average};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BrewPhase {
    /// No brew running
    Idle,
    /// Driving towards the current step's target, hold timer not running
    Heating,
    /// At target, hold timer counting down
    Holding,
    /// Suspended: heater off, timer frozen, recording continues
    Paused,
}

impl BrewPhase {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Heating => "heating",
            Self::Holding => "holding",
            Self::Paused => "paused",
        }
    }

    pub const fn is_running(self) -> bool {
        !matches!(self, Self::Idle)
    }
}

/// Notifications raised by transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BrewEvent {
    Started,
    StepStarted { step: u8 },
    HoldStarted { step: u8, hold_secs: u32 },
    /// Temperature left the band on an extend-if-needed step; timer frozen
    HoldExtended { step: u8 },
    StepCompleted { step: u8 },
    ScheduleComplete,
    Paused,
    Resumed,
    Stopped,
}

pub type Events = heapless::Vec<BrewEvent, 4>;

/// Values to record for one tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPoint {
    pub timestamp: u32,
    pub avg_temperature: f32,
    pub target_temperature: f32,
    pub output_percent: u8,
}

/// Result of one control tick
#[derive(Debug, Clone, Default)]
pub struct TickOutput {
    /// Heater duty cycle to apply until the next tick
    pub output_percent: u8,
    /// Control average, None when every control probe is disconnected
    pub control_temperature: Option<f32>,
    /// Sample for the session recorder
    pub point: Option<DataPoint>,
    pub events: Events,
}

/// Position within the schedule, persisted in brew checkpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrewProgress {
    pub phase: BrewPhase,
    pub paused_from: Option<BrewPhase>,
    pub step_index: u8,
    pub hold_remaining_secs: u32,
}

pub struct BrewStateMachine {
    phase: BrewPhase,
    paused_from: Option<BrewPhase>,
    schedule: Option<MashSchedule>,
    step_index: usize,
    hold_remaining_secs: u32,
    hold_frozen: bool,
    last_tick: Option<u32>,
    pid: Pid,
    tolerance: f32,
    boost_band: f32,
}

fn emit(events: &mut Events, event: BrewEvent) {
    debug!("Brew event: {:?}", event);
    if events.push(event).is_err() {
        warn!("Dropping brew event {:?}", event);
    }
}

impl BrewStateMachine {
    pub fn new(config: &ControllerConfig) -> Self {
        Self::with_gains(config.pid, config.hold_tolerance_c, config.boost_band_c)
    }

    pub fn with_gains(gains: PidGains, tolerance: f32, boost_band: f32) -> Self {
        Self {
            phase: BrewPhase::Idle,
            paused_from: None,
            schedule: None,
            step_index: 0,
            hold_remaining_secs: 0,
            hold_frozen: false,
            last_tick: None,
            pid: Pid::new(gains),
            tolerance,
            boost_band,
        }
    }

    pub fn phase(&self) -> BrewPhase {
        self.phase
    }

    /// Phase to return to on resume, only set while paused
    pub fn paused_from(&self) -> Option<BrewPhase> {
        self.paused_from
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    pub fn hold_remaining_secs(&self) -> u32 {
        self.hold_remaining_secs
    }

    pub fn schedule(&self) -> Option<&MashSchedule> {
        self.schedule.as_ref()
    }

    pub fn current_step(&self) -> Option<&MashStep> {
        self.schedule.as_ref()?.step(self.step_index)
    }

    pub fn target_temperature(&self) -> Option<f32> {
        self.current_step().map(|s| s.temperature)
    }

    pub fn progress(&self) -> BrewProgress {
        BrewProgress {
            phase: self.phase,
            paused_from: self.paused_from,
            step_index: self.step_index as u8,
            hold_remaining_secs: self.hold_remaining_secs,
        }
    }

    /// Begin `schedule` at its first step, abandoning whatever was running.
    ///
    /// An empty schedule is refused and leaves the machine untouched.
    pub fn start(&mut self, schedule: MashSchedule, now: u32) -> Result<Events, BrewError> {
        if schedule.is_empty() {
            warn!("Refusing to start empty schedule {}", schedule.name);
            return Err(BrewError::EmptySchedule);
        }

        info!(
            "Starting schedule {} ({} steps)",
            schedule.name,
            schedule.steps.len()
        );
        self.schedule = Some(schedule);
        self.enter_step(0, now);

        let mut events = Events::new();
        emit(&mut events, BrewEvent::Started);
        emit(&mut events, BrewEvent::StepStarted { step: 0 });
        Ok(events)
    }

    /// Phase a restored brew resumes into, or [`BrewError::InvalidCheckpoint`]
    /// when `progress` does not fit `schedule`. Touches no state.
    pub fn check_restore(
        schedule: &MashSchedule,
        progress: &BrewProgress,
    ) -> Result<BrewPhase, BrewError> {
        if schedule.step(usize::from(progress.step_index)).is_none() {
            return Err(BrewError::InvalidCheckpoint);
        }
        match progress.phase {
            BrewPhase::Heating | BrewPhase::Holding => Ok(progress.phase),
            BrewPhase::Paused => Ok(progress.paused_from.unwrap_or(BrewPhase::Heating)),
            BrewPhase::Idle => Err(BrewError::InvalidCheckpoint),
        }
    }

    /// Rebuild a brew from a checkpoint. The machine comes back `Paused`, so
    /// the heater only restarts on an explicit resume.
    pub fn restore(
        &mut self,
        schedule: MashSchedule,
        progress: BrewProgress,
        now: u32,
    ) -> Result<(), BrewError> {
        let resume_to = Self::check_restore(&schedule, &progress)?;
        let index = usize::from(progress.step_index);
        let Some(step) = schedule.step(index) else {
            return Err(BrewError::InvalidCheckpoint);
        };
        let hold_remaining = progress.hold_remaining_secs.min(step.hold_secs());

        info!(
            "Restored schedule {} at step {} ({}, {} s left)",
            schedule.name,
            index,
            resume_to.label(),
            hold_remaining
        );
        self.schedule = Some(schedule);
        self.step_index = index;
        self.hold_remaining_secs = hold_remaining;
        self.hold_frozen = false;
        self.phase = BrewPhase::Paused;
        self.paused_from = Some(resume_to);
        self.last_tick = Some(now);
        self.pid.reset();
        Ok(())
    }

    pub fn pause(&mut self) -> Result<BrewEvent, BrewError> {
        match self.phase {
            BrewPhase::Heating | BrewPhase::Holding => {
                info!(
                    "Pausing in {} with {} s of hold left",
                    self.phase.label(),
                    self.hold_remaining_secs
                );
                self.paused_from = Some(self.phase);
                self.phase = BrewPhase::Paused;
                Ok(BrewEvent::Paused)
            }
            BrewPhase::Paused => Err(BrewError::AlreadyPaused),
            BrewPhase::Idle => Err(BrewError::NotRunning),
        }
    }

    /// Return to the phase active before the pause, keeping the remaining
    /// hold time.
    pub fn resume(&mut self, now: u32) -> Result<BrewEvent, BrewError> {
        if self.phase != BrewPhase::Paused {
            return Err(BrewError::NotPaused);
        }

        self.phase = self.paused_from.take().unwrap_or(BrewPhase::Heating);
        // Time spent paused never counts against the hold
        self.last_tick = Some(now);
        self.pid.reset();
        info!(
            "Resumed in {} with {} s of hold left",
            self.phase.label(),
            self.hold_remaining_secs
        );
        Ok(BrewEvent::Resumed)
    }

    /// Operator confirmation to leave a holding step early
    pub fn continue_to_next_step(&mut self, now: u32) -> Result<Events, BrewError> {
        match self.phase {
            BrewPhase::Holding => {
                let mut events = Events::new();
                self.advance(now, &mut events);
                Ok(events)
            }
            BrewPhase::Heating => Err(BrewError::NotHolding),
            BrewPhase::Paused => Err(BrewError::IsPaused),
            BrewPhase::Idle => Err(BrewError::NotRunning),
        }
    }

    /// Move on regardless of temperature or timer
    pub fn skip_to_next_step(&mut self, now: u32) -> Result<Events, BrewError> {
        match self.phase {
            BrewPhase::Heating | BrewPhase::Holding => {
                info!("Skipping step {}", self.step_index);
                let mut events = Events::new();
                self.advance(now, &mut events);
                Ok(events)
            }
            BrewPhase::Paused => Err(BrewError::IsPaused),
            BrewPhase::Idle => Err(BrewError::NotRunning),
        }
    }

    pub fn stop(&mut self) -> Result<BrewEvent, BrewError> {
        if self.phase == BrewPhase::Idle {
            return Err(BrewError::NotRunning);
        }
        info!("Stopping brew at step {}", self.step_index);
        self.reset();
        Ok(BrewEvent::Stopped)
    }

    /// Evaluate one control tick.
    pub fn tick(&mut self, now: u32, readings: &[SensorReading]) -> TickOutput {
        let dt = self.last_tick.map_or(0, |last| now.saturating_sub(last));
        self.last_tick = Some(now);

        let control = control_average(readings);
        let mut out = TickOutput {
            control_temperature: control,
            ..TickOutput::default()
        };

        match self.phase {
            BrewPhase::Idle => return out,
            BrewPhase::Paused => {}
            BrewPhase::Heating => self.evaluate_heating(control, &mut out.events),
            BrewPhase::Holding => self.evaluate_holding(control, dt, now, &mut out.events),
        }

        // The schedule may have just finished
        let Some((target, boost)) = self.current_step().map(|s| (s.temperature, s.allow_boost))
        else {
            return out;
        };

        let Some(measured) = control else {
            warn!("No control temperature, heater off");
            return out;
        };

        if self.phase != BrewPhase::Paused {
            out.output_percent =
                if boost && self.phase == BrewPhase::Heating && measured < target - self.boost_band {
                    100
                } else {
                    self.pid.output(target, measured, dt as f32)
                };
        }

        out.point = Some(DataPoint {
            timestamp: now,
            avg_temperature: measured,
            target_temperature: target,
            output_percent: out.output_percent,
        });
        out
    }

    fn evaluate_heating(&mut self, control: Option<f32>, events: &mut Events) {
        let (Some(measured), Some(step)) = (control, self.current_step()) else {
            return;
        };
        if measured < step.temperature - self.tolerance {
            return;
        }

        let hold_secs = step.hold_secs();
        info!(
            "Step {} reached {:.1}°C, holding for {} s",
            self.step_index, measured, hold_secs
        );
        self.phase = BrewPhase::Holding;
        self.hold_remaining_secs = hold_secs;
        self.hold_frozen = false;
        emit(
            events,
            BrewEvent::HoldStarted {
                step: self.step_index as u8,
                hold_secs,
            },
        );
    }

    fn evaluate_holding(&mut self, control: Option<f32>, dt: u32, now: u32, events: &mut Events) {
        let Some(step) = self.current_step() else {
            return;
        };
        let in_band = control
            .map(|t| t >= step.temperature - self.tolerance && t <= step.temperature + self.tolerance);
        let timer_runs = !step.extend_if_needed || in_band == Some(true);

        if !timer_runs {
            if !self.hold_frozen {
                info!("Step {} out of band, extending hold", self.step_index);
                self.hold_frozen = true;
                emit(
                    events,
                    BrewEvent::HoldExtended {
                        step: self.step_index as u8,
                    },
                );
            }
            return;
        }

        self.hold_frozen = false;
        self.hold_remaining_secs = self.hold_remaining_secs.saturating_sub(dt);
        if self.hold_remaining_secs == 0 {
            self.advance(now, events);
        }
    }

    fn advance(&mut self, now: u32, events: &mut Events) {
        let finished = self.step_index;
        emit(
            events,
            BrewEvent::StepCompleted {
                step: finished as u8,
            },
        );

        let step_count = self.schedule.as_ref().map_or(0, |s| s.steps.len());
        if finished + 1 >= step_count {
            info!("Schedule complete after step {}", finished);
            self.reset();
            emit(events, BrewEvent::ScheduleComplete);
        } else {
            self.enter_step(finished + 1, now);
            emit(
                events,
                BrewEvent::StepStarted {
                    step: self.step_index as u8,
                },
            );
        }
    }

    fn enter_step(&mut self, index: usize, now: u32) {
        self.phase = BrewPhase::Heating;
        self.paused_from = None;
        self.step_index = index;
        self.hold_remaining_secs = 0;
        self.hold_frozen = false;
        self.last_tick = Some(now);
        self.pid.reset();
    }

    fn reset(&mut self) {
        self.phase = BrewPhase::Idle;
        self.paused_from = None;
        self.schedule = None;
        self.step_index = 0;
        self.hold_remaining_secs = 0;
        self.hold_frozen = false;
        self.last_tick = None;
        self.pid.reset();
    }
}
