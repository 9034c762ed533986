//! The brew controller context.
//!
//! [`BrewController`] is the one object the run loop owns. It ties the state
//! machine, the session recorder and the schedule catalogue together:
//!
//! - [`BrewController::tick`] runs every control period. It evaluates the
//!   state machine, buffers samples and returns the heater output. It never
//!   writes to storage, so a slow flash never delays heater control.
//! - [`BrewController::housekeeping`] runs at a lower rate and does all of
//!   the storage work: finalizing a completed brew and periodic checkpoints.
//! - Commands (start, stop, pause, ...) are applied immediately, so a stop
//!   or pause is in effect before the next tick evaluates a transition.
//!
//! In firmware the controller sits behind a [`SharedController`] mutex so
//! that API handlers can run commands from another task.

mod checkpoint;
mod status;

pub use checkpoint::{BrewCheckpoint, CHECKPOINT_VERSION, CheckpointError};
pub use status::{BrewStatus, StatusBoard};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex as AsyncMutex;
use embedded_hal::delay::DelayNs;
use log::{error, info, warn};

use crate::brewing::{
    BrewError, BrewEvent, BrewPhase, BrewProgress, BrewStateMachine, ScheduleSource,
};
use crate::config::ControllerConfig;
use crate::recorder::SessionRecorder;
use crate::sensors::{MAX_PROBES, SensorReading, SensorStatus};
use crate::storage::{BrewSession, KvStore, SessionStore, StoreError};

pub struct BrewController<'a, K, D, S>
where
    K: KvStore,
    D: DelayNs,
    S: ScheduleSource,
{
    config: ControllerConfig,
    machine: BrewStateMachine,
    recorder: SessionRecorder<K, D>,
    schedules: S,
    status: &'a StatusBoard,
    sensors: [Option<SensorStatus>; MAX_PROBES],
    control_temperature: Option<f32>,
    output_percent: u8,
    last_event: Option<BrewEvent>,
    last_recorded: Option<u32>,
    last_checkpoint: Option<u32>,
    /// The schedule finished during a tick; housekeeping ends the session
    finish_pending: bool,
}

pub type SharedController<'a, K, D, S> =
    AsyncMutex<CriticalSectionRawMutex, BrewController<'a, K, D, S>>;

impl<'a, K, D, S> BrewController<'a, K, D, S>
where
    K: KvStore,
    D: DelayNs,
    S: ScheduleSource,
{
    pub fn new(
        config: ControllerConfig,
        store: SessionStore<K, D>,
        schedules: S,
        status: &'a StatusBoard,
    ) -> Self {
        Self {
            machine: BrewStateMachine::new(&config),
            recorder: SessionRecorder::new(store, config.max_samples),
            config,
            schedules,
            status,
            sensors: [None; MAX_PROBES],
            control_temperature: None,
            output_percent: 0,
            last_event: None,
            last_recorded: None,
            last_checkpoint: None,
            finish_pending: false,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn machine(&self) -> &BrewStateMachine {
        &self.machine
    }

    pub fn recorder(&self) -> &SessionRecorder<K, D> {
        &self.recorder
    }

    pub fn store(&self) -> &SessionStore<K, D> {
        self.recorder.store()
    }

    pub fn store_mut(&mut self) -> &mut SessionStore<K, D> {
        self.recorder.store_mut()
    }

    pub fn schedules_mut(&mut self) -> &mut S {
        &mut self.schedules
    }

    /// Hand back the store, dropping all in-memory brew state
    pub fn into_store(self) -> SessionStore<K, D> {
        self.recorder.into_store()
    }

    /// One control period. Returns the heater output in percent.
    pub fn tick(&mut self, now: u32, readings: &[SensorReading]) -> u8 {
        let out = self.machine.tick(now, readings);
        self.note_events(&out.events);

        self.sensors = [None; MAX_PROBES];
        for reading in readings {
            if let Some(slot) = self.sensors.get_mut(usize::from(reading.index)) {
                *slot = Some(reading.status());
            }
        }
        self.control_temperature = out.control_temperature;
        self.output_percent = out.output_percent;

        if let Some(point) = out.point {
            let interval = self.config.record_interval_secs;
            let due = self
                .last_recorded
                .is_none_or(|last| now.saturating_sub(last) >= interval);
            if due {
                self.recorder.add_data_point(
                    point.timestamp,
                    point.avg_temperature,
                    point.target_temperature,
                    point.output_percent,
                );
                self.last_recorded = Some(now);
            }
        }

        self.publish(now);
        out.output_percent
    }

    /// Storage work deferred from the control tick.
    pub fn housekeeping(&mut self, now: u32) {
        if self.finish_pending {
            self.finish_pending = false;
            info!("Schedule finished, closing session");
            self.recorder.end_session(now);
            self.last_checkpoint = None;
        } else if self.machine.phase().is_running() {
            let interval = self.config.checkpoint_interval_secs;
            let due = self
                .last_checkpoint
                .is_none_or(|last| now.saturating_sub(last) >= interval);
            if due {
                self.checkpoint(now);
            }
        }
        self.publish(now);
    }

    /// Persist the running session and the machine position.
    pub fn checkpoint(&mut self, now: u32) {
        let (Some(session_id), Some(schedule)) = (self.recorder.active_id(), self.machine.schedule())
        else {
            return;
        };
        self.last_checkpoint = Some(now);

        let state = BrewCheckpoint::new(
            session_id,
            schedule.clone(),
            self.machine.progress(),
            self.recorder.stride(),
            now,
        );
        match state.to_bytes() {
            Ok(blob) => {
                if let Err(e) = self.recorder.store_mut().write_checkpoint(&blob) {
                    error!("Failed to write brew checkpoint: {}", e);
                }
            }
            Err(e) => error!("{}", e),
        }

        if let Err(e) = self.recorder.checkpoint(now) {
            error!("Failed to checkpoint session {}: {}", session_id, e);
        }
    }

    /// Start `schedule_name` as a new recorded session, ending any active one.
    pub fn start_brew(
        &mut self,
        schedule_name: &str,
        session_name: &str,
        now: u32,
    ) -> Result<u32, BrewError> {
        let result = self.try_start_brew(schedule_name, session_name, now);
        self.publish(now);
        result
    }

    fn try_start_brew(
        &mut self,
        schedule_name: &str,
        session_name: &str,
        now: u32,
    ) -> Result<u32, BrewError> {
        let schedule = self
            .schedules
            .find(schedule_name)
            .ok_or(BrewError::ScheduleNotFound)?;
        let events = self.machine.start(schedule, now)?;
        self.note_events(&events);

        let id = self.recorder.start_session(schedule_name, session_name, now);
        self.finish_pending = false;
        self.last_recorded = None;
        self.checkpoint(now);
        Ok(id)
    }

    /// Stop heating and close the active session.
    ///
    /// Also closes a session whose schedule already finished but which
    /// housekeeping has not ended yet.
    pub fn stop_brew(&mut self, now: u32) -> Result<Option<BrewSession>, BrewError> {
        let stopped = self.machine.stop();
        if let Ok(event) = stopped {
            self.note_events(&[event]);
        }
        self.finish_pending = false;
        self.last_checkpoint = None;
        self.output_percent = 0;

        let ended = self.recorder.end_session(now);
        self.publish(now);
        match (stopped, ended) {
            (Err(e), None) => Err(e),
            (_, ended) => Ok(ended),
        }
    }

    pub fn pause(&mut self, now: u32) -> Result<(), BrewError> {
        let result = self.machine.pause().map(|event| {
            self.output_percent = 0;
            self.note_events(&[event]);
        });
        self.publish(now);
        result
    }

    pub fn resume(&mut self, now: u32) -> Result<(), BrewError> {
        let result = self
            .machine
            .resume(now)
            .map(|event| self.note_events(&[event]));
        self.publish(now);
        result
    }

    /// Resume a paused brew, otherwise start `schedule_name` fresh.
    pub fn start_or_resume(&mut self, schedule_name: &str, now: u32) -> Result<u32, BrewError> {
        if self.machine.phase() == BrewPhase::Paused {
            self.resume(now)?;
            return self.recorder.active_id().ok_or(BrewError::NotRunning);
        }
        self.start_brew(schedule_name, "", now)
    }

    pub fn continue_to_next_step(&mut self, now: u32) -> Result<(), BrewError> {
        let result = self
            .machine
            .continue_to_next_step(now)
            .map(|events| self.note_events(&events));
        self.publish(now);
        result
    }

    pub fn skip_to_next_step(&mut self, now: u32) -> Result<(), BrewError> {
        let result = self
            .machine
            .skip_to_next_step(now)
            .map(|events| self.note_events(&events));
        self.publish(now);
        result
    }

    /// Bring back an interrupted session. The brew comes back paused.
    ///
    /// The machine position comes from the `brew_state` checkpoint when it
    /// belongs to `id`; otherwise the session's schedule restarts from its
    /// first step.
    pub fn continue_session(&mut self, id: u32, now: u32) -> Result<(), BrewError> {
        let result = self.try_continue_session(id, now);
        self.publish(now);
        result
    }

    fn try_continue_session(&mut self, id: u32, now: u32) -> Result<(), BrewError> {
        let already_active = self.recorder.active_id() == Some(id);
        if already_active && self.machine.phase().is_running() {
            return Ok(());
        }

        // Everything is checked before the running brew is touched
        let schedule_name = match self.recorder.active_session().filter(|_| already_active) {
            Some(active) => active.schedule_name.clone(),
            None => {
                let record = self.recorder.store().session_by_id(id);
                if record.is_sentinel() {
                    return Err(BrewError::SessionNotFound(id));
                }
                if record.completed {
                    return Err(BrewError::SessionCompleted(id));
                }
                record.schedule_name
            }
        };

        let saved = self
            .recorder
            .store()
            .read_checkpoint()
            .and_then(|blob| match BrewCheckpoint::from_bytes(&blob) {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!("Ignoring brew checkpoint: {}", e);
                    None
                }
            })
            .filter(|state| state.session_id == id);

        let (schedule, progress, stride) = match saved {
            Some(state) => (state.schedule, state.progress, state.sample_stride),
            None => {
                let schedule = self
                    .schedules
                    .find(&schedule_name)
                    .ok_or(BrewError::ScheduleNotFound)?;
                let progress = BrewProgress {
                    phase: BrewPhase::Heating,
                    paused_from: None,
                    step_index: 0,
                    hold_remaining_secs: 0,
                };
                (schedule, progress, 1)
            }
        };
        BrewStateMachine::check_restore(&schedule, &progress)?;

        if self.machine.phase().is_running() {
            let event = self.machine.stop()?;
            self.note_events(&[event]);
        }
        self.output_percent = 0;
        // Ends any other active session, sparing `id` from retention cleanup
        self.recorder.resume_session(id, stride, now)?;
        self.machine.restore(schedule, progress, now)?;

        self.finish_pending = false;
        self.last_recorded = None;
        self.last_event = Some(BrewEvent::Paused);
        self.checkpoint(now);
        Ok(())
    }

    /// Boot-time recovery from the `brew_state` checkpoint.
    ///
    /// Returns the resumed session id. A checkpoint that cannot be used is
    /// cleared so the next boot does not trip over it again.
    pub fn restore_interrupted(&mut self, now: u32) -> Option<u32> {
        let blob = self.recorder.store().read_checkpoint()?;
        let state = match BrewCheckpoint::from_bytes(&blob) {
            Ok(state) => state,
            Err(e) => {
                warn!("Discarding brew checkpoint: {}", e);
                self.recorder.store_mut().clear_checkpoint();
                return None;
            }
        };

        let id = state.session_id;
        match self.continue_session(id, now) {
            Ok(()) => {
                info!("Recovered interrupted session {} (paused)", id);
                Some(id)
            }
            Err(e) => {
                warn!("Cannot recover session {}: {}", id, e);
                self.recorder.store_mut().clear_checkpoint();
                None
            }
        }
    }

    /// Change the retention cap, never evicting the active session.
    pub fn set_max_sessions(&mut self, max: u8) -> Result<usize, StoreError> {
        let protect = self.recorder.active_id();
        self.recorder.store_mut().set_max_sessions(max, protect)
    }

    pub fn status(&self, now: u32) -> BrewStatus {
        let running = self.machine.phase().is_running();
        BrewStatus {
            phase: self.machine.phase(),
            paused_from: self.machine.paused_from(),
            session_id: self.recorder.active_id(),
            step_index: running.then(|| self.machine.step_index() as u8),
            step_count: self.machine.schedule().map_or(0, |s| s.steps.len() as u8),
            target_temperature: self.machine.target_temperature(),
            control_temperature: self.control_temperature,
            output_percent: self.output_percent,
            hold_remaining_secs: self.machine.hold_remaining_secs(),
            data_points: self.recorder.data_points() as u32,
            sensors: self.sensors,
            last_event: self.last_event,
            updated_at: now,
        }
    }

    fn publish(&self, now: u32) {
        self.status.publish(self.status(now));
    }

    fn note_events(&mut self, events: &[BrewEvent]) {
        for event in events {
            match event {
                BrewEvent::ScheduleComplete => {
                    info!("Mash schedule complete");
                    self.finish_pending = true;
                    self.output_percent = 0;
                }
                BrewEvent::StepStarted { step } => info!("Step {} started", step),
                BrewEvent::HoldStarted { step, hold_secs } => {
                    info!("Step {} holding for {} s", step, hold_secs)
                }
                _ => {}
            }
            self.last_event = Some(*event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brewing::{MashSchedule, MashStep, ScheduleBook};
    use crate::storage::{MemoryKvStore, NoDelay, RetryPolicy};

    type Controller<'a> = BrewController<'a, MemoryKvStore, NoDelay, ScheduleBook>;

    fn book() -> ScheduleBook {
        let mut book = ScheduleBook::new();
        book.insert(
            MashSchedule::new("Single Infusion").with_step(MashStep::new("Sacch", 66.0, 1)),
        );
        book.insert(
            MashSchedule::new("Step Mash")
                .with_step(MashStep::new("Protein", 52.0, 10))
                .with_step(MashStep::new("Sacch", 66.0, 60)),
        );
        book.insert(MashSchedule::new("Empty"));
        book
    }

    fn controller(board: &StatusBoard) -> Controller<'_> {
        let config = ControllerConfig {
            record_interval_secs: 10,
            ..ControllerConfig::default()
        };
        let store = SessionStore::new(MemoryKvStore::new(), NoDelay, RetryPolicy::default());
        BrewController::new(config, store, book(), board)
    }

    fn at(celsius: f32) -> [SensorReading; 1] {
        [SensorReading::new(0, celsius, true)]
    }

    #[test]
    fn test_full_brew_closes_session_in_housekeeping() {
        let board = StatusBoard::new();
        let mut ctl = controller(&board);
        let id = ctl.start_brew("Single Infusion", "Friday IPA", 0).unwrap();

        ctl.tick(10, &at(60.0));
        ctl.tick(20, &at(66.0));
        assert_eq!(ctl.machine().phase(), BrewPhase::Holding);

        ctl.tick(80, &at(66.0));
        assert_eq!(ctl.machine().phase(), BrewPhase::Idle);
        // The tick itself leaves the session open
        assert_eq!(ctl.recorder().active_id(), Some(id));
        assert_eq!(board.snapshot().last_event, Some(BrewEvent::ScheduleComplete));

        ctl.housekeeping(90);
        assert!(!ctl.recorder().is_active());
        let stored = ctl.store().session_by_id(id);
        assert!(stored.completed);
        assert_eq!(stored.name.as_str(), "Friday IPA");
        assert_eq!(stored.sample_count, 2);
        assert!(ctl.store().read_checkpoint().is_none());
    }

    #[test]
    fn test_tick_never_writes_storage() {
        let board = StatusBoard::new();
        let mut ctl = controller(&board);
        ctl.start_brew("Step Mash", "", 0).unwrap();

        let writes = ctl.store().kv().write_count();
        for t in 1..50 {
            ctl.tick(t * 10, &at(40.0));
        }
        assert_eq!(ctl.store().kv().write_count(), writes);
    }

    #[test]
    fn test_unknown_and_empty_schedules_are_rejected() {
        let board = StatusBoard::new();
        let mut ctl = controller(&board);
        assert_eq!(
            ctl.start_brew("Missing", "", 0).unwrap_err(),
            BrewError::ScheduleNotFound
        );
        assert_eq!(
            ctl.start_brew("Empty", "", 0).unwrap_err(),
            BrewError::EmptySchedule
        );
        assert!(!ctl.recorder().is_active());
        assert_eq!(board.snapshot().phase, BrewPhase::Idle);
    }

    #[test]
    fn test_stop_is_immediate() {
        let board = StatusBoard::new();
        let mut ctl = controller(&board);
        let id = ctl.start_brew("Step Mash", "", 0).unwrap();
        ctl.tick(10, &at(45.0));

        let ended = ctl.stop_brew(15).unwrap().unwrap();
        assert_eq!(ended.session_id, id);
        assert_eq!(board.snapshot().phase, BrewPhase::Idle);
        assert_eq!(board.snapshot().output_percent, 0);
        assert_eq!(ctl.tick(20, &at(45.0)), 0);
        assert_eq!(ctl.stop_brew(30).unwrap_err(), BrewError::NotRunning);
    }

    #[test]
    fn test_pause_zeroes_output_and_records() {
        let board = StatusBoard::new();
        let mut ctl = controller(&board);
        ctl.start_brew("Step Mash", "", 0).unwrap();
        assert!(ctl.tick(10, &at(30.0)) > 0);

        ctl.pause(11).unwrap();
        assert_eq!(board.snapshot().output_percent, 0);
        assert_eq!(ctl.tick(30, &at(31.0)), 0);
        assert_eq!(ctl.recorder().data_points(), 2);

        assert_eq!(ctl.start_or_resume("ignored", 40).unwrap(), 1);
        assert_eq!(ctl.machine().phase(), BrewPhase::Heating);
    }

    #[test]
    fn test_restore_after_power_loss() {
        let board = StatusBoard::new();
        let mut ctl = controller(&board);
        let id = ctl.start_brew("Step Mash", "", 0).unwrap();
        ctl.tick(10, &at(52.0));
        ctl.tick(130, &at(52.0));
        assert_eq!(ctl.machine().hold_remaining_secs(), 480);
        ctl.checkpoint(130);

        let store = ctl.into_store();
        let board = StatusBoard::new();
        let mut ctl = BrewController::new(ControllerConfig::default(), store, book(), &board);

        assert_eq!(ctl.restore_interrupted(1_000), Some(id));
        assert_eq!(ctl.machine().phase(), BrewPhase::Paused);
        assert_eq!(ctl.machine().hold_remaining_secs(), 480);
        assert_eq!(board.snapshot().session_id, Some(id));

        ctl.resume(1_010).unwrap();
        assert_eq!(ctl.machine().phase(), BrewPhase::Holding);
    }

    #[test]
    fn test_restore_without_checkpoint() {
        let board = StatusBoard::new();
        let mut ctl = controller(&board);
        assert_eq!(ctl.restore_interrupted(0), None);
    }

    #[test]
    fn test_garbage_checkpoint_is_cleared() {
        let board = StatusBoard::new();
        let mut ctl = controller(&board);
        ctl.store_mut().write_checkpoint(&[1, 2]).unwrap();
        assert_eq!(ctl.restore_interrupted(0), None);
        assert!(ctl.store().read_checkpoint().is_none());
    }

    /// Session 1 interrupted by a power loss, session 2 now heating
    fn interrupted_then_running(board: &StatusBoard) -> (Controller<'_>, u32, u32) {
        let mut ctl = controller(board);
        let interrupted = ctl.start_brew("Step Mash", "Lost power", 0).unwrap();
        ctl.tick(10, &at(45.0));
        ctl.checkpoint(10);

        let store = ctl.into_store();
        let config = ControllerConfig {
            record_interval_secs: 10,
            ..ControllerConfig::default()
        };
        let mut ctl = BrewController::new(config, store, book(), board);
        let running = ctl.start_brew("Step Mash", "", 100).unwrap();
        assert!(ctl.tick(110, &at(40.0)) > 0);
        (ctl, interrupted, running)
    }

    #[test]
    fn test_continue_completed_session_keeps_running_brew() {
        let board = StatusBoard::new();
        let mut ctl = controller(&board);
        let done = ctl.start_brew("Step Mash", "", 0).unwrap();
        ctl.stop_brew(50).unwrap();
        let running = ctl.start_brew("Step Mash", "", 100).unwrap();
        assert!(ctl.tick(110, &at(40.0)) > 0);
        let points = ctl.recorder().data_points();

        assert_eq!(
            ctl.continue_session(done, 115).unwrap_err(),
            BrewError::SessionCompleted(done)
        );
        assert_eq!(ctl.machine().phase(), BrewPhase::Heating);
        assert_eq!(ctl.recorder().active_id(), Some(running));
        assert!(ctl.tick(120, &at(40.0)) > 0);
        assert_eq!(ctl.recorder().data_points(), points + 1);
        assert_eq!(
            ctl.continue_session(99, 125).unwrap_err(),
            BrewError::SessionNotFound(99)
        );
        assert_eq!(board.snapshot().session_id, Some(running));
    }

    #[test]
    fn test_continue_with_bad_checkpoint_keeps_running_brew() {
        let board = StatusBoard::new();
        let (mut ctl, interrupted, running) = interrupted_then_running(&board);

        let bad = BrewCheckpoint::new(
            interrupted,
            MashSchedule::new("Step Mash").with_step(MashStep::new("Protein", 52.0, 10)),
            BrewProgress {
                phase: BrewPhase::Holding,
                paused_from: None,
                step_index: 5,
                hold_remaining_secs: 60,
            },
            1,
            90,
        );
        ctl.store_mut()
            .write_checkpoint(&bad.to_bytes().unwrap())
            .unwrap();

        assert_eq!(
            ctl.continue_session(interrupted, 115).unwrap_err(),
            BrewError::InvalidCheckpoint
        );
        assert_eq!(ctl.machine().phase(), BrewPhase::Heating);
        assert_eq!(ctl.recorder().active_id(), Some(running));
        assert!(!ctl.store().session_by_id(interrupted).completed);
    }

    #[test]
    fn test_continue_interrupted_session_ends_running_brew() {
        let board = StatusBoard::new();
        let (mut ctl, interrupted, running) = interrupted_then_running(&board);

        ctl.continue_session(interrupted, 120).unwrap();
        assert_eq!(ctl.machine().phase(), BrewPhase::Paused);
        assert_eq!(ctl.recorder().active_id(), Some(interrupted));
        assert_eq!(board.snapshot().session_id, Some(interrupted));
        assert_eq!(board.snapshot().output_percent, 0);

        let ended = ctl.store().session_by_id(running);
        assert!(ended.completed);
        assert_eq!(ended.end_time, 120);
    }

    #[test]
    fn test_checkpoint_carries_recorder_stride() {
        let board = StatusBoard::new();
        let mut ctl = controller(&board);
        let id = ctl.start_brew("Step Mash", "", 0).unwrap();
        ctl.checkpoint(5);

        let blob = ctl.store().read_checkpoint().unwrap();
        let state = BrewCheckpoint::from_bytes(&blob).unwrap();
        assert_eq!(state.session_id, id);
        assert_eq!(state.sample_stride, ctl.recorder().stride());
    }

    #[test]
    fn test_lowering_cap_spares_active_session() {
        let board = StatusBoard::new();
        let mut ctl = controller(&board);
        for start in [0, 100] {
            ctl.start_brew("Single Infusion", "", start).unwrap();
            ctl.stop_brew(start + 50).unwrap();
        }
        let active = ctl.start_brew("Single Infusion", "", 200).unwrap();
        ctl.checkpoint(210);

        assert_eq!(ctl.set_max_sessions(1).unwrap(), 1);
        assert!(!ctl.store().session_by_id(active).is_sentinel());
        assert!(ctl.store().session_by_id(1).is_sentinel());
    }
}
