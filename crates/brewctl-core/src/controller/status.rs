use core::cell::Cell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use serde::Serialize;

use crate::brewing::{BrewEvent, BrewPhase};
use crate::sensors::{MAX_PROBES, SensorStatus};

/// Snapshot of the controller shown on the dashboard.
///
/// Plain `Copy` data so that it can be swapped atomically on the
/// [`StatusBoard`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrewStatus {
    pub phase: BrewPhase,
    /// Phase a resume returns to, only while paused
    pub paused_from: Option<BrewPhase>,
    pub session_id: Option<u32>,
    pub step_index: Option<u8>,
    pub step_count: u8,
    pub target_temperature: Option<f32>,
    pub control_temperature: Option<f32>,
    pub output_percent: u8,
    pub hold_remaining_secs: u32,
    pub data_points: u32,
    /// Status of each probe slot, None for unused slots
    pub sensors: [Option<SensorStatus>; MAX_PROBES],
    pub last_event: Option<BrewEvent>,
    pub updated_at: u32,
}

impl BrewStatus {
    pub const IDLE: Self = Self {
        phase: BrewPhase::Idle,
        paused_from: None,
        session_id: None,
        step_index: None,
        step_count: 0,
        target_temperature: None,
        control_temperature: None,
        output_percent: 0,
        hold_remaining_secs: 0,
        data_points: 0,
        sensors: [None; MAX_PROBES],
        last_event: None,
        updated_at: 0,
    };
}

impl Default for BrewStatus {
    fn default() -> Self {
        Self::IDLE
    }
}

/// Latest [`BrewStatus`], shared between the control loop and API handlers.
///
/// The controller publishes after every tick and command; readers always get
/// a complete snapshot, never a half-updated one.
pub struct StatusBoard {
    inner: Mutex<CriticalSectionRawMutex, Cell<BrewStatus>>,
}

impl StatusBoard {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Cell::new(BrewStatus::IDLE)),
        }
    }

    pub fn publish(&self, status: BrewStatus) {
        self.inner.lock(|cell| cell.set(status));
    }

    pub fn snapshot(&self) -> BrewStatus {
        self.inner.lock(|cell| cell.get())
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}
