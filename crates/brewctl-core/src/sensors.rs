//! Temperature probe interface and control averaging.
//!
//! Drivers (one-wire probes, RTD amplifiers) live in the firmware crate; the
//! core only sees their readings. A disconnected probe reports the sentinel
//! [`DISCONNECTED_C`], which must never be mistaken for a real temperature.

extern crate alloc;
use alloc::vec::Vec;

use log::warn;
use serde::Serialize;
use thiserror_no_std::Error;

/// Reading reported by one-wire probes that stopped answering
pub const DISCONNECTED_C: f32 = -127.0;

/// Maximum number of probes wired to the controller
pub const MAX_PROBES: usize = 8;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    #[error("{sensor} is disconnected")]
    Disconnected { sensor: &'static str },
    #[error("{sensor} read failed: {details}")]
    ReadFailed {
        sensor: &'static str,
        details: &'static str,
    },
    #[error("{sensor} reported a fault (code {code})")]
    Fault { sensor: &'static str, code: u8 },
}

/// A physical temperature probe.
pub trait TemperatureProbe {
    /// Short label used in logs and status output
    fn label(&self) -> &'static str;

    /// Read the current temperature in degrees Celsius.
    fn read_celsius(&mut self) -> impl Future<Output = Result<f32, SensorError>>;
}

/// One probe's value at a control tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    /// Position of the probe in the bank
    pub index: u8,
    pub celsius: f32,
    /// Whether the probe contributes to the control average
    pub use_for_control: bool,
}

impl SensorReading {
    pub const fn new(index: u8, celsius: f32, use_for_control: bool) -> Self {
        Self {
            index,
            celsius,
            use_for_control,
        }
    }

    pub const fn disconnected(index: u8, use_for_control: bool) -> Self {
        Self::new(index, DISCONNECTED_C, use_for_control)
    }

    /// True for the sentinel and for anything at or below it
    pub fn is_disconnected(&self) -> bool {
        self.celsius.is_nan() || self.celsius <= DISCONNECTED_C + 0.5
    }

    pub fn status(&self) -> SensorStatus {
        if self.is_disconnected() {
            SensorStatus::Disconnected
        } else {
            SensorStatus::Connected {
                celsius: self.celsius,
            }
        }
    }
}

/// Per-probe status shown on the dashboard
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SensorStatus {
    Connected { celsius: f32 },
    Disconnected,
}

/// Mean of the connected probes marked for control use.
///
/// Returns None if no such probe is connected.
pub fn control_average(readings: &[SensorReading]) -> Option<f32> {
    let (sum, count) = readings
        .iter()
        .filter(|r| r.use_for_control && !r.is_disconnected())
        .fold((0.0f32, 0u32), |(sum, count), r| (sum + r.celsius, count + 1));

    if count == 0 {
        None
    } else {
        Some(sum / count as f32)
    }
}

/// The probes wired to the controller, read in sequence each tick.
pub struct SensorBank<P> {
    probes: Vec<(P, bool)>,
}

impl<P> Default for SensorBank<P> {
    fn default() -> Self {
        Self { probes: Vec::new() }
    }
}

impl<P: TemperatureProbe> SensorBank<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a probe. Probes beyond [`MAX_PROBES`] are refused.
    pub fn add(&mut self, probe: P, use_for_control: bool) -> bool {
        if self.probes.len() >= MAX_PROBES {
            warn!("Probe bank full, ignoring {}", probe.label());
            return false;
        }
        self.probes.push((probe, use_for_control));
        true
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Read every probe. A failing probe is reported as disconnected rather
    /// than aborting the tick.
    pub async fn read_all(&mut self) -> heapless::Vec<SensorReading, MAX_PROBES> {
        let mut readings = heapless::Vec::new();

        for (index, (probe, use_for_control)) in self.probes.iter_mut().enumerate() {
            let reading = match probe.read_celsius().await {
                Ok(celsius) => SensorReading::new(index as u8, celsius, *use_for_control),
                Err(e) => {
                    warn!("Probe {} unavailable: {}", probe.label(), e);
                    SensorReading::disconnected(index as u8, *use_for_control)
                }
            };
            // Bounded by MAX_PROBES in `add`
            let _ = readings.push(reading);
        }

        readings
    }
}
