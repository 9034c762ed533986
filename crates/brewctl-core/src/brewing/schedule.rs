//! Mash schedules.
//!
//! The schedule executor owns the catalogue; the state machine only asks it
//! for a schedule by name when a brew starts or resumes.

extern crate alloc;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use crate::storage::record::{Name, name_from};

/// Maximum number of steps in one schedule
pub const MAX_STEPS: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MashStep {
    pub name: Name,
    /// Target temperature in °C
    pub temperature: f32,
    /// Hold duration once the target is reached
    pub duration_minutes: u16,
    /// Keep holding while the temperature is out of band instead of expiring
    #[serde(default)]
    pub extend_if_needed: bool,
    /// Drive the heater flat out while far below target
    #[serde(default)]
    pub allow_boost: bool,
}

impl MashStep {
    pub fn new(name: &str, temperature: f32, duration_minutes: u16) -> Self {
        Self {
            name: name_from(name),
            temperature,
            duration_minutes,
            extend_if_needed: false,
            allow_boost: false,
        }
    }

    pub fn extend_if_needed(mut self) -> Self {
        self.extend_if_needed = true;
        self
    }

    pub fn allow_boost(mut self) -> Self {
        self.allow_boost = true;
        self
    }

    pub fn hold_secs(&self) -> u32 {
        u32::from(self.duration_minutes) * 60
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MashSchedule {
    pub name: Name,
    pub steps: heapless::Vec<MashStep, MAX_STEPS>,
}

impl MashSchedule {
    pub fn new(name: &str) -> Self {
        Self {
            name: name_from(name),
            steps: heapless::Vec::new(),
        }
    }

    /// Append a step. Steps beyond [`MAX_STEPS`] are logged and dropped.
    pub fn with_step(mut self, step: MashStep) -> Self {
        if self.steps.push(step).is_err() {
            log::warn!("Schedule {} already has {} steps", self.name, MAX_STEPS);
        }
        self
    }

    pub fn step(&self, index: usize) -> Option<&MashStep> {
        self.steps.get(index)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Sum of all hold durations in seconds
    pub fn total_hold_secs(&self) -> u32 {
        self.steps.iter().map(MashStep::hold_secs).sum()
    }
}

/// Supplier of mash schedules by name
pub trait ScheduleSource {
    fn find(&self, name: &str) -> Option<MashSchedule>;
}

/// In-memory schedule catalogue
#[derive(Debug, Default, Clone)]
pub struct ScheduleBook {
    schedules: Vec<MashSchedule>,
}

impl ScheduleBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a schedule with the same name
    pub fn insert(&mut self, schedule: MashSchedule) {
        match self.schedules.iter_mut().find(|s| s.name == schedule.name) {
            Some(existing) => *existing = schedule,
            None => self.schedules.push(schedule),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.schedules.iter().map(|s| s.name.as_str())
    }
}

impl ScheduleSource for ScheduleBook {
    fn find(&self, name: &str) -> Option<MashSchedule> {
        self.schedules.iter().find(|s| s.name.as_str() == name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hold_secs() {
        assert_eq!(MashStep::new("Saccharification", 66.0, 60).hold_secs(), 3_600);
    }

    #[test]
    fn test_schedule_step_limit() {
        let mut schedule = MashSchedule::new("Long");
        for i in 0..MAX_STEPS + 2 {
            schedule = schedule.with_step(MashStep::new("s", 50.0 + i as f32, 1));
        }
        assert_eq!(schedule.steps.len(), MAX_STEPS);
        assert_eq!(schedule.total_hold_secs(), MAX_STEPS as u32 * 60);
    }

    #[test]
    fn test_book_replaces_by_name() {
        let mut book = ScheduleBook::new();
        book.insert(MashSchedule::new("Single").with_step(MashStep::new("a", 66.0, 60)));
        book.insert(MashSchedule::new("Single").with_step(MashStep::new("b", 67.0, 45)));

        assert_eq!(book.names().count(), 1);
        let found = book.find("Single").unwrap();
        assert_eq!(found.steps[0].name.as_str(), "b");
        assert!(book.find("Missing").is_none());
    }

    #[test]
    fn test_step_deserializes_with_default_flags() {
        let step: MashStep =
            serde_json::from_str(r#"{"name":"Beta","temperature":63.5,"durationMinutes":30}"#)
                .unwrap();
        assert_eq!(step.temperature, 63.5);
        assert!(!step.extend_if_needed);
        assert!(!step.allow_boost);
    }
}
