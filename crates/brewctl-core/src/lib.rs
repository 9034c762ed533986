//! Hardware-independent core of the brewctl mash controller.
//!
//! This crate holds everything that does not touch a peripheral: the brew
//! state machine and its schedules, heater PID, session recording and the
//! flash-backed session history, plus the JSON command surface used by the
//! web dashboard. It is `no_std` + `alloc` and builds on the host, where the
//! simulator and the test suite drive it against an in-memory store.

#![no_std]

extern crate alloc;

pub mod api;
pub mod brewing;
pub mod config;
pub mod controller;
pub mod recorder;
pub mod sensors;
pub mod storage;

pub use config::ControllerConfig;
pub use controller::{BrewController, BrewStatus, StatusBoard};
pub use recorder::SessionRecorder;
