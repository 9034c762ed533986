//! Desktop simulator for the brewctl mash controller.
//!
//! Drives brewctl-core against a modelled mash tun in accelerated time: one
//! loop iteration is one simulated second. The run exercises the dashboard
//! API the way the web UI would:
//!
//! 1. Start a step-mash session
//! 2. Pause for a few minutes, then resume
//! 3. Lose a probe for a while (disconnected sentinel)
//! 4. Cut power mid-rest and recover from the flash checkpoint
//! 5. Finish the schedule and print history, statistics and a CSV export
//!
//! Run with `RUST_LOG=info` (or `debug`) to see the controller's log.

use std::cell::Cell;

use log::{info, warn};

use brewctl_core::api::handle_json;
use brewctl_core::brewing::{BrewPhase, MashSchedule, MashStep, ScheduleBook};
use brewctl_core::controller::SharedController;
use brewctl_core::sensors::{SensorBank, SensorError, TemperatureProbe};
use brewctl_core::storage::{MemoryKvStore, NoDelay, SessionStore};
use brewctl_core::{BrewController, ControllerConfig, StatusBoard};

// ---------------------------------------------------------------------------
// Simulation constants
// ---------------------------------------------------------------------------

/// Flash budget of the simulated store, roughly one NVS partition
const FLASH_CAPACITY_BYTES: usize = 96 * 1024;

/// Simulated seconds between housekeeping passes
const HOUSEKEEPING_INTERVAL_SECS: u32 = 10;

/// Simulated seconds between status lines
const REPORT_INTERVAL_SECS: u32 = 300;

/// Give up if the schedule has not finished after this long
const MAX_RUN_SECS: u32 = 6 * 3_600;

/// Power is cut this many seconds into the saccharification rest
const POWER_CUT_INTO_REST_SECS: u32 = 600;

/// Window during which the second probe reads as disconnected
const PROBE_DROPOUT_SECS: core::ops::Range<u32> = 900..1_200;

// ---------------------------------------------------------------------------
// Mash tun model
// ---------------------------------------------------------------------------

/// Lumped thermal model of a kettle with an electric element.
struct MashTun {
    water_c: Cell<f32>,
    ambient_c: f32,
    element_watts: f32,
    /// Water mass times specific heat, J/K
    heat_capacity: f32,
    /// Heat loss to ambient, W/K
    loss_w_per_k: f32,
}

impl MashTun {
    fn new() -> Self {
        Self {
            water_c: Cell::new(18.0),
            ambient_c: 18.0,
            element_watts: 3_500.0,
            // 25 l of strike water
            heat_capacity: 25.0 * 4_186.0,
            loss_w_per_k: 6.0,
        }
    }

    fn step(&self, output_percent: u8, dt_secs: f32) {
        let water = self.water_c.get();
        let power = self.element_watts * f32::from(output_percent) / 100.0
            - self.loss_w_per_k * (water - self.ambient_c);
        self.water_c.set(water + power * dt_secs / self.heat_capacity);
    }
}

/// Probe reading the modelled water with a fixed offset and slow ripple.
struct SimulatedProbe<'a> {
    label: &'static str,
    tun: &'a MashTun,
    clock: &'a Cell<u32>,
    offset_c: f32,
    dropout: Option<core::ops::Range<u32>>,
}

impl TemperatureProbe for SimulatedProbe<'_> {
    fn label(&self) -> &'static str {
        self.label
    }

    async fn read_celsius(&mut self) -> Result<f32, SensorError> {
        let now = self.clock.get();
        if self.dropout.as_ref().is_some_and(|r| r.contains(&now)) {
            return Err(SensorError::Disconnected { sensor: self.label });
        }
        let ripple = 0.1 * (now as f32 / 45.0).sin();
        Ok(self.tun.water_c.get() + self.offset_c + ripple)
    }
}

// ---------------------------------------------------------------------------
// Setup helpers
// ---------------------------------------------------------------------------

fn schedule_book() -> ScheduleBook {
    let mut book = ScheduleBook::new();
    book.insert(
        MashSchedule::new("Single Infusion")
            .with_step(MashStep::new("Saccharification", 66.0, 60).allow_boost())
            .with_step(MashStep::new("Mash Out", 76.0, 10)),
    );
    book.insert(
        MashSchedule::new("Hefeweizen Step")
            .with_step(MashStep::new("Ferulic Rest", 44.0, 15).allow_boost())
            .with_step(MashStep::new("Protein Rest", 52.0, 15))
            .with_step(MashStep::new("Saccharification", 65.0, 45).extend_if_needed())
            .with_step(MashStep::new("Mash Out", 76.0, 10)),
    );
    book
}

fn config() -> ControllerConfig {
    ControllerConfig {
        checkpoint_interval_secs: 120,
        ..ControllerConfig::default()
    }
}

/// Send one JSON command through the shared controller and log the reply.
fn api(
    shared: &SharedController<'_, MemoryKvStore, NoDelay, ScheduleBook>,
    body: &str,
    now: u32,
) -> String {
    let mut controller = embassy_futures::block_on(shared.lock());
    let reply = handle_json(&mut *controller, body, now);
    info!("API {} -> {}", body, reply);
    reply
}

fn print_section(title: &str, body: &str) {
    println!();
    println!("=== {} ===", title);
    println!("{}", body);
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    env_logger::init();
    info!("Starting brewctl simulator");

    let tun = MashTun::new();
    let clock = Cell::new(0u32);

    let mut bank = SensorBank::new();
    bank.add(
        SimulatedProbe {
            label: "mash-top",
            tun: &tun,
            clock: &clock,
            offset_c: 0.3,
            dropout: None,
        },
        true,
    );
    bank.add(
        SimulatedProbe {
            label: "mash-bottom",
            tun: &tun,
            clock: &clock,
            offset_c: -0.4,
            dropout: Some(PROBE_DROPOUT_SECS),
        },
        true,
    );
    bank.add(
        SimulatedProbe {
            label: "ambient",
            tun: &tun,
            clock: &clock,
            offset_c: 0.0,
            dropout: None,
        },
        false,
    );

    let board = StatusBoard::new();
    let config = config();
    let store = SessionStore::new(
        MemoryKvStore::with_capacity(FLASH_CAPACITY_BYTES),
        NoDelay,
        config.retry,
    );
    let mut shared =
        SharedController::new(BrewController::new(config, store, schedule_book(), &board));

    // Nothing to recover on a fresh store
    if let Some(id) = embassy_futures::block_on(shared.lock()).restore_interrupted(0) {
        warn!("Unexpected checkpoint for session {}", id);
    }

    api(
        &shared,
        r#"{"command":"StartBrewSession","data":{"sessionName":"Simulated Weizen","selectedMashSchedule":"Hefeweizen Step"}}"#,
        0,
    );

    let mut paused_once = false;
    let mut power_cut = false;
    let mut rest_started: Option<u32> = None;

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------
    for now in 1..=MAX_RUN_SECS {
        clock.set(now);

        // --- Control tick ----------------------------------------------------
        let readings = embassy_futures::block_on(bank.read_all());
        let output = embassy_futures::block_on(shared.lock()).tick(now, &readings);
        tun.step(output, 1.0);

        if now % HOUSEKEEPING_INTERVAL_SECS == 0 {
            embassy_futures::block_on(shared.lock()).housekeeping(now);
        }

        let status = board.snapshot();

        // --- Scripted operator actions ----------------------------------------
        if !paused_once && status.phase == BrewPhase::Holding && status.step_index == Some(0) {
            paused_once = true;
            api(&shared, r#"{"command":"Pause"}"#, now);
        }
        // Resume the first pause on the next three-minute mark
        if status.phase == BrewPhase::Paused && rest_started.is_none() && now % 180 == 0 {
            api(
                &shared,
                r#"{"command":"Start","data":{"selectedMashSchedule":"Hefeweizen Step"}}"#,
                now,
            );
        }

        if status.phase == BrewPhase::Holding && status.step_index == Some(2) {
            let started = *rest_started.get_or_insert(now);
            if !power_cut && now - started >= POWER_CUT_INTO_REST_SECS {
                power_cut = true;
                warn!("Power cut at {} s ({:.1}°C)", now, tun.water_c.get());

                // Everything in RAM is lost, the flash store survives
                let store = shared.into_inner().into_store();
                shared = SharedController::new(BrewController::new(
                    config,
                    store,
                    schedule_book(),
                    &board,
                ));

                let mut controller = embassy_futures::block_on(shared.lock());
                match controller.restore_interrupted(now) {
                    Some(id) => info!("Recovered session {} after power cut", id),
                    None => warn!("Nothing to recover"),
                }
                drop(controller);
                api(&shared, r#"{"command":"Start"}"#, now);
            }
        }

        // --- Reporting --------------------------------------------------------
        if now % REPORT_INTERVAL_SECS == 0 {
            info!(
                "t={:>5}s {:>8} step {:?} water {:5.1}°C target {:?} out {:3}% points {}",
                now,
                status.phase.label(),
                status.step_index,
                tun.water_c.get(),
                status.target_temperature,
                status.output_percent,
                status.data_points
            );
        }

        if power_cut && status.phase == BrewPhase::Idle && status.session_id.is_none() {
            info!("Schedule finished at {} s", now);
            break;
        }
    }

    // -----------------------------------------------------------------------
    // Results
    // -----------------------------------------------------------------------
    let end = clock.get();
    if embassy_futures::block_on(shared.lock()).recorder().is_active() {
        warn!("Schedule did not finish in {} s, stopping", MAX_RUN_SECS);
        api(&shared, r#"{"command":"StopBrewSession"}"#, end);
    }

    print_section(
        "Session history",
        &api(&shared, r#"{"command":"GetSessionHistory"}"#, end),
    );
    print_section(
        "Statistics",
        &api(&shared, r#"{"command":"GetStatistics"}"#, end),
    );

    let controller = embassy_futures::block_on(shared.lock());
    print_section("CSV export", &controller.store().export_session_csv(1));
    info!(
        "Flash in use: {} of {} bytes",
        controller.store().kv().used_bytes(),
        FLASH_CAPACITY_BYTES
    );
    info!("Simulator exiting");
}
