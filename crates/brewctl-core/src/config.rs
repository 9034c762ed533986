use embassy_time::Duration;
use serde::{Deserialize, Serialize};

use crate::brewing::PidGains;
use crate::storage::RetryPolicy;

/// Controller tuning, posted as JSON by the dashboard.
///
/// Missing fields fall back to their defaults, so a partial document such as
/// `{"holdToleranceC": 1.0}` is valid.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Control loop period
    pub tick_period_ms: u32,
    /// Seconds between recorded samples
    pub record_interval_secs: u32,
    /// Seconds between checkpoints of the running session
    pub checkpoint_interval_secs: u32,
    /// Sample buffer capacity before decimation kicks in
    pub max_samples: usize,
    /// Half-width of the band around the step target, °C
    pub hold_tolerance_c: f32,
    /// Distance below target where boost steps run flat out, °C
    pub boost_band_c: f32,
    pub pid: PidGains,
    pub retry: RetryPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: 1_000,
            record_interval_secs: 30,
            checkpoint_interval_secs: 300,
            // 24 hours at the default record interval
            max_samples: 2_880,
            hold_tolerance_c: 0.5,
            boost_band_c: 5.0,
            pid: PidGains::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ControllerConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(u64::from(self.tick_period_ms))
    }
}
