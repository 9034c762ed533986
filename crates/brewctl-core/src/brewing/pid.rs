//! Heater output controller.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: 8.0,
            ki: 0.02,
            kd: 2.0,
        }
    }
}

/// PID controller producing a heater duty cycle in percent (0..=100).
///
/// The integral term is clamped so that it alone can never push the output
/// outside the actuator range (anti-windup).
#[derive(Debug, Clone)]
pub struct Pid {
    gains: PidGains,
    integral: f32,
    last_error: Option<f32>,
}

impl Pid {
    pub fn new(gains: PidGains) -> Self {
        Self {
            gains,
            integral: 0.0,
            last_error: None,
        }
    }

    /// Forget accumulated state, e.g. when the setpoint jumps to a new step
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = None;
    }

    pub fn output(&mut self, setpoint: f32, measured: f32, dt_secs: f32) -> u8 {
        let error = setpoint - measured;

        if dt_secs > 0.0 && self.gains.ki > 0.0 {
            let limit = 100.0 / self.gains.ki;
            self.integral = (self.integral + error * dt_secs).clamp(0.0, limit);
        }

        let derivative = match self.last_error {
            Some(last) if dt_secs > 0.0 => (error - last) / dt_secs,
            _ => 0.0,
        };
        self.last_error = Some(error);

        let raw = self.gains.kp * error + self.gains.ki * self.integral + self.gains.kd * derivative;
        (raw.clamp(0.0, 100.0) + 0.5) as u8
    }
}
