//! Bounded retry for flash writes.
//!
//! Writes are retried a fixed number of times with an exponential backoff
//! capped at `max_delay_ms`, then abandoned. A full store is never retried.

use embedded_hal::delay::DelayNs;
use log::warn;
use serde::{Deserialize, Serialize};

use super::kv::KvError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one (at least 1)
    pub max_attempts: u8,
    /// Delay before the second attempt
    pub base_delay_ms: u32,
    /// Upper bound for any single delay
    pub max_delay_ms: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 5,
            max_delay_ms: 50,
        }
    }
}

impl RetryPolicy {
    /// Policy that tries exactly once
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay to wait before attempt number `attempt` (1-based retry count)
    pub fn delay_for_attempt(&self, attempt: u8) -> u32 {
        if self.base_delay_ms == 0 || attempt == 0 {
            return 0;
        }
        let shift = u32::from(attempt - 1).min(16);
        self.base_delay_ms
            .saturating_mul(1 << shift)
            .min(self.max_delay_ms.max(self.base_delay_ms))
    }

    /// Run `op` until it succeeds or the attempt budget is spent.
    pub fn run<D, F>(&self, delay: &mut D, mut op: F) -> Result<(), KvError>
    where
        D: DelayNs,
        F: FnMut() -> Result<(), KvError>,
    {
        let attempts = self.max_attempts.max(1);
        let mut retry = 0u8;

        loop {
            match op() {
                Ok(()) => return Ok(()),
                Err(e @ KvError::Full { .. }) => return Err(e),
                Err(e) => {
                    retry += 1;
                    if retry >= attempts {
                        return Err(e);
                    }
                    let wait = self.delay_for_attempt(retry);
                    warn!("Storage write failed ({}), retry {} in {} ms", e, retry, wait);
                    if wait > 0 {
                        delay.delay_ms(wait);
                    }
                }
            }
        }
    }
}
