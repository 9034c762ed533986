pub mod export;
pub mod kv;
pub mod record;
pub mod retry;
pub mod session_store;

pub use kv::{KvError, KvStore, MemoryKvStore};
pub use record::{BrewSession, Name, SampleStats, TemperatureSample};
pub use retry::RetryPolicy;
pub use session_store::{SessionStats, SessionStore, StoreError};

/// Number of finalized sessions (u16)
pub const KEY_STAT_COUNT: &str = "stat_count";
/// Next session id to issue (u32)
pub const KEY_STAT_NEXT_ID: &str = "stat_next_id";
/// Retention cap (u8)
pub const KEY_STAT_MAX: &str = "stat_max";
/// Postcard-encoded checkpoint of the running brew
pub const KEY_BREW_STATE: &str = "brew_state";

/// Sessions retained when `stat_max` has never been written
pub const DEFAULT_MAX_SESSIONS: u8 = 10;

/// Delay provider that returns immediately.
///
/// Used where retries should not sleep: host tests and the simulator.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDelay;

impl embedded_hal::delay::DelayNs for NoDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}
