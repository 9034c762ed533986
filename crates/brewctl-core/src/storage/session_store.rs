// cSpell: disable
use core::fmt::Write;

use embedded_hal::delay::DelayNs;
use log::{debug, error, info, warn};
use serde::Serialize;
use thiserror_no_std::Error;

extern crate alloc;
use alloc::string::String;
use alloc::vec::Vec;

use super::export;
use super::kv::{KvError, KvStore};
use super::record::{BrewSession, TemperatureSample, decode_samples, encode_samples};
use super::retry::RetryPolicy;
use super::{
    DEFAULT_MAX_SESSIONS, KEY_BREW_STATE, KEY_STAT_COUNT, KEY_STAT_MAX, KEY_STAT_NEXT_ID,
};

/// Owned storage key such as `session_12`
pub type Key = heapless::String<24>;

pub fn session_key(id: u32) -> Key {
    let mut key = Key::new();
    let _ = write!(key, "session_{}", id);
    key
}

pub fn data_key(id: u32) -> Key {
    let mut key = Key::new();
    let _ = write!(key, "data_{}", id);
    key
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("write to {key} failed: {error}")]
    Write { key: Key, error: KvError },
    #[error("read of {key} failed: {error}")]
    Read { key: Key, error: KvError },
}

/// Aggregate figures over every stored session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub total_sessions: u32,
    /// Sum of session durations in seconds
    pub total_brew_time: u64,
    /// Mean session duration in seconds, 0 with no sessions
    pub avg_session_duration: u32,
}

/// Durable session history on top of a [`KvStore`].
///
/// ## Key layout
///
/// - `stat_count`: u16 number of finalized sessions
/// - `stat_next_id`: u32 next session id to issue (starts at 1)
/// - `stat_max`: u8 retention cap
/// - `session_<id>`: [`BrewSession`] record
/// - `data_<id>`: packed [`TemperatureSample`] blob
/// - `brew_state`: opaque checkpoint of the running brew
///
/// The backing store cannot enumerate keys, so listing walks every id from 1
/// up to the last one issued. That is fine for a retention cap of a few dozen
/// sessions; a larger cap would need a manifest record of live ids.
pub struct SessionStore<K, D>
where
    K: KvStore,
    D: DelayNs,
{
    kv: K,
    delay: D,
    retry: RetryPolicy,
    /// Highest id handed out by this instance, guards against a counter
    /// write that silently failed
    issued_id: u32,
}

impl<K, D> SessionStore<K, D>
where
    K: KvStore,
    D: DelayNs,
{
    pub fn new(kv: K, delay: D, retry: RetryPolicy) -> Self {
        Self {
            kv,
            delay,
            retry,
            issued_id: 0,
        }
    }

    pub fn kv(&self) -> &K {
        &self.kv
    }

    pub fn kv_mut(&mut self) -> &mut K {
        &mut self.kv
    }

    /// Release the backing store and delay provider
    pub fn into_parts(self) -> (K, D) {
        (self.kv, self.delay)
    }

    fn write_with_retry(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let Self {
            kv, delay, retry, ..
        } = self;
        retry
            .run(delay, || kv.write(key, value))
            .map_err(|error| StoreError::Write {
                key: key_from(key),
                error,
            })
    }

    fn tombstone_with_retry(&mut self, key: &str) -> Result<(), StoreError> {
        let Self {
            kv, delay, retry, ..
        } = self;
        retry
            .run(delay, || kv.tombstone(key))
            .map_err(|error| StoreError::Write {
                key: key_from(key),
                error,
            })
    }

    /// Read a scalar counter, persisting `default` when it is missing.
    fn load_counter<T, R, W>(&mut self, key: &str, default: T, read: R, write: W) -> T
    where
        T: Copy + core::fmt::Debug,
        R: Fn(&K, &str) -> Result<Option<T>, KvError>,
        W: Fn(&mut K, &str, T) -> Result<(), KvError>,
    {
        match read(&self.kv, key) {
            Ok(Some(value)) => value,
            Ok(None) => {
                debug!("{} not found, initialising to {:?}", key, default);
                let Self {
                    kv, delay, retry, ..
                } = self;
                if let Err(e) = retry.run(delay, || write(kv, key, default)) {
                    error!("Failed to persist default for {}: {}", key, e);
                }
                default
            }
            Err(e) => {
                warn!("Failed to read {} ({}), using {:?}", key, e, default);
                default
            }
        }
    }

    /// Retention cap, defaulting to [`DEFAULT_MAX_SESSIONS`]
    pub fn max_sessions(&mut self) -> u8 {
        let max = self.load_counter(
            KEY_STAT_MAX,
            DEFAULT_MAX_SESSIONS,
            |kv, key| kv.read_u8(key),
            |kv, key, value| kv.write_u8(key, value),
        );
        max.max(1)
    }

    /// Number of finalized sessions the store believes it holds
    pub fn session_count(&mut self) -> u16 {
        self.load_counter(
            KEY_STAT_COUNT,
            0,
            |kv, key| kv.read_u16(key),
            |kv, key, value| kv.write_u16(key, value),
        )
    }

    /// The id the next call to [`Self::allocate_session_id`] returns
    pub fn next_session_id(&mut self) -> u32 {
        let stored = self.load_counter(
            KEY_STAT_NEXT_ID,
            1,
            |kv, key| kv.read_u32(key),
            |kv, key, value| kv.write_u32(key, value),
        );
        stored.max(self.issued_id + 1).max(1)
    }

    /// Issue a new session id (read, increment, write back).
    pub fn allocate_session_id(&mut self) -> u32 {
        let id = self.next_session_id();
        self.issued_id = id;
        if let Err(e) = self.write_with_retry(KEY_STAT_NEXT_ID, &(id + 1).to_le_bytes()) {
            error!("Failed to advance session counter past {}: {}", id, e);
        }
        debug!("Allocated session id {}", id);
        id
    }

    /// Count one more finalized session
    pub fn record_finalized(&mut self) {
        let count = self.session_count().saturating_add(1);
        if let Err(e) = self.write_with_retry(KEY_STAT_COUNT, &count.to_le_bytes()) {
            error!("Failed to update session count: {}", e);
        }
    }

    /// Change the retention cap. Lowering it evicts immediately, sparing
    /// `protect` (the active session). Returns the number of evicted sessions.
    pub fn set_max_sessions(&mut self, max: u8, protect: Option<u32>) -> Result<usize, StoreError> {
        let max = max.max(1);
        let previous = self.max_sessions();
        self.write_with_retry(KEY_STAT_MAX, &[max])?;
        info!("Retention cap changed from {} to {}", previous, max);

        if max < previous {
            Ok(self.cleanup_old_sessions(protect))
        } else {
            Ok(0)
        }
    }

    /// Write the record and the sample blob for `session`.
    ///
    /// Both writes are attempted even if the first one fails; the first error
    /// is returned.
    pub fn persist(
        &mut self,
        session: &BrewSession,
        samples: &[TemperatureSample],
    ) -> Result<(), StoreError> {
        let meta = self.write_with_retry(&session_key(session.session_id), &session.to_bytes());
        if let Err(e) = &meta {
            error!("Failed to persist session {} metadata: {}", session.session_id, e);
        }

        let data = self.write_with_retry(&data_key(session.session_id), &encode_samples(samples));
        if let Err(e) = &data {
            error!("Failed to persist session {} data: {}", session.session_id, e);
        }

        debug!(
            "Persisted session {} with {} samples",
            session.session_id,
            samples.len()
        );
        meta.and(data)
    }

    fn load_session(&self, id: u32) -> Result<Option<BrewSession>, StoreError> {
        let key = session_key(id);
        let raw = self
            .kv
            .read_blob(&key)
            .map_err(|error| StoreError::Read { key, error })?;
        Ok(raw.and_then(|bytes| BrewSession::from_bytes(&bytes)))
    }

    /// Every decodable session, newest start time first.
    pub fn session_list(&mut self) -> Vec<BrewSession> {
        let last_issued = self.next_session_id().saturating_sub(1);
        let mut sessions = Vec::new();

        for id in 1..=last_issued {
            match self.load_session(id) {
                Ok(Some(session)) if session.session_id == id => sessions.push(session),
                Ok(Some(session)) => {
                    warn!("Record under id {} claims id {}, skipping", id, session.session_id);
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable session: {}", e),
            }
        }

        sessions.sort_by(|a, b| {
            b.start_time
                .cmp(&a.start_time)
                .then(b.session_id.cmp(&a.session_id))
        });
        sessions
    }

    /// Point lookup; returns the sentinel record (id 0) when absent.
    pub fn session_by_id(&self, id: u32) -> BrewSession {
        if id == 0 {
            return BrewSession::sentinel();
        }
        match self.load_session(id) {
            Ok(Some(session)) => session,
            Ok(None) => BrewSession::sentinel(),
            Err(e) => {
                warn!("Lookup failed: {}", e);
                BrewSession::sentinel()
            }
        }
    }

    /// Samples of a session in recording order, empty when absent.
    pub fn session_data(&self, id: u32) -> Vec<TemperatureSample> {
        match self.kv.read_blob(&data_key(id)) {
            Ok(Some(blob)) => decode_samples(&blob),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Failed to read data for session {}: {}", id, e);
                Vec::new()
            }
        }
    }

    /// Enforce the retention cap.
    ///
    /// When the finalized-session count exceeds the cap, the oldest sessions
    /// by start time (never `protect`) are tombstoned and the count is reset
    /// to the cap. Returns the number of sessions evicted.
    pub fn cleanup_old_sessions(&mut self, protect: Option<u32>) -> usize {
        let max = self.max_sessions();
        let count = self.session_count();
        if count <= u16::from(max) {
            return 0;
        }

        let excess = usize::from(count - u16::from(max));
        let mut sessions = self.session_list();
        sessions.retain(|s| Some(s.session_id) != protect);
        sessions.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then(a.session_id.cmp(&b.session_id))
        });

        let mut evicted = 0;
        for session in sessions.iter().take(excess) {
            let id = session.session_id;
            let meta = self.tombstone_with_retry(&session_key(id));
            let data = self.tombstone_with_retry(&data_key(id));
            match meta.and(data) {
                Ok(()) => {
                    info!("Evicted session {} ({})", id, session.name);
                    evicted += 1;
                }
                Err(e) => error!("Failed to evict session {}: {}", id, e),
            }
        }

        if let Err(e) = self.write_with_retry(KEY_STAT_COUNT, &u16::from(max).to_le_bytes()) {
            error!("Failed to reset session count: {}", e);
        }
        evicted
    }

    pub fn session_stats(&mut self) -> SessionStats {
        let sessions = self.session_list();
        let total_sessions = sessions.len() as u32;
        let total_brew_time: u64 = sessions
            .iter()
            .map(|s| u64::from(s.total_duration_secs))
            .sum();
        let avg_session_duration = if total_sessions == 0 {
            0
        } else {
            (total_brew_time / u64::from(total_sessions)) as u32
        };

        SessionStats {
            total_sessions,
            total_brew_time,
            avg_session_duration,
        }
    }

    /// JSON document for download, `{}` when the session does not exist
    pub fn export_session_json(&self, id: u32) -> String {
        let session = self.session_by_id(id);
        if session.is_sentinel() {
            return String::from("{}");
        }
        export::session_to_json(&session, &self.session_data(id))
    }

    /// CSV document for download, empty when the session does not exist
    pub fn export_session_csv(&self, id: u32) -> String {
        let session = self.session_by_id(id);
        if session.is_sentinel() {
            return String::new();
        }
        export::session_to_csv(&session, &self.session_data(id))
    }

    pub fn write_checkpoint(&mut self, blob: &[u8]) -> Result<(), StoreError> {
        self.write_with_retry(KEY_BREW_STATE, blob)
    }

    pub fn read_checkpoint(&self) -> Option<Vec<u8>> {
        self.kv.read_blob(KEY_BREW_STATE).unwrap_or_else(|e| {
            warn!("Failed to read brew checkpoint: {}", e);
            None
        })
    }

    pub fn clear_checkpoint(&mut self) {
        if let Err(e) = self.tombstone_with_retry(KEY_BREW_STATE) {
            error!("Failed to clear brew checkpoint: {}", e);
        }
    }
}

fn key_from(value: &str) -> Key {
    let mut key = Key::new();
    let _ = key.push_str(&value[..value.len().min(24)]);
    key
}
