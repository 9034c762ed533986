//! Active session recording.
//!
//! The recorder owns the [`SessionStore`] and the in-memory state of the one
//! session that may be active. Samples are buffered in RAM and only reach
//! flash on a checkpoint or when the session ends.
//!
//! The buffer is bounded. Once it holds `max_samples` points it is decimated
//! in place (every other sample kept) and from then on only every second
//! incoming point is recorded, doubling again on each further overflow. A
//! session of any length therefore covers its whole duration at a coarser
//! resolution instead of losing its tail.

extern crate alloc;
use alloc::vec::Vec;

use embedded_hal::delay::DelayNs;
use log::{debug, error, info, warn};

use crate::brewing::BrewError;
use crate::storage::{BrewSession, KvStore, SessionStore, StoreError, TemperatureSample};

/// Smallest usable buffer; decimation needs at least two samples
const MIN_SAMPLES: usize = 2;

pub struct SessionRecorder<K, D>
where
    K: KvStore,
    D: DelayNs,
{
    store: SessionStore<K, D>,
    active: Option<BrewSession>,
    samples: Vec<TemperatureSample>,
    max_samples: usize,
    /// Record one point out of every `stride`
    stride: u32,
    since_recorded: u32,
}

impl<K, D> SessionRecorder<K, D>
where
    K: KvStore,
    D: DelayNs,
{
    pub fn new(store: SessionStore<K, D>, max_samples: usize) -> Self {
        Self {
            store,
            active: None,
            samples: Vec::new(),
            max_samples: max_samples.max(MIN_SAMPLES),
            stride: 1,
            since_recorded: 0,
        }
    }

    pub fn store(&self) -> &SessionStore<K, D> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SessionStore<K, D> {
        &mut self.store
    }

    /// Drop the in-memory session (if any) and hand back the store
    pub fn into_store(self) -> SessionStore<K, D> {
        self.store
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_session(&self) -> Option<&BrewSession> {
        self.active.as_ref()
    }

    pub fn active_id(&self) -> Option<u32> {
        self.active.as_ref().map(|s| s.session_id)
    }

    pub fn samples(&self) -> &[TemperatureSample] {
        &self.samples
    }

    pub fn data_points(&self) -> usize {
        self.samples.len()
    }

    /// Current recording stride (one point kept out of every `stride`)
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Begin recording a new session and return its id.
    ///
    /// A session that is still active is ended first, exactly as if
    /// [`Self::end_session`] had been called.
    pub fn start_session(&mut self, schedule_name: &str, name: &str, now: u32) -> u32 {
        if let Some(previous) = self.active_id() {
            warn!("Session {} still active, forcing end", previous);
            self.end_session(now);
        }

        let id = self.store.allocate_session_id();
        let session = BrewSession::begin(id, now, schedule_name, name);
        info!("Started session {}: {}", id, session.name);

        self.active = Some(session);
        self.reset_buffer(Vec::new());
        id
    }

    /// Buffer one sample. Ignored when no session is active.
    pub fn add_data_point(&mut self, timestamp: u32, avg: f32, target: f32, output_percent: u8) {
        if self.active.is_none() {
            return;
        }

        self.since_recorded += 1;
        if self.since_recorded < self.stride {
            return;
        }
        self.since_recorded = 0;

        if self.samples.len() >= self.max_samples {
            self.decimate();
        }
        self.samples
            .push(TemperatureSample::new(timestamp, avg, target, output_percent));
    }

    fn decimate(&mut self) {
        let mut index = 0usize;
        self.samples.retain(|_| {
            let keep = index % 2 == 0;
            index += 1;
            keep
        });
        self.stride = self.stride.saturating_mul(2);
        debug!(
            "Sample buffer full, decimated to {} (recording 1 in {})",
            self.samples.len(),
            self.stride
        );
    }

    fn reset_buffer(&mut self, samples: Vec<TemperatureSample>) {
        self.samples = samples;
        self.stride = 1;
        self.since_recorded = 0;
    }

    /// Finalize, persist and retire the active session.
    ///
    /// Storage failures are logged and the session is retired regardless.
    /// Returns the finalized record, or None if nothing was active.
    pub fn end_session(&mut self, now: u32) -> Option<BrewSession> {
        self.finish(now, None)
    }

    /// End the active session; retention cleanup spares `protect`.
    fn finish(&mut self, now: u32, protect: Option<u32>) -> Option<BrewSession> {
        let mut session = self.active.take()?;
        session.finalize(now, &self.samples);

        if let Err(e) = self.store.persist(&session, &self.samples) {
            error!("Session {} not fully persisted: {}", session.session_id, e);
        }
        // Only a record that made it to flash takes a retention slot
        if self.store.session_by_id(session.session_id).is_sentinel() {
            warn!("Session {} has no stored record, not counted", session.session_id);
        } else {
            self.store.record_finalized();
        }

        let evicted = self.store.cleanup_old_sessions(protect);
        if evicted > 0 {
            info!("Evicted {} old sessions", evicted);
        }
        self.store.clear_checkpoint();

        info!("Ended session: {}", session);
        self.reset_buffer(Vec::new());
        Some(session)
    }

    /// Persist the active session as in-progress so it survives a restart.
    pub fn checkpoint(&mut self, now: u32) -> Result<(), StoreError> {
        let Some(active) = &self.active else {
            return Ok(());
        };

        let mut snapshot = active.clone();
        snapshot.finalize(now, &self.samples);
        snapshot.completed = false;
        debug!(
            "Checkpointing session {} ({} samples)",
            snapshot.session_id,
            self.samples.len()
        );
        self.store.persist(&snapshot, &self.samples)
    }

    /// Reactivate an interrupted session from flash, keeping its id and
    /// recorded samples. Completed sessions cannot be resumed since their
    /// statistics are final.
    ///
    /// `stride` is the recording stride the session had when it was
    /// checkpointed, so a decimated buffer keeps one sample spacing.
    pub fn resume_session(
        &mut self,
        id: u32,
        stride: u32,
        now: u32,
    ) -> Result<&BrewSession, BrewError> {
        if self.active_id() == Some(id) {
            return self.active.as_ref().ok_or(BrewError::SessionNotFound(id));
        }

        let record = self.store.session_by_id(id);
        if record.is_sentinel() {
            return Err(BrewError::SessionNotFound(id));
        }
        if record.completed {
            return Err(BrewError::SessionCompleted(id));
        }

        if let Some(previous) = self.active_id() {
            warn!("Session {} still active, forcing end before resume", previous);
            self.finish(now, Some(id));
        }

        let mut samples = self.store.session_data(id);
        if samples.len() as u32 != record.sample_count {
            warn!(
                "Session {} lists {} samples but {} were stored",
                id,
                record.sample_count,
                samples.len()
            );
        }
        samples.truncate(self.max_samples);

        info!(
            "Resuming session {} with {} samples after {} s offline",
            id,
            samples.len(),
            now.saturating_sub(record.end_time)
        );
        self.reset_buffer(samples);
        self.stride = stride.max(1);
        Ok(self.active.insert(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryKvStore, NoDelay, RetryPolicy};

    type Recorder = SessionRecorder<MemoryKvStore, NoDelay>;

    fn recorder() -> Recorder {
        recorder_with(2_880)
    }

    fn recorder_with(max_samples: usize) -> Recorder {
        let store = SessionStore::new(MemoryKvStore::new(), NoDelay, RetryPolicy::default());
        SessionRecorder::new(store, max_samples)
    }

    fn run_session(recorder: &mut Recorder, name: &str, start: u32) -> u32 {
        let id = recorder.start_session("Single Infusion", name, start);
        recorder.add_data_point(start + 30, 60.0, 66.0, 80);
        recorder.end_session(start + 60);
        id
    }

    #[test]
    fn test_mash_statistics() {
        let mut recorder = recorder();
        let id = recorder.start_session("Mash1", "", 1_000);
        recorder.add_data_point(1_000, 20.0, 66.0, 100);
        recorder.add_data_point(1_030, 40.0, 66.0, 100);
        recorder.add_data_point(1_060, 65.0, 66.0, 20);
        let ended = recorder.end_session(1_090).unwrap();

        let stored = recorder.store().session_by_id(id);
        assert_eq!(stored, ended);
        assert_eq!(stored.name.as_str(), "Mash1");
        assert_eq!(stored.sample_count, 3);
        assert!(stored.avg_temperature > 41.65 && stored.avg_temperature < 41.68);
        assert_eq!(stored.min_temperature, 20.0);
        assert_eq!(stored.max_temperature, 65.0);
        assert_eq!(stored.total_duration_secs, 90);
        assert!(stored.completed);
        assert!(!recorder.is_active());
    }

    #[test]
    fn test_retention_keeps_newest() {
        let mut recorder = recorder();
        recorder.store_mut().set_max_sessions(2, None).unwrap();

        let s1 = run_session(&mut recorder, "s1", 100);
        let s2 = run_session(&mut recorder, "s2", 200);
        let s3 = run_session(&mut recorder, "s3", 300);

        let ids: Vec<u32> = recorder
            .store_mut()
            .session_list()
            .iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(ids, [s3, s2]);
        assert!(recorder.store().session_by_id(s1).is_sentinel());
        assert!(recorder.store().session_data(s1).is_empty());
    }

    #[test]
    fn test_start_forces_end_of_active_session() {
        let mut recorder = recorder();
        let first = recorder.start_session("Single Infusion", "First", 0);
        recorder.add_data_point(10, 62.0, 66.0, 50);

        let second = recorder.start_session("Single Infusion", "Second", 100);
        assert!(second > first);
        assert_eq!(recorder.active_id(), Some(second));
        assert_eq!(recorder.data_points(), 0);

        let persisted = recorder.store().session_by_id(first);
        assert!(persisted.completed);
        assert_eq!(persisted.end_time, 100);
        assert_eq!(persisted.sample_count, 1);
    }

    #[test]
    fn test_add_without_session_is_ignored() {
        let mut recorder = recorder();
        recorder.add_data_point(0, 60.0, 66.0, 10);
        assert_eq!(recorder.data_points(), 0);
        assert!(recorder.end_session(10).is_none());
        assert_eq!(recorder.store_mut().session_count(), 0);
    }

    #[test]
    fn test_end_is_idempotent() {
        let mut recorder = recorder();
        run_session(&mut recorder, "Once", 0);
        assert!(recorder.end_session(500).is_none());
        assert_eq!(recorder.store_mut().session_count(), 1);
    }

    #[test]
    fn test_decimation_keeps_whole_duration() {
        let mut recorder = recorder_with(4);
        let id = recorder.start_session("Long", "", 0);
        for t in 0..10 {
            recorder.add_data_point(t, 60.0, 66.0, 10);
        }
        assert!(recorder.data_points() <= 4);
        let stamps: Vec<u32> = recorder.samples().iter().map(|s| s.timestamp).collect();
        assert_eq!(stamps, [0, 4, 8]);

        recorder.end_session(10);
        let stored = recorder.store().session_by_id(id);
        assert_eq!(
            stored.sample_count as usize,
            recorder.store().session_data(id).len()
        );
    }

    #[test]
    fn test_failed_writes_still_retire_session() {
        let mut recorder = recorder();
        let id = recorder.start_session("Single Infusion", "Doomed", 0);
        recorder.store_mut().kv_mut().fail_next_writes(100);

        assert!(recorder.end_session(60).is_some());
        assert!(!recorder.is_active());
        assert!(recorder.store().session_by_id(id).is_sentinel());
    }

    #[test]
    fn test_unstored_session_is_not_counted() {
        let mut recorder = recorder();
        recorder.store_mut().set_max_sessions(2, None).unwrap();
        let kept = run_session(&mut recorder, "Kept", 0);

        let lost = recorder.start_session("Single Infusion", "Lost", 100);
        // Metadata and sample writes, three attempts each
        recorder.store_mut().kv_mut().fail_next_writes(6);
        recorder.end_session(160);

        assert!(recorder.store().session_by_id(lost).is_sentinel());
        assert_eq!(recorder.store_mut().session_count(), 1);

        run_session(&mut recorder, "Next", 200);
        assert!(!recorder.store().session_by_id(kept).is_sentinel());
    }

    #[test]
    fn test_resume_keeps_decimated_stride() {
        let mut recorder = recorder_with(4);
        let id = recorder.start_session("Long", "", 0);
        for t in 0..10 {
            recorder.add_data_point(t, 60.0, 66.0, 10);
        }
        assert_eq!(recorder.stride(), 4);
        recorder.checkpoint(10).unwrap();

        let mut recorder = SessionRecorder::new(recorder.into_store(), 4);
        recorder.resume_session(id, 4, 100).unwrap();
        assert_eq!(recorder.stride(), 4);
        assert_eq!(recorder.data_points(), 3);

        for t in 100..103 {
            recorder.add_data_point(t, 60.0, 66.0, 10);
        }
        assert_eq!(recorder.data_points(), 3);
        recorder.add_data_point(103, 60.0, 66.0, 10);
        let stamps: Vec<u32> = recorder.samples().iter().map(|s| s.timestamp).collect();
        assert_eq!(stamps, [0, 4, 8, 103]);
    }

    #[test]
    fn test_checkpoint_then_resume_after_restart() {
        let mut recorder = recorder();
        let id = recorder.start_session("Single Infusion", "Interrupted", 0);
        recorder.add_data_point(30, 50.0, 66.0, 100);
        recorder.add_data_point(60, 55.0, 66.0, 100);
        recorder.checkpoint(60).unwrap();

        let checkpointed = recorder.store().session_by_id(id);
        assert!(!checkpointed.completed);
        assert_eq!(checkpointed.sample_count, 2);

        // Power loss: the in-memory state is gone
        let mut recorder = SessionRecorder::new(recorder.into_store(), 2_880);
        assert!(!recorder.is_active());

        let resumed = recorder.resume_session(id, 1, 600).unwrap();
        assert_eq!(resumed.session_id, id);
        assert_eq!(recorder.data_points(), 2);

        recorder.add_data_point(630, 60.0, 66.0, 90);
        let ended = recorder.end_session(660).unwrap();
        assert_eq!(ended.session_id, id);
        assert_eq!(ended.sample_count, 3);
        assert_eq!(recorder.store_mut().next_session_id(), id + 1);
    }

    #[test]
    fn test_resume_rejects_completed_and_missing() {
        let mut recorder = recorder();
        let done = run_session(&mut recorder, "Done", 0);
        assert_eq!(
            recorder.resume_session(done, 1, 100).unwrap_err(),
            BrewError::SessionCompleted(done)
        );
        assert_eq!(
            recorder.resume_session(42, 1, 100).unwrap_err(),
            BrewError::SessionNotFound(42)
        );
    }

    #[test]
    fn test_checkpoint_without_session_is_noop() {
        let mut recorder = recorder();
        recorder.checkpoint(0).unwrap();
        assert_eq!(recorder.store().kv().write_count(), 0);
    }
}
