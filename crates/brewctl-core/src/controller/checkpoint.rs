//! Brew checkpoint stored under `brew_state`.
//!
//! Carries everything needed to put the state machine back where it was
//! after a power loss. The schedule travels with the checkpoint so a resume
//! does not depend on the schedule catalogue still containing it.

extern crate alloc;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::brewing::{BrewProgress, MashSchedule};

pub const CHECKPOINT_VERSION: u8 = 2;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint encoding failed: {0}")]
    Encode(postcard::Error),
    #[error("checkpoint decoding failed: {0}")]
    Decode(postcard::Error),
    #[error("unsupported checkpoint version {0}")]
    Version(u8),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrewCheckpoint {
    pub version: u8,
    pub session_id: u32,
    pub schedule: MashSchedule,
    pub progress: BrewProgress,
    /// Recorder stride, so a decimated buffer resumes at its own resolution
    pub sample_stride: u32,
    pub saved_at: u32,
}

impl BrewCheckpoint {
    pub fn new(
        session_id: u32,
        schedule: MashSchedule,
        progress: BrewProgress,
        sample_stride: u32,
        saved_at: u32,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            session_id,
            schedule,
            progress,
            sample_stride,
            saved_at,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CheckpointError> {
        postcard::to_allocvec(self).map_err(CheckpointError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CheckpointError> {
        // Version is the first field, check it before trusting the rest
        match bytes.first() {
            Some(&CHECKPOINT_VERSION) => {}
            Some(&other) => return Err(CheckpointError::Version(other)),
            None => return Err(CheckpointError::Decode(postcard::Error::DeserializeUnexpectedEnd)),
        }
        postcard::from_bytes(bytes).map_err(CheckpointError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brewing::{BrewPhase, MashStep};

    fn checkpoint() -> BrewCheckpoint {
        BrewCheckpoint::new(
            7,
            MashSchedule::new("Step Mash")
                .with_step(MashStep::new("Protein", 52.0, 10))
                .with_step(MashStep::new("Sacch", 66.0, 60).extend_if_needed()),
            BrewProgress {
                phase: BrewPhase::Paused,
                paused_from: Some(BrewPhase::Holding),
                step_index: 1,
                hold_remaining_secs: 1_234,
            },
            4,
            9_000,
        )
    }

    #[test]
    fn test_decode_restores_schedule_and_progress() {
        let original = checkpoint();
        let decoded = BrewCheckpoint::from_bytes(&original.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.sample_stride, 4);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut bytes = checkpoint().to_bytes().unwrap();
        bytes[0] = 9;
        assert!(matches!(
            BrewCheckpoint::from_bytes(&bytes),
            Err(CheckpointError::Version(9))
        ));
    }

    #[test]
    fn test_rejects_truncated_blob() {
        let bytes = checkpoint().to_bytes().unwrap();
        assert!(matches!(
            BrewCheckpoint::from_bytes(&bytes[..bytes.len() / 2]),
            Err(CheckpointError::Decode(_))
        ));
        assert!(BrewCheckpoint::from_bytes(&[]).is_err());
    }
}
