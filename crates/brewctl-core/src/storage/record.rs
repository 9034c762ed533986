//! Binary records persisted in the key-value store.
//!
//! - TemperatureSample: 7 bytes, packed densely into `data_<id>` blobs
//! - BrewSession: 98 bytes, one per `session_<id>` key
//!
//! Every record starts with (or, for sample blobs, is preceded by) a schema
//! version byte. Decoders accept longer payloads so that later versions can
//! append fields without breaking old firmware.

extern crate alloc;
use alloc::vec::Vec;

use core::fmt::Display;
use serde::{Deserialize, Serialize};

/// Current schema version for both record kinds
pub const RECORD_VERSION: u8 = 1;

/// Maximum length of schedule and session names in bytes
pub const NAME_CAPACITY: usize = 31;

/// Bounded name stored in a fixed 32-byte field
pub type Name = heapless::String<NAME_CAPACITY>;

/// Build a [`Name`], truncating on a character boundary when too long
pub fn name_from(value: &str) -> Name {
    let mut name = Name::new();
    for c in value.chars() {
        if name.push(c).is_err() {
            break;
        }
    }
    name
}

/// One recorded control tick.
///
/// Whole-degree precision is deliberate: the flash budget matters more than
/// sub-degree resolution for history charts.
///
/// Binary format (little-endian):
/// - timestamp: 4 bytes (u32)
/// - avg_temperature: 1 byte (i8)
/// - target_temperature: 1 byte (i8)
/// - output_percent: 1 byte (u8)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemperatureSample {
    pub timestamp: u32,
    pub avg_temperature: i8,
    pub target_temperature: i8,
    pub output_percent: u8,
}

impl TemperatureSample {
    pub const SIZE: usize = 7;

    pub fn new(timestamp: u32, avg_temperature: f32, target_temperature: f32, output: u8) -> Self {
        Self {
            timestamp,
            avg_temperature: whole_degrees(avg_temperature),
            target_temperature: whole_degrees(target_temperature),
            output_percent: output.min(100),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes[4] = self.avg_temperature as u8;
        bytes[5] = self.target_temperature as u8;
        bytes[6] = self.output_percent;
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            timestamp: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            avg_temperature: bytes[4] as i8,
            target_temperature: bytes[5] as i8,
            output_percent: bytes[6],
        }
    }
}

impl Display for TemperatureSample {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "[Sample] t: {}, avg: {}°C, target: {}°C, output: {}%",
            self.timestamp, self.avg_temperature, self.target_temperature, self.output_percent
        )
    }
}

/// Round to the nearest whole degree, saturating to the i8 range
pub fn whole_degrees(celsius: f32) -> i8 {
    if celsius.is_nan() {
        return 0;
    }
    let rounded = if celsius >= 0.0 {
        celsius + 0.5
    } else {
        celsius - 0.5
    };
    rounded.clamp(i8::MIN as f32, i8::MAX as f32) as i8
}

/// Encode a sample sequence as `[version][sample 0][sample 1]...`
pub fn encode_samples(samples: &[TemperatureSample]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(1 + samples.len() * TemperatureSample::SIZE);
    blob.push(RECORD_VERSION);
    for sample in samples {
        blob.extend_from_slice(&sample.to_bytes());
    }
    blob
}

/// Decode a sample blob. Unknown versions and empty blobs yield no samples;
/// a trailing partial record is ignored.
pub fn decode_samples(blob: &[u8]) -> Vec<TemperatureSample> {
    match blob.split_first() {
        Some((&RECORD_VERSION, body)) => body
            .chunks_exact(TemperatureSample::SIZE)
            .filter_map(|chunk| <&[u8; TemperatureSample::SIZE]>::try_from(chunk).ok())
            .map(TemperatureSample::from_bytes)
            .collect(),
        _ => Vec::new(),
    }
}

/// Aggregate temperature statistics over a sample set
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SampleStats {
    pub avg: f32,
    pub min: f32,
    pub max: f32,
}

impl SampleStats {
    /// Mean, minimum and maximum of the average-temperature field.
    ///
    /// Returns None if `samples` is empty.
    pub fn from_samples(samples: &[TemperatureSample]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let mut sum = 0i64;
        let mut min = i8::MAX;
        let mut max = i8::MIN;
        for sample in samples {
            sum += i64::from(sample.avg_temperature);
            min = min.min(sample.avg_temperature);
            max = max.max(sample.avg_temperature);
        }

        Some(Self {
            avg: sum as f32 / samples.len() as f32,
            min: f32::from(min),
            max: f32::from(max),
        })
    }
}

/// Metadata for one brewing session.
///
/// A record with `session_id == 0` is the "not found" sentinel; id 0 is never
/// issued.
///
/// Binary format (little-endian, 98 bytes):
/// - version: 1 byte
/// - session_id, start_time, end_time: 3 × 4 bytes (u32)
/// - schedule_name: 32 bytes (NUL padded)
/// - name: 32 bytes (NUL padded)
/// - sample_count: 4 bytes (u32)
/// - avg, min, max temperature: 3 × 4 bytes (f32)
/// - total_duration_secs: 4 bytes (u32)
/// - completed: 1 byte
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrewSession {
    pub session_id: u32,
    pub start_time: u32,
    pub end_time: u32,
    pub schedule_name: Name,
    pub name: Name,
    pub sample_count: u32,
    pub avg_temperature: f32,
    pub min_temperature: f32,
    pub max_temperature: f32,
    pub total_duration_secs: u32,
    pub completed: bool,
}

impl BrewSession {
    pub const SIZE: usize = 98;

    /// Fresh in-progress session
    pub fn begin(session_id: u32, start_time: u32, schedule_name: &str, name: &str) -> Self {
        let name = if name.is_empty() { schedule_name } else { name };
        Self {
            session_id,
            start_time,
            end_time: start_time,
            schedule_name: name_from(schedule_name),
            name: name_from(name),
            ..Self::default()
        }
    }

    /// The "not found" record
    pub fn sentinel() -> Self {
        Self::default()
    }

    pub fn is_sentinel(&self) -> bool {
        self.session_id == 0
    }

    /// Fill in end time, duration, sample count and statistics.
    pub fn finalize(&mut self, end_time: u32, samples: &[TemperatureSample]) {
        self.end_time = end_time.max(self.start_time);
        self.total_duration_secs = self.end_time - self.start_time;
        self.sample_count = samples.len() as u32;
        let stats = SampleStats::from_samples(samples).unwrap_or_default();
        self.avg_temperature = stats.avg;
        self.min_temperature = stats.min;
        self.max_temperature = stats.max;
        self.completed = true;
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        let mut offset = 0;

        bytes[offset] = RECORD_VERSION;
        offset += 1;

        for value in [self.session_id, self.start_time, self.end_time] {
            bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
            offset += 4;
        }

        for name in [&self.schedule_name, &self.name] {
            let raw = name.as_bytes();
            bytes[offset..offset + raw.len()].copy_from_slice(raw);
            offset += NAME_CAPACITY + 1;
        }

        bytes[offset..offset + 4].copy_from_slice(&self.sample_count.to_le_bytes());
        offset += 4;

        for value in [
            self.avg_temperature,
            self.min_temperature,
            self.max_temperature,
        ] {
            bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
            offset += 4;
        }

        bytes[offset..offset + 4].copy_from_slice(&self.total_duration_secs.to_le_bytes());
        offset += 4;

        bytes[offset] = u8::from(self.completed);
        bytes
    }

    /// Decode a stored record.
    ///
    /// Returns None for blobs shorter than [`Self::SIZE`] (tombstones
    /// included) and for unknown schema versions.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE || bytes[0] != RECORD_VERSION {
            return None;
        }

        let u32_at = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        let f32_at = |at: usize| f32::from_bits(u32_at(at));
        let name_at = |at: usize| {
            let field = &bytes[at..at + NAME_CAPACITY + 1];
            let len = field.iter().position(|&b| b == 0).unwrap_or(NAME_CAPACITY);
            core::str::from_utf8(&field[..len.min(NAME_CAPACITY)])
                .map(name_from)
                .unwrap_or_default()
        };

        Some(Self {
            session_id: u32_at(1),
            start_time: u32_at(5),
            end_time: u32_at(9),
            schedule_name: name_at(13),
            name: name_at(45),
            sample_count: u32_at(77),
            avg_temperature: f32_at(81),
            min_temperature: f32_at(85),
            max_temperature: f32_at(89),
            total_duration_secs: u32_at(93),
            completed: bytes[97] != 0,
        })
    }
}

impl Display for BrewSession {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "[BrewSession] id: {}, name: {}, schedule: {}, samples: {}, avg: {:.1}°C, completed: {}",
            self.session_id,
            self.name,
            self.schedule_name,
            self.sample_count,
            self.avg_temperature,
            self.completed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_sample_size() {
        assert_eq!(TemperatureSample::to_bytes(&TemperatureSample::default()).len(), 7);
    }

    #[test]
    fn test_sample_serialization() {
        let sample = TemperatureSample {
            timestamp: 0xDEAD_BEEF,
            avg_temperature: -12,
            target_temperature: 66,
            output_percent: 80,
        };

        let bytes = sample.to_bytes();
        assert_eq!(&bytes[0..4], &[0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(TemperatureSample::from_bytes(&bytes), sample);
    }

    #[test]
    fn test_whole_degrees_rounds_and_saturates() {
        assert_eq!(whole_degrees(64.4), 64);
        assert_eq!(whole_degrees(64.5), 65);
        assert_eq!(whole_degrees(-3.6), -4);
        assert_eq!(whole_degrees(300.0), 127);
        assert_eq!(whole_degrees(-200.0), -128);
        assert_eq!(whole_degrees(f32::NAN), 0);
    }

    #[test]
    fn test_output_is_clamped_to_percent() {
        assert_eq!(TemperatureSample::new(0, 20.0, 65.0, 250).output_percent, 100);
    }

    #[test]
    fn test_sample_blob_keeps_order() {
        let samples = vec![
            TemperatureSample::new(0, 20.0, 65.0, 50),
            TemperatureSample::new(60, 40.0, 65.0, 80),
            TemperatureSample::new(120, 65.0, 65.0, 10),
        ];

        let blob = encode_samples(&samples);
        assert_eq!(blob.len(), 1 + 3 * TemperatureSample::SIZE);
        assert_eq!(decode_samples(&blob), samples);
    }

    #[test]
    fn test_sample_blob_rejects_unknown_version_and_partial_tail() {
        let mut blob = encode_samples(&[TemperatureSample::new(5, 20.0, 65.0, 1)]);
        blob.extend_from_slice(&[1, 2, 3]);
        assert_eq!(decode_samples(&blob).len(), 1);

        blob[0] = 9;
        assert!(decode_samples(&blob).is_empty());
        assert!(decode_samples(&[]).is_empty());
    }

    #[test]
    fn test_session_serialization() {
        let mut session = BrewSession::begin(42, 1_000, "Single Infusion", "Pale Ale #3");
        session.finalize(4_600, &[TemperatureSample::new(1_000, 66.0, 67.0, 30)]);

        let bytes = session.to_bytes();
        assert_eq!(bytes.len(), BrewSession::SIZE);

        let decoded = BrewSession::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, session);
        assert_eq!(decoded.total_duration_secs, 3_600);
        assert!(decoded.completed);
    }

    #[test]
    fn test_session_name_at_capacity() {
        let long = "0123456789012345678901234567890123456789";
        let session = BrewSession::begin(1, 0, long, "");
        assert_eq!(session.schedule_name.len(), NAME_CAPACITY);
        assert_eq!(session.name, session.schedule_name);

        let decoded = BrewSession::from_bytes(&session.to_bytes()).unwrap();
        assert_eq!(decoded.schedule_name.as_str(), &long[..NAME_CAPACITY]);
    }

    #[test]
    fn test_session_decode_failures() {
        assert!(BrewSession::from_bytes(&[]).is_none());
        assert!(BrewSession::from_bytes(&[RECORD_VERSION; 10]).is_none());

        let mut bytes = BrewSession::begin(1, 0, "x", "").to_bytes();
        bytes[0] = 2;
        assert!(BrewSession::from_bytes(&bytes).is_none());
    }

    #[test]
    fn test_session_decode_accepts_longer_payload() {
        let session = BrewSession::begin(7, 10, "Step Mash", "");
        let mut bytes = session.to_bytes().to_vec();
        bytes.extend_from_slice(&[0xAA; 8]);
        assert_eq!(BrewSession::from_bytes(&bytes).unwrap(), session);
    }

    #[test]
    fn test_stats_from_samples() {
        let samples = [
            TemperatureSample::new(0, 20.0, 65.0, 50),
            TemperatureSample::new(60, 40.0, 65.0, 80),
            TemperatureSample::new(120, 65.0, 65.0, 10),
        ];

        let stats = SampleStats::from_samples(&samples).unwrap();
        assert!(stats.avg > 41.666 && stats.avg < 41.667_5);
        assert_eq!(stats.min, 20.0);
        assert_eq!(stats.max, 65.0);
        assert!(SampleStats::from_samples(&[]).is_none());
    }
}
