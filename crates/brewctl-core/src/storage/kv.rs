//! Key-value persistence abstraction.
//!
//! The target's flash store maps short string keys to scalars or byte blobs.
//! It has no delete primitive and no transactions, so removal is expressed as
//! a zero-length overwrite ([`KvStore::tombstone`]). Readers treat an empty
//! blob exactly like a missing key.

extern crate alloc;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use thiserror_no_std::Error;

/// Errors raised by a key-value backend
///
/// A missing key is not an error: reads return `Ok(None)`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvError {
    #[error("store is full ({needed} bytes needed)")]
    Full { needed: usize },
    #[error("write to {key_len}-byte key failed")]
    WriteFailed { key_len: usize },
    #[error("read failed")]
    ReadFailed,
    #[error("value has wrong width: expected {expected}, found {found}")]
    WrongWidth { expected: usize, found: usize },
}

/// Durable string-keyed storage consumed by the session store.
///
/// Implementors only provide raw blob access; typed scalar helpers are
/// layered on top with little-endian encoding.
pub trait KvStore {
    /// Read the value stored under `key`, `None` when absent.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Overwrite the value stored under `key`.
    fn write(&mut self, key: &str, value: &[u8]) -> Result<(), KvError>;

    /// Logically delete `key` by overwriting it with an empty value.
    fn tombstone(&mut self, key: &str) -> Result<(), KvError> {
        self.write(key, &[])
    }

    /// Read a blob, folding tombstones into `None`.
    fn read_blob(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.read(key)?.filter(|value| !value.is_empty()))
    }

    fn read_u8(&self, key: &str) -> Result<Option<u8>, KvError> {
        read_scalar::<1, _>(self, key).map(|v| v.map(u8::from_le_bytes))
    }

    fn read_u16(&self, key: &str) -> Result<Option<u16>, KvError> {
        read_scalar::<2, _>(self, key).map(|v| v.map(u16::from_le_bytes))
    }

    fn read_u32(&self, key: &str) -> Result<Option<u32>, KvError> {
        read_scalar::<4, _>(self, key).map(|v| v.map(u32::from_le_bytes))
    }

    fn write_u8(&mut self, key: &str, value: u8) -> Result<(), KvError> {
        self.write(key, &value.to_le_bytes())
    }

    fn write_u16(&mut self, key: &str, value: u16) -> Result<(), KvError> {
        self.write(key, &value.to_le_bytes())
    }

    fn write_u32(&mut self, key: &str, value: u32) -> Result<(), KvError> {
        self.write(key, &value.to_le_bytes())
    }
}

fn read_scalar<const N: usize, K: KvStore + ?Sized>(
    store: &K,
    key: &str,
) -> Result<Option<[u8; N]>, KvError> {
    let Some(raw) = store.read_blob(key)? else {
        return Ok(None);
    };

    let bytes: [u8; N] = raw.as_slice().try_into().map_err(|_| KvError::WrongWidth {
        expected: N,
        found: raw.len(),
    })?;

    Ok(Some(bytes))
}

/// Heap-backed store used by tests and the desktop simulator.
///
/// Tracks the total number of stored bytes against an optional capacity and
/// can be told to fail the next N writes, which is how persistence failures
/// are exercised.
#[derive(Debug, Default, Clone)]
pub struct MemoryKvStore {
    entries: BTreeMap<String, Vec<u8>>,
    capacity: Option<usize>,
    failing_writes: usize,
    writes: usize,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that refuses writes once `capacity` bytes are in use
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Make the next `count` writes fail with [`KvError::WriteFailed`]
    pub fn fail_next_writes(&mut self, count: usize) {
        self.failing_writes = count;
    }

    /// Total bytes currently held, keys included
    pub fn used_bytes(&self) -> usize {
        self.entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    /// Number of write calls that reached the backing map
    pub fn write_count(&self) -> usize {
        self.writes
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

impl KvStore for MemoryKvStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.entries.get(key).cloned())
    }

    fn write(&mut self, key: &str, value: &[u8]) -> Result<(), KvError> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(KvError::WriteFailed { key_len: key.len() });
        }

        if let Some(capacity) = self.capacity {
            let previous = self.entries.get(key).map_or(0, |v| key.len() + v.len());
            let needed = self.used_bytes() - previous + key.len() + value.len();
            if needed > capacity {
                return Err(KvError::Full { needed });
            }
        }

        self.entries.insert(String::from(key), value.to_vec());
        self.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_reads_none() {
        let store = MemoryKvStore::new();
        assert_eq!(store.read("stat_count").unwrap(), None);
        assert_eq!(store.read_u16("stat_count").unwrap(), None);
    }

    #[test]
    fn test_scalars_are_little_endian() {
        let mut store = MemoryKvStore::new();
        store.write_u32("stat_next_id", 0x0102_0304).unwrap();
        assert_eq!(
            store.read("stat_next_id").unwrap(),
            Some(alloc::vec![4, 3, 2, 1])
        );
        assert_eq!(store.read_u32("stat_next_id").unwrap(), Some(0x0102_0304));
    }

    #[test]
    fn test_tombstone_reads_as_absent() {
        let mut store = MemoryKvStore::new();
        store.write("data_1", &[1, 2, 3]).unwrap();
        store.tombstone("data_1").unwrap();

        assert!(store.contains("data_1"));
        assert_eq!(store.read_blob("data_1").unwrap(), None);
    }

    #[test]
    fn test_wrong_width_scalar() {
        let mut store = MemoryKvStore::new();
        store.write("stat_max", &[1, 2]).unwrap();
        assert_eq!(
            store.read_u8("stat_max"),
            Err(KvError::WrongWidth {
                expected: 1,
                found: 2
            })
        );
    }

    #[test]
    fn test_capacity_limit() {
        let mut store = MemoryKvStore::with_capacity(16);
        store.write("a", &[0; 10]).unwrap();
        assert!(matches!(
            store.write("b", &[0; 10]),
            Err(KvError::Full { .. })
        ));
        // Overwriting an existing key only counts the difference
        store.write("a", &[0; 12]).unwrap();
    }

    #[test]
    fn test_injected_write_failures() {
        let mut store = MemoryKvStore::new();
        store.fail_next_writes(2);
        assert!(store.write_u8("stat_max", 3).is_err());
        assert!(store.write_u8("stat_max", 3).is_err());
        store.write_u8("stat_max", 3).unwrap();
        assert_eq!(store.read_u8("stat_max").unwrap(), Some(3));
    }
}
