//! Tagged-record nonvolatile storage
//!
//! Persistent data (certificates, device identity) is kept as fixed-length
//! records addressed by a small integer tag, the layout used by EEPROM
//! record managers on constrained boards.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

/// Record identifier.
pub type RecordTag = u16;

/// Tag reserved for unused storage.
pub const TAG_FREE_SPACE: RecordTag = 0xFFFE;

/// Tag reserved for the end-of-records marker.
pub const TAG_END_MARKER: RecordTag = 0xFFFF;

/// Record storage errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageError {
    /// Unrecoverable device fault
    FatalError,
    /// Storage driver not yet initialised
    NotReady,
    /// No record exists for the tag
    NoRecord,
    /// Insufficient free space for the record
    OutOfMemory,
    /// A record already exists for the tag
    TagExists,
    /// Stored data failed integrity checks
    FormattingError,
    /// Tag is reserved
    InvalidTag,
    /// Length does not fit the record or the caller's buffer
    InvalidLength,
}

impl core::fmt::Display for StorageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::FatalError => write!(f, "Storage fatal error"),
            Self::NotReady => write!(f, "Storage not ready"),
            Self::NoRecord => write!(f, "No such record"),
            Self::OutOfMemory => write!(f, "Storage full"),
            Self::TagExists => write!(f, "Record tag already exists"),
            Self::FormattingError => write!(f, "Storage formatting error"),
            Self::InvalidTag => write!(f, "Invalid record tag"),
            Self::InvalidLength => write!(f, "Invalid record length"),
        }
    }
}

impl core::error::Error for StorageError {}

/// Fixed-length tagged record storage.
pub trait RecordStore {
    /// Creates a record of `length` bytes, optionally filled with `initial`
    /// (zero padded). Fails with [`StorageError::TagExists`] if present.
    fn create(
        &mut self,
        tag: RecordTag,
        length: usize,
        initial: Option<&[u8]>,
    ) -> Result<(), StorageError>;

    /// Overwrites the start of an existing record.
    fn write(&mut self, tag: RecordTag, data: &[u8]) -> Result<(), StorageError>;

    /// Reads the whole record into `out`, returning the record length.
    fn read_all(&self, tag: RecordTag, out: &mut [u8]) -> Result<usize, StorageError>;

    /// Length of an existing record.
    fn record_len(&self, tag: RecordTag) -> Result<usize, StorageError>;

    /// Deletes a record.
    fn remove(&mut self, tag: RecordTag) -> Result<(), StorageError>;
}

fn check_tag(tag: RecordTag) -> Result<(), StorageError> {
    if tag == TAG_FREE_SPACE || tag == TAG_END_MARKER {
        Err(StorageError::InvalidTag)
    } else {
        Ok(())
    }
}

/// RAM-backed record store with a total byte capacity.
#[derive(Debug, Clone)]
pub struct MemoryRecordStore {
    records: BTreeMap<RecordTag, Vec<u8>>,
    capacity: usize,
}

impl MemoryRecordStore {
    /// Creates an empty store holding at most `capacity` bytes of records.
    pub fn new(capacity: usize) -> Self {
        Self {
            records: BTreeMap::new(),
            capacity,
        }
    }

    fn used(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new(8 * 1024)
    }
}

impl RecordStore for MemoryRecordStore {
    fn create(
        &mut self,
        tag: RecordTag,
        length: usize,
        initial: Option<&[u8]>,
    ) -> Result<(), StorageError> {
        check_tag(tag)?;
        if self.records.contains_key(&tag) {
            return Err(StorageError::TagExists);
        }
        if length == 0 {
            return Err(StorageError::InvalidLength);
        }
        if self.used() + length > self.capacity {
            return Err(StorageError::OutOfMemory);
        }

        let mut record = vec![0u8; length];
        if let Some(data) = initial {
            if data.len() > length {
                return Err(StorageError::InvalidLength);
            }
            record[..data.len()].copy_from_slice(data);
        }
        self.records.insert(tag, record);
        Ok(())
    }

    fn write(&mut self, tag: RecordTag, data: &[u8]) -> Result<(), StorageError> {
        check_tag(tag)?;
        let record = self.records.get_mut(&tag).ok_or(StorageError::NoRecord)?;
        if data.len() > record.len() {
            return Err(StorageError::InvalidLength);
        }
        record[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_all(&self, tag: RecordTag, out: &mut [u8]) -> Result<usize, StorageError> {
        check_tag(tag)?;
        let record = self.records.get(&tag).ok_or(StorageError::NoRecord)?;
        if out.len() < record.len() {
            return Err(StorageError::InvalidLength);
        }
        out[..record.len()].copy_from_slice(record);
        Ok(record.len())
    }

    fn record_len(&self, tag: RecordTag) -> Result<usize, StorageError> {
        check_tag(tag)?;
        self.records
            .get(&tag)
            .map(Vec::len)
            .ok_or(StorageError::NoRecord)
    }

    fn remove(&mut self, tag: RecordTag) -> Result<(), StorageError> {
        check_tag(tag)?;
        self.records
            .remove(&tag)
            .map(|_| ())
            .ok_or(StorageError::NoRecord)
    }
}
