//! Non-volatile storage seam for [`DeviceState`].

use core::fmt;

use heapless::Vec;

use super::DeviceState;
use super::record::{self, RECORD_CAPACITY, RecordError};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StorageError {
    /// Nothing has been saved yet.
    Empty,
    Corrupt(RecordError),
    Io,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<RecordError> for StorageError {
    fn from(value: RecordError) -> Self {
        StorageError::Corrupt(value)
    }
}

/// Persistent storage for the device record.
pub trait Storage {
    /// Loads the last saved record.
    ///
    /// # Errors
    ///
    /// [`StorageError::Empty`] on a blank device, [`StorageError::Corrupt`]
    /// when the stored bytes fail validation.
    fn load_all(&mut self) -> Result<DeviceState, StorageError>;

    /// Saves the persisted half of `state`.
    ///
    /// # Errors
    ///
    /// Propagates backend write failures.
    fn save_all(&mut self, state: &DeviceState) -> Result<(), StorageError>;

    /// Wipes the stored record.
    ///
    /// # Errors
    ///
    /// Propagates backend erase failures.
    fn clear_all(&mut self) -> Result<(), StorageError>;
}

/// RAM-backed storage that still goes through the record codec.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    bytes: Vec<u8, RECORD_CAPACITY>,
    saves: u32,
    fail_writes: bool,
}

impl MemoryStorage {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes: Vec::new(),
            saves: 0,
            fail_writes: false,
        }
    }

    /// Starts from an already saved state.
    ///
    /// # Errors
    ///
    /// Fails when `state` does not fit a record.
    pub fn with_state(state: &DeviceState) -> Result<Self, StorageError> {
        let mut storage = Self::new();
        storage.save_all(state)?;
        storage.saves = 0;
        Ok(storage)
    }

    /// Number of successful saves.
    #[must_use]
    pub const fn saves(&self) -> u32 {
        self.saves
    }

    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    #[must_use]
    pub fn raw(&self) -> &[u8] {
        &self.bytes
    }
}

impl Storage for MemoryStorage {
    fn load_all(&mut self) -> Result<DeviceState, StorageError> {
        if self.bytes.is_empty() {
            return Err(StorageError::Empty);
        }
        Ok(record::decode(&self.bytes)?)
    }

    fn save_all(&mut self, state: &DeviceState) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::Io);
        }
        let mut buf = [0u8; RECORD_CAPACITY];
        let len = record::encode(state, &mut buf)?;
        self.bytes.clear();
        self.bytes
            .extend_from_slice(&buf[..len])
            .map_err(|_| StorageError::Io)?;
        self.saves = self.saves.saturating_add(1);
        Ok(())
    }

    fn clear_all(&mut self) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::Io);
        }
        self.bytes.clear();
        Ok(())
    }
}
