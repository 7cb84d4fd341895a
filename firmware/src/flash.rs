//! Device record on NOR flash.
//!
//! One record slot at a fixed offset, written through any
//! `embedded_storage::Storage` (esp-storage's `FlashStorage` on target). The
//! backend is expected to handle sector erase on write.

use button_core::state::record::{self, RECORD_CAPACITY};
use button_core::state::{DeviceState, Storage, StorageError};
use embedded_storage::Storage as NorStorage;

/// Start of the data partition reserved for the record.
pub const RECORD_OFFSET: u32 = 0x9000;

const ERASED: u8 = 0xff;

/// [`Storage`] backed by a flash region.
pub struct RecordFlash<F> {
    flash: F,
    offset: u32,
}

impl<F: NorStorage> RecordFlash<F> {
    pub const fn new(flash: F, offset: u32) -> Self {
        Self { flash, offset }
    }

    #[cfg(test)]
    fn into_inner(self) -> F {
        self.flash
    }
}

impl<F: NorStorage> Storage for RecordFlash<F> {
    fn load_all(&mut self) -> Result<DeviceState, StorageError> {
        let mut buf = [0u8; RECORD_CAPACITY];
        self.flash
            .read(self.offset, &mut buf)
            .map_err(|_| StorageError::Io)?;
        if buf[..4].iter().all(|&byte| byte == ERASED) {
            return Err(StorageError::Empty);
        }
        Ok(record::decode(&buf)?)
    }

    fn save_all(&mut self, state: &DeviceState) -> Result<(), StorageError> {
        let mut buf = [ERASED; RECORD_CAPACITY];
        let len = record::encode(state, &mut buf)?;
        self.flash
            .write(self.offset, &buf[..len])
            .map_err(|_| StorageError::Io)
    }

    fn clear_all(&mut self) -> Result<(), StorageError> {
        let blank = [ERASED; RECORD_CAPACITY];
        self.flash
            .write(self.offset, &blank)
            .map_err(|_| StorageError::Io)
    }
}
