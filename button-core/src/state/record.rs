//! Fixed-layout persistence record for [`DeviceState`].
//!
//! ```text
//! magic:u32 LE | version:u8 | reserved:u8 | body_len:u16 LE | body | fletcher16:u16 LE
//! ```
//!
//! The checksum covers header and body. Only the persisted half of the state
//! (flags and preferences) is encoded; sensor readings and session flags come
//! back as defaults.

use core::fmt;

use heapless::String;

use super::{DeviceState, PersistedFlags, Preferences};
use crate::connectivity::LinkParams;
use crate::gesture::ButtonId;

pub const RECORD_MAGIC: u32 = 0x4842_5354;
pub const RECORD_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 8;
pub const CHECKSUM_LEN: usize = 2;
/// Upper bound on an encoded record.
pub const RECORD_CAPACITY: usize = 512;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RecordError {
    BufferTooSmall,
    Truncated,
    BadMagic,
    UnsupportedVersion(u8),
    LengthMismatch,
    BadChecksum,
    InvalidString,
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Encodes the persisted half of `state` into `buf`, returning the used length.
///
/// # Errors
///
/// Returns [`RecordError::BufferTooSmall`] when `buf` cannot hold the record.
pub fn encode(state: &DeviceState, buf: &mut [u8]) -> Result<usize, RecordError> {
    if buf.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(RecordError::BufferTooSmall);
    }
    let (header, rest) = buf.split_at_mut(HEADER_LEN);
    let body_len = {
        let mut writer = Writer::new(rest);
        write_persisted(&mut writer, &state.persisted)?;
        write_prefs(&mut writer, &state.prefs)?;
        writer.pos
    };
    let body_len_u16 = u16::try_from(body_len).map_err(|_| RecordError::BufferTooSmall)?;

    header[0..4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
    header[4] = RECORD_VERSION;
    header[5] = 0;
    header[6..8].copy_from_slice(&body_len_u16.to_le_bytes());

    let total = HEADER_LEN + body_len;
    if buf.len() < total + CHECKSUM_LEN {
        return Err(RecordError::BufferTooSmall);
    }
    let checksum = fletcher16(&buf[..total]);
    buf[total..total + CHECKSUM_LEN].copy_from_slice(&checksum.to_le_bytes());
    Ok(total + CHECKSUM_LEN)
}

/// Decodes a record produced by [`encode`].
///
/// # Errors
///
/// Rejects records with a foreign magic, an unknown version, a length that
/// does not match the buffer, or a failing checksum.
pub fn decode(bytes: &[u8]) -> Result<DeviceState, RecordError> {
    if bytes.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(RecordError::Truncated);
    }
    let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic != RECORD_MAGIC {
        return Err(RecordError::BadMagic);
    }
    if bytes[4] != RECORD_VERSION {
        return Err(RecordError::UnsupportedVersion(bytes[4]));
    }
    let body_len = usize::from(u16::from_le_bytes([bytes[6], bytes[7]]));
    let total = HEADER_LEN + body_len;
    if bytes.len() < total + CHECKSUM_LEN {
        return Err(RecordError::LengthMismatch);
    }
    let stored = u16::from_le_bytes([bytes[total], bytes[total + 1]]);
    if fletcher16(&bytes[..total]) != stored {
        return Err(RecordError::BadChecksum);
    }

    let mut reader = Reader::new(&bytes[HEADER_LEN..total]);
    let persisted = read_persisted(&mut reader)?;
    let prefs = read_prefs(&mut reader)?;
    if reader.remaining() != 0 {
        return Err(RecordError::LengthMismatch);
    }
    Ok(DeviceState {
        persisted,
        prefs,
        ..DeviceState::default()
    })
}

/// Fletcher-16 over `data`.
#[must_use]
pub fn fletcher16(data: &[u8]) -> u16 {
    let mut sum1: u16 = 0;
    let mut sum2: u16 = 0;
    for &byte in data {
        sum1 = (sum1 + u16::from(byte)) % 255;
        sum2 = (sum2 + sum1) % 255;
    }
    (sum2 << 8) | sum1
}

const FLAG_LOW_BATT: u16 = 1 << 0;
const FLAG_WIFI_DONE: u16 = 1 << 1;
const FLAG_SETUP_DONE: u16 = 1 << 2;
const FLAG_USER_AWAKE: u16 = 1 << 3;
const FLAG_CHARGE_COMPLETE: u16 = 1 << 4;
const FLAG_INFO_SCREEN: u16 = 1 << 5;
const FLAG_CHECK_CONNECTION: u16 = 1 << 6;
const FLAG_RESTART_WIFI_SETUP: u16 = 1 << 7;
const FLAG_RESTART_SETUP: u16 = 1 << 8;
const FLAG_SEND_DISCOVERY: u16 = 1 << 9;
const FLAG_SILENT_RESTART: u16 = 1 << 10;

fn write_persisted(writer: &mut Writer<'_>, flags: &PersistedFlags) -> Result<(), RecordError> {
    let bits = [
        (flags.low_batt_mode, FLAG_LOW_BATT),
        (flags.wifi_done, FLAG_WIFI_DONE),
        (flags.setup_done, FLAG_SETUP_DONE),
        (flags.user_awake_mode, FLAG_USER_AWAKE),
        (flags.charge_complete_showing, FLAG_CHARGE_COMPLETE),
        (flags.info_screen_showing, FLAG_INFO_SCREEN),
        (flags.check_connection, FLAG_CHECK_CONNECTION),
        (flags.restart_to_wifi_setup, FLAG_RESTART_WIFI_SETUP),
        (flags.restart_to_setup, FLAG_RESTART_SETUP),
        (flags.send_discovery_config, FLAG_SEND_DISCOVERY),
        (flags.silent_restart, FLAG_SILENT_RESTART),
    ]
    .iter()
    .filter(|(set, _)| *set)
    .fold(0u16, |acc, (_, bit)| acc | bit);

    writer.put_u16(bits)?;
    writer.put_u8(flags.failed_connections)?;
    writer.put_str(flags.last_sw_version.as_str())?;
    match flags.quick_connect {
        Some(params) => {
            writer.put_u8(1)?;
            writer.put_bytes(&params.bssid)?;
            writer.put_u8(params.channel)
        }
        None => writer.put_u8(0),
    }
}

fn read_persisted(reader: &mut Reader<'_>) -> Result<PersistedFlags, RecordError> {
    let bits = reader.take_u16()?;
    let has = |bit: u16| bits & bit != 0;
    let failed_connections = reader.take_u8()?;
    let last_sw_version = reader.take_str()?;
    let quick_connect = match reader.take_u8()? {
        0 => None,
        _ => {
            let mut bssid = [0u8; 6];
            bssid.copy_from_slice(reader.take_bytes(6)?);
            Some(LinkParams {
                bssid,
                channel: reader.take_u8()?,
            })
        }
    };
    Ok(PersistedFlags {
        low_batt_mode: has(FLAG_LOW_BATT),
        wifi_done: has(FLAG_WIFI_DONE),
        setup_done: has(FLAG_SETUP_DONE),
        last_sw_version,
        user_awake_mode: has(FLAG_USER_AWAKE),
        quick_connect,
        charge_complete_showing: has(FLAG_CHARGE_COMPLETE),
        info_screen_showing: has(FLAG_INFO_SCREEN),
        check_connection: has(FLAG_CHECK_CONNECTION),
        failed_connections,
        restart_to_wifi_setup: has(FLAG_RESTART_WIFI_SETUP),
        restart_to_setup: has(FLAG_RESTART_SETUP),
        send_discovery_config: has(FLAG_SEND_DISCOVERY),
        silent_restart: has(FLAG_SILENT_RESTART),
    })
}

fn write_prefs(writer: &mut Writer<'_>, prefs: &Preferences) -> Result<(), RecordError> {
    writer.put_str(prefs.device_name.as_str())?;
    writer.put_u8(prefs.sensor_interval())?;
    for id in ButtonId::all() {
        writer.put_str(prefs.button_label(id))?;
    }
    let broker = &prefs.broker;
    writer.put_str(broker.server.as_str())?;
    writer.put_u16(broker.port)?;
    writer.put_str(broker.user.as_str())?;
    writer.put_str(broker.password.as_str())?;
    writer.put_str(broker.base_topic.as_str())?;
    writer.put_str(broker.discovery_prefix.as_str())
}

fn read_prefs(reader: &mut Reader<'_>) -> Result<Preferences, RecordError> {
    let mut prefs = Preferences {
        device_name: reader.take_str()?,
        ..Preferences::default()
    };
    // Out-of-range intervals from older records fall back to the default.
    let _ = prefs.set_sensor_interval(reader.take_u8()?);
    for id in ButtonId::all() {
        let label: String<{ super::BUTTON_LABEL_MAX_LEN }> = reader.take_str()?;
        prefs.set_button_label(id, label.as_str());
    }
    prefs.broker.server = reader.take_str()?;
    prefs.broker.port = reader.take_u16()?;
    prefs.broker.user = reader.take_str()?;
    prefs.broker.password = reader.take_str()?;
    prefs.broker.base_topic = reader.take_str()?;
    prefs.broker.discovery_prefix = reader.take_str()?;
    Ok(prefs)
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), RecordError> {
        // Keep room for the trailing checksum.
        let end = self.pos + bytes.len();
        if end + CHECKSUM_LEN > self.buf.len() {
            return Err(RecordError::BufferTooSmall);
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    fn put_u8(&mut self, value: u8) -> Result<(), RecordError> {
        self.put_bytes(&[value])
    }

    fn put_u16(&mut self, value: u16) -> Result<(), RecordError> {
        self.put_bytes(&value.to_le_bytes())
    }

    fn put_str(&mut self, value: &str) -> Result<(), RecordError> {
        let len = u8::try_from(value.len()).map_err(|_| RecordError::InvalidString)?;
        self.put_u8(len)?;
        self.put_bytes(value.as_bytes())
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take_bytes(&mut self, len: usize) -> Result<&'a [u8], RecordError> {
        let end = self.pos + len;
        let slice = self.bytes.get(self.pos..end).ok_or(RecordError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, RecordError> {
        Ok(self.take_bytes(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16, RecordError> {
        let raw = self.take_bytes(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn take_str<const N: usize>(&mut self) -> Result<String<N>, RecordError> {
        let len = usize::from(self.take_u8()?);
        let raw = self.take_bytes(len)?;
        let text = core::str::from_utf8(raw).map_err(|_| RecordError::InvalidString)?;
        let mut out = String::new();
        out.push_str(text).map_err(|_| RecordError::InvalidString)?;
        Ok(out)
    }
}
