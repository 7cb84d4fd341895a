//! Shared device state: persisted preferences and flags, volatile sensor
//! readings and session flags.
//!
//! Fields are partitioned by owner. The orchestrator owns run-state and
//! power-mode fields, the connectivity worker owns the quick-connect cache
//! (mirrored in here before every save), and sensor readings are refreshed by
//! whoever talks to the hardware.

pub mod record;
pub mod storage;

use heapless::String;

use crate::connectivity::LinkParams;
use crate::gesture::{ButtonId, NUM_BUTTONS};

pub use record::{RECORD_CAPACITY, RecordError};
pub use storage::{MemoryStorage, Storage, StorageError};

pub const SENSOR_INTERVAL_MIN: u8 = 1;
pub const SENSOR_INTERVAL_MAX: u8 = 30;
pub const SENSOR_INTERVAL_DEFAULT: u8 = 10;

pub const BUTTON_LABEL_MAX_LEN: usize = 15;
pub const DEVICE_NAME_MAX_LEN: usize = 32;
pub const SW_VERSION_MAX_LEN: usize = 16;
pub const HOST_MAX_LEN: usize = 64;
pub const CREDENTIAL_MAX_LEN: usize = 32;
pub const TOPIC_ROOT_MAX_LEN: usize = 48;

pub type ButtonLabel = String<BUTTON_LABEL_MAX_LEN>;

/// Flags and counters that survive deep sleep and restarts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PersistedFlags {
    pub low_batt_mode: bool,
    pub wifi_done: bool,
    pub setup_done: bool,
    pub last_sw_version: String<SW_VERSION_MAX_LEN>,
    pub user_awake_mode: bool,
    pub quick_connect: Option<LinkParams>,
    pub charge_complete_showing: bool,
    pub info_screen_showing: bool,
    pub check_connection: bool,
    pub failed_connections: u8,
    pub restart_to_wifi_setup: bool,
    pub restart_to_setup: bool,
    pub send_discovery_config: bool,
    pub silent_restart: bool,
}

impl PersistedFlags {
    /// Clears the one-shot flags consumed by a reset boot.
    pub fn clear_transient(&mut self) {
        self.quick_connect = None;
        self.charge_complete_showing = false;
        self.info_screen_showing = false;
        self.check_connection = false;
        self.failed_connections = 0;
        self.restart_to_wifi_setup = false;
        self.restart_to_setup = false;
        self.silent_restart = false;
    }
}

/// Broker connection settings entered during setup.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BrokerSettings {
    pub server: String<HOST_MAX_LEN>,
    pub port: u16,
    pub user: String<CREDENTIAL_MAX_LEN>,
    pub password: String<CREDENTIAL_MAX_LEN>,
    pub base_topic: String<TOPIC_ROOT_MAX_LEN>,
    pub discovery_prefix: String<TOPIC_ROOT_MAX_LEN>,
}

/// User preferences edited through setup or remote commands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Preferences {
    pub device_name: String<DEVICE_NAME_MAX_LEN>,
    pub broker: BrokerSettings,
    labels: [ButtonLabel; NUM_BUTTONS],
    sensor_interval: u8,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            device_name: String::new(),
            broker: BrokerSettings::default(),
            labels: core::array::from_fn(|_| ButtonLabel::new()),
            sensor_interval: SENSOR_INTERVAL_DEFAULT,
        }
    }
}

impl Preferences {
    /// Sensor publish interval in minutes.
    #[must_use]
    pub const fn sensor_interval(&self) -> u8 {
        self.sensor_interval
    }

    /// Sets the interval; values outside `1..=30` are rejected.
    pub fn set_sensor_interval(&mut self, minutes: u8) -> bool {
        if (SENSOR_INTERVAL_MIN..=SENSOR_INTERVAL_MAX).contains(&minutes) {
            self.sensor_interval = minutes;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn button_label(&self, id: ButtonId) -> &str {
        self.labels
            .get(id.index())
            .map_or("", |label| label.as_str())
    }

    /// Stores a label, truncated on a character boundary to the label limit.
    pub fn set_button_label(&mut self, id: ButtonId, label: &str) {
        if let Some(slot) = self.labels.get_mut(id.index()) {
            *slot = truncated(label);
        }
    }
}

/// Latest hardware readings; never persisted.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct SensorReadings {
    pub temperature: f32,
    pub humidity: f32,
    pub battery_pct: u8,
    pub charging: bool,
    pub dc_connected: bool,
    pub battery_present: bool,
    pub battery_low: bool,
}

/// Per-session flags; never persisted.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionFlags {
    pub display_redraw: bool,
    pub awake_mode: bool,
}

/// The single device record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceState {
    pub persisted: PersistedFlags,
    pub prefs: Preferences,
    pub sensors: SensorReadings,
    pub flags: SessionFlags,
}

impl DeviceState {
    /// Returns `true` when the persisted halves of both records match.
    #[must_use]
    pub fn persistent_eq(&self, other: &Self) -> bool {
        self.persisted == other.persisted && self.prefs == other.prefs
    }

    /// Factory reset: everything back to defaults.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Both setup stages completed.
    #[must_use]
    pub const fn is_provisioned(&self) -> bool {
        self.persisted.wifi_done && self.persisted.setup_done
    }
}

/// Copies `text` into a bounded string, cutting on a char boundary.
pub fn truncated<const N: usize>(text: &str) -> String<N> {
    let mut out = String::new();
    for ch in text.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}
