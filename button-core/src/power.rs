//! Power-mode selection and per-revision hardware data.

use core::fmt;

use crate::gesture::{ButtonId, NUM_BUTTONS};

/// Run mode chosen once per boot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PowerMode {
    Sleep,
    Awake,
}

impl fmt::Display for PowerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Battery thresholds in volts for one hardware revision.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BatteryThresholds {
    /// Below this (confirmed twice) the device enters low-battery mode.
    pub min: f32,
    /// Low-battery mode is released at or above this voltage.
    pub recovery: f32,
    /// At or below this a low-battery warning is shown after clicks.
    pub warn: f32,
    pub full: f32,
    pub empty: f32,
    /// While on DC and below this, charging forces awake mode.
    pub charge_awake: Option<f32>,
    /// Minimum reading that counts as a battery being present.
    pub present: Option<f32>,
}

/// Supported board revisions. Numbers are kept per revision and not unified.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HardwareRevision {
    Rev1_0,
    /// Also used for 2.1 boards.
    Rev2_0,
    /// Also used for 2.3 boards.
    Rev2_2,
}

impl HardwareRevision {
    /// Parses the factory `major.minor` string.
    #[must_use]
    pub fn parse(version: &str) -> Option<Self> {
        match version {
            "1.0" => Some(Self::Rev1_0),
            "2.0" | "2.1" => Some(Self::Rev2_0),
            "2.2" | "2.3" => Some(Self::Rev2_2),
            _ => None,
        }
    }

    #[must_use]
    pub const fn thresholds(self) -> BatteryThresholds {
        match self {
            Self::Rev1_0 | Self::Rev2_0 => BatteryThresholds {
                min: 3.3,
                recovery: 3.5,
                warn: 3.5,
                full: 4.2,
                empty: 3.3,
                charge_awake: None,
                present: None,
            },
            Self::Rev2_2 => BatteryThresholds {
                min: 3.3,
                recovery: 3.5,
                warn: 3.5,
                full: 4.2,
                empty: 3.3,
                charge_awake: Some(4.0),
                present: Some(1.0),
            },
        }
    }

    /// GPIO numbers indexed by [`ButtonId::index`].
    #[must_use]
    pub const fn button_pins(self) -> [u8; NUM_BUTTONS] {
        match self {
            Self::Rev1_0 => [1, 6, 2, 5, 3, 4],
            Self::Rev2_0 | Self::Rev2_2 => [5, 4, 6, 3, 21, 1],
        }
    }

    /// EXT1 wake mask covering every button pin.
    #[must_use]
    pub const fn wake_mask(self) -> u64 {
        let pins = self.button_pins();
        let mut mask = 0u64;
        let mut i = 0;
        while i < NUM_BUTTONS {
            mask |= 1 << pins[i];
            i += 1;
        }
        mask
    }

    /// Revisions before 2.2 cannot sense DC input or battery presence.
    #[must_use]
    pub const fn has_power_sensing(self) -> bool {
        matches!(self, Self::Rev2_2)
    }

    /// Maps a wake pin to its button.
    #[must_use]
    pub fn button_for_pin(self, pin: u8) -> Option<ButtonId> {
        self.button_pins()
            .iter()
            .position(|candidate| *candidate == pin)
            .and_then(ButtonId::from_index)
    }

    /// Picks the button from an EXT1 wake status mask (lowest set pin).
    #[must_use]
    pub fn button_for_mask(self, mask: u64) -> Option<ButtonId> {
        if mask == 0 {
            return None;
        }
        let pin = u8::try_from(mask.trailing_zeros()).ok()?;
        self.button_for_pin(pin)
    }
}

/// Readings taken at boot.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PowerInputs {
    pub battery_present: bool,
    pub dc_connected: bool,
    pub battery_volts: f32,
}

/// What the boot sequence must do after the power decision.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PowerAction {
    Continue,
    /// Go straight back to sleep (low battery, or no power source at all).
    SleepNow,
    /// Low-battery mode was released; restart so the display is redrawn.
    RestartNow,
}

/// Result of [`determine_power_mode`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PowerDecision {
    pub mode: PowerMode,
    pub low_batt_mode: bool,
    pub battery_low: bool,
    pub charging: bool,
    pub action: PowerAction,
    /// Low-battery mode was entered during this decision.
    pub entered_low_batt: bool,
}

/// Chooses the power mode for this boot.
///
/// `reread` supplies a second voltage sample used to confirm a reading under
/// the minimum before low-battery mode is entered.
pub fn determine_power_mode(
    inputs: PowerInputs,
    thresholds: &BatteryThresholds,
    user_awake_mode: bool,
    low_batt_mode: bool,
    mut reread: impl FnMut() -> f32,
) -> PowerDecision {
    let mut decision = PowerDecision {
        mode: PowerMode::Sleep,
        low_batt_mode,
        battery_low: false,
        charging: false,
        action: PowerAction::Continue,
        entered_low_batt: false,
    };
    let volts = inputs.battery_volts;

    match (inputs.battery_present, inputs.dc_connected) {
        (true, true) => {
            let below_charge = thresholds.charge_awake.is_some_and(|limit| volts < limit);
            if below_charge {
                decision.charging = true;
                decision.mode = PowerMode::Awake;
            } else if user_awake_mode {
                decision.mode = PowerMode::Awake;
            }
            decision.low_batt_mode = false;
        }
        (true, false) => {
            if low_batt_mode {
                if volts >= thresholds.recovery {
                    decision.low_batt_mode = false;
                    decision.action = PowerAction::RestartNow;
                } else {
                    decision.action = PowerAction::SleepNow;
                }
            } else if volts < thresholds.min {
                if reread() < thresholds.min {
                    decision.low_batt_mode = true;
                    decision.entered_low_batt = true;
                    decision.action = PowerAction::SleepNow;
                }
            } else if volts <= thresholds.warn {
                decision.battery_low = true;
            }
        }
        (false, true) => {
            decision.low_batt_mode = false;
            if user_awake_mode {
                decision.mode = PowerMode::Awake;
            }
        }
        (false, false) => {
            decision.action = PowerAction::SleepNow;
        }
    }

    decision
}

/// Linear battery percentage between the empty and full voltages.
#[must_use]
pub fn battery_percent(volts: f32, thresholds: &BatteryThresholds) -> u8 {
    let span = thresholds.full - thresholds.empty;
    if span <= 0.0 {
        return 0;
    }
    let pct = 100.0 * (volts - thresholds.empty) / span;
    if pct <= 0.0 {
        0
    } else if pct >= 100.0 {
        100
    } else {
        // Round half up without libm.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let rounded = (pct + 0.5) as u8;
        rounded
    }
}
