//! Collaborator seams the orchestrator drives.

use core::time::Duration;

use crate::connectivity::LinkControl;
use crate::gesture::{ButtonId, GesturePort};
use crate::led::LedPort;
use crate::power::HardwareRevision;
use crate::publish::PublishQueueProducer;
use crate::state::Storage;
use crate::time::Timestamp;

use super::PowerTransition;

/// Raw wake source reported by the chip after reset.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WakeReason {
    PowerOn,
    Timer,
    /// EXT1 wake with the GPIO status mask.
    ButtonMask(u64),
    Other,
}

/// Sensors and board-level signals.
pub trait Hardware {
    fn revision(&self) -> HardwareRevision;

    fn wake_reason(&self) -> WakeReason;

    fn button_pressed(&mut self, id: ButtonId) -> bool;

    fn read_battery_voltage(&mut self) -> f32;

    fn is_dc_connected(&mut self) -> bool;

    fn is_battery_present(&mut self) -> bool;

    fn is_charger_in_standby(&mut self) -> bool;

    fn enable_charger(&mut self, enable: bool);

    /// Temperature in °C and relative humidity in %.
    fn read_temp_humidity(&mut self) -> (f32, f32);

    /// Lowest free heap observed, in bytes.
    fn free_memory(&self) -> u32;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DisplayState {
    Idle,
    Busy,
}

/// E-paper front end. Rendering happens elsewhere; calls only queue pages.
pub trait Display {
    fn disp_main(&mut self);

    fn disp_info(&mut self);

    fn disp_welcome(&mut self);

    /// Shows a message, optionally reverting to the previous page after `duration`.
    fn disp_message(&mut self, text: &str, duration: Option<Duration>);

    fn disp_error(&mut self, text: &str, duration: Option<Duration>);

    /// Finishes pending updates and powers the panel down.
    fn end(&mut self);

    fn state(&self) -> DisplayState;
}

/// Final power transitions. Implementations never return.
pub trait PowerControl {
    fn enter_low_power_sleep(&mut self, wake_after: Option<Duration>, button_mask: u64) -> !;

    fn restart(&mut self) -> !;

    /// Hands control to the provisioning layer; defaults to a plain restart.
    fn enter_setup(&mut self, kind: SetupKind) -> ! {
        let _ = kind;
        self.restart()
    }

    fn apply(&mut self, transition: PowerTransition) -> ! {
        match transition {
            PowerTransition::Sleep {
                wake_after,
                button_mask,
            } => self.enter_low_power_sleep(wake_after, button_mask),
            PowerTransition::Restart => self.restart(),
            PowerTransition::Setup(kind) => self.enter_setup(kind),
        }
    }
}

/// Which provisioning flow a restart leads into.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SetupKind {
    /// Broker and device settings.
    Device,
    /// Wi-Fi credentials.
    Wifi,
}

/// Bundle of collaborators handed to the orchestrator on every poll.
pub trait Platform {
    type Instant: Timestamp;
    type Hardware: Hardware;
    type Display: Display;
    type Storage: Storage;
    type Gestures: GesturePort<Instant = Self::Instant>;
    type Leds: LedPort;
    type Link: LinkControl;
    type Queue: PublishQueueProducer;

    fn hardware(&mut self) -> &mut Self::Hardware;
    fn display(&mut self) -> &mut Self::Display;
    fn storage(&mut self) -> &mut Self::Storage;
    fn gestures(&mut self) -> &mut Self::Gestures;
    fn leds(&mut self) -> &mut Self::Leds;
    fn link(&mut self) -> &mut Self::Link;
    fn queue(&mut self) -> &mut Self::Queue;
}
