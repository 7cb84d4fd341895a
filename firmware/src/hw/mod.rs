//! Board-level helpers shared by the target drivers and host tests.
//!
//! Pin maps, ADC scaling and the edge-latch bank live here so the arithmetic
//! can be checked off-target; the esp-hal bindings are in [`board`].

use button_core::gesture::{ButtonId, EdgeLatch, NUM_BUTTONS};
use button_core::power::HardwareRevision;
use portable_atomic::{AtomicBool, Ordering};

use crate::shared::SharedGestures;
use crate::time::FirmwareInstant;

#[cfg(target_os = "none")]
pub mod board;

/// Board revision this firmware image is built for.
///
/// The runtime binds the rev 2.2 pins as typed esp-hal peripherals, so the
/// image only runs on 2.2 and 2.3 boards. Older revisions are exercised through
/// the core and the emulator's `board` command.
pub const REVISION: HardwareRevision = HardwareRevision::Rev2_2;

/// LED GPIO numbers indexed by [`ButtonId::index`].
pub const LED_PINS: [u8; NUM_BUTTONS] = [15, 16, 17, 2, 38, 37];

const ADC_FULL_SCALE: f32 = 4095.0;
const ADC_REFERENCE_VOLTS: f32 = 2.6;
const VBAT_DIVIDER: f32 = 0.5;

/// Battery voltage from a raw 12-bit sample of the divided rail.
pub fn battery_volts(raw: u16) -> f32 {
    f32::from(raw.min(4095)) / ADC_FULL_SCALE * ADC_REFERENCE_VOLTS / VBAT_DIVIDER
}

/// SHTC3 temperature/humidity sensor on the I2C bus (SDA GPIO10, SCL GPIO11).
pub mod shtc3 {
    pub const ADDRESS: u8 = 0x70;
    pub const WAKEUP: [u8; 2] = [0x35, 0x17];
    /// Normal mode, temperature first, no clock stretching.
    pub const MEASURE: [u8; 2] = [0x78, 0x66];
    pub const SLEEP: [u8; 2] = [0xb0, 0x98];
    /// Worst-case normal-mode conversion time.
    pub const MEASURE_MS: u32 = 13;

    /// Sensirion CRC-8 (poly 0x31, init 0xff).
    pub fn crc(bytes: &[u8]) -> u8 {
        bytes.iter().fold(0xff, |mut crc, byte| {
            crc ^= byte;
            for _ in 0..8 {
                crc = if crc & 0x80 == 0 {
                    crc << 1
                } else {
                    (crc << 1) ^ 0x31
                };
            }
            crc
        })
    }

    /// Decodes a measurement frame into (°C, %RH); `None` on a CRC mismatch.
    pub fn decode(frame: [u8; 6]) -> Option<(f32, f32)> {
        if crc(&frame[0..2]) != frame[2] || crc(&frame[3..5]) != frame[5] {
            return None;
        }
        let raw_t = f32::from(u16::from_be_bytes([frame[0], frame[1]]));
        let raw_h = f32::from(u16::from_be_bytes([frame[3], frame[4]]));
        Some((-45.0 + 175.0 * raw_t / 65536.0, 100.0 * raw_h / 65536.0))
    }
}

/// EXT1-style wake mask rebuilt from button levels sampled right after boot.
///
/// Returns 0 when nothing is held, which the core maps to a reset boot.
pub fn wake_mask_from_levels(revision: HardwareRevision, pressed: [bool; NUM_BUTTONS]) -> u64 {
    revision
        .button_pins()
        .iter()
        .zip(pressed)
        .filter(|(_, held)| *held)
        .fold(0, |mask, (pin, _)| mask | (1u64 << pin))
}

/// One sticky edge latch and the last seen level per button, written by
/// the pin waiters.
pub struct EdgeBank {
    latches: [EdgeLatch; NUM_BUTTONS],
    levels: [AtomicBool; NUM_BUTTONS],
}

impl EdgeBank {
    pub const fn new() -> Self {
        Self {
            latches: [
                EdgeLatch::new(),
                EdgeLatch::new(),
                EdgeLatch::new(),
                EdgeLatch::new(),
                EdgeLatch::new(),
                EdgeLatch::new(),
            ],
            levels: [
                AtomicBool::new(false),
                AtomicBool::new(false),
                AtomicBool::new(false),
                AtomicBool::new(false),
                AtomicBool::new(false),
                AtomicBool::new(false),
            ],
        }
    }

    pub fn latch(&self, id: ButtonId) -> &EdgeLatch {
        &self.latches[id.index()]
    }

    /// Seeds the level without latching an edge.
    pub fn set_level(&self, id: ButtonId, pressed: bool) {
        self.levels[id.index()].store(pressed, Ordering::Release);
    }

    /// Records an edge observed by a pin waiter along with the new level.
    pub fn record(&self, id: ButtonId, pressed: bool) {
        self.set_level(id, pressed);
        self.latch(id).record_edge(pressed);
    }

    pub fn is_pressed(&self, id: ButtonId) -> bool {
        self.levels[id.index()].load(Ordering::Acquire)
    }

    /// Hands every button's edges and current level to the classifiers.
    pub fn feed(
        &self,
        gestures: SharedGestures<'_>,
        now: FirmwareInstant,
        mut level: impl FnMut(ButtonId) -> bool,
    ) {
        for id in ButtonId::all() {
            let edges = self.latch(id).take();
            gestures.update(id, now, edges, level(id));
        }
    }
}

impl Default for EdgeBank {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use button_core::gesture::{Action, GesturePort, GestureTimings};
    use button_core::orchestrator::{BootCause, WakeReason};

    use crate::shared::gesture_cell;

    fn button(n: u8) -> ButtonId {
        ButtonId::new(n).expect("valid button")
    }

    #[test]
    fn battery_scaling_matches_divider() {
        assert!((battery_volts(0) - 0.0).abs() < f32::EPSILON);
        assert!((battery_volts(4095) - 5.2).abs() < 0.001);
        let half = battery_volts(3150);
        assert!((half - 4.0).abs() < 0.01, "got {half}");
        assert!((battery_volts(u16::MAX) - 5.2).abs() < 0.001);
    }

    #[test]
    fn shtc3_frames_are_checked_and_scaled() {
        assert_eq!(shtc3::crc(&[0xbe, 0xef]), 0x92);

        let t = [0x66, 0x66];
        let h = [0x80, 0x00];
        let frame = [t[0], t[1], shtc3::crc(&t), h[0], h[1], shtc3::crc(&h)];
        let (celsius, humidity) = shtc3::decode(frame).expect("valid frame");
        assert!((celsius - 25.0).abs() < 0.01, "got {celsius}");
        assert!((humidity - 50.0).abs() < 0.01, "got {humidity}");

        let mut bad = frame;
        bad[4] ^= 1;
        assert_eq!(shtc3::decode(bad), None);
    }

    #[test]
    fn held_button_becomes_the_boot_cause() {
        let mut pressed = [false; NUM_BUTTONS];
        pressed[4] = true;
        let mask = wake_mask_from_levels(REVISION, pressed);
        assert_eq!(mask, 1 << 21);
        assert_eq!(
            BootCause::from_wake(WakeReason::ButtonMask(mask), REVISION),
            BootCause::Button(button(5))
        );
        assert_eq!(wake_mask_from_levels(REVISION, [false; NUM_BUTTONS]), 0);
    }

    #[test]
    fn wake_mask_is_subset_of_revision_mask() {
        let mask = wake_mask_from_levels(REVISION, [true; NUM_BUTTONS]);
        assert_eq!(mask, REVISION.wake_mask());
    }

    #[test]
    fn latched_edges_reach_the_classifier() {
        let bank = EdgeBank::new();
        let cell = gesture_cell(GestureTimings::default());
        let gestures = SharedGestures::new(&cell);
        let mut port = SharedGestures::new(&cell);
        port.start();

        let id = button(2);
        let mut held = true;
        bank.latch(id).record_edge(true);
        bank.feed(gestures, FirmwareInstant::from_millis(0), |b| b == id && held);
        bank.feed(gestures, FirmwareInstant::from_millis(60), |b| b == id && held);
        held = false;
        bank.latch(id).record_edge(false);
        bank.feed(gestures, FirmwareInstant::from_millis(120), |b| b == id && held);
        for ms in (140..1_000).step_by(20) {
            bank.feed(gestures, FirmwareInstant::from_millis(ms), |_| false);
        }

        assert_eq!(port.active(), Some(id));
        assert_eq!(port.snapshot(id).action, Action::Single);
        assert_eq!(bank.latch(id).take(), button_core::gesture::Edges::default());
    }

    #[test]
    fn recorded_edges_track_the_level() {
        let bank = EdgeBank::new();
        let id = button(6);
        bank.set_level(id, true);
        assert!(bank.is_pressed(id));
        assert_eq!(bank.latch(id).take(), button_core::gesture::Edges::default());

        bank.record(id, false);
        assert!(!bank.is_pressed(id));
        assert!(bank.latch(id).take().falling);
    }
}
