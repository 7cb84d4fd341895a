//! LED feedback patterns.
//!
//! Every LED runs an independent [`LedFeedback`] machine. Commands are whole
//! [`LedCommand`] values: a new command replaces whatever pattern is running,
//! so a half-applied pattern is never observable.

use core::time::Duration;

use crate::gesture::{ButtonId, NUM_BUTTONS};
use crate::time::Timestamp;

/// Maximum number of blinks a single pattern may request.
pub const MAX_BLINKS: u8 = 5;

/// On/off timings used for 1, 2, 3 and 4+ blinks.
const BLINK_TIMINGS_MS: [(u64, u64); 4] = [(400, 400), (100, 300), (67, 200), (50, 150)];

/// Default pulse period for attention patterns.
pub const DEFAULT_PULSE_CYCLE: Duration = Duration::from_millis(2_000);

/// Blink request, applied as a unit.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BlinkPattern {
    count: u8,
    pub brightness: u8,
    pub on: Duration,
    pub off: Duration,
    /// Keep the LED lit after the last blink.
    pub hold: bool,
}

impl BlinkPattern {
    /// Builds a pattern with explicit timings; `count` is clamped to 1..=5.
    #[must_use]
    pub fn new(count: u8, brightness: u8, on: Duration, off: Duration, hold: bool) -> Self {
        Self {
            count: count.clamp(1, MAX_BLINKS),
            brightness,
            on,
            off,
            hold,
        }
    }

    /// Acknowledgement for a click gesture: one blink per click.
    #[must_use]
    pub fn clicks(count: u8, brightness: u8, hold: bool) -> Self {
        let count = count.clamp(1, MAX_BLINKS);
        let slot = usize::from(count.min(4)) - 1;
        let (on, off) = BLINK_TIMINGS_MS[slot];
        Self::new(
            count,
            brightness,
            Duration::from_millis(on),
            Duration::from_millis(off),
            hold,
        )
    }

    #[must_use]
    pub const fn count(&self) -> u8 {
        self.count
    }
}

/// Pattern requested for one LED.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LedCommand {
    Off,
    Constant { brightness: u8 },
    Blink(BlinkPattern),
    Pulse { brightness: u8, cycle: Duration },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum LedPhase {
    Idle,
    ConstantOn,
    BlinkOn(u8),
    BlinkOff(u8),
    Pulse,
}

/// Raised-cosine envelope `0.5 - 0.5 * cos(2π·phase)` for `phase` in `[0, 1)`.
///
/// Equal to `sin²(π·phase)`; the sine uses Bhaskara's rational approximation
/// (error below 0.2 %) so the crate needs no float library.
#[must_use]
pub fn raised_cosine(phase: f32) -> f32 {
    let p = phase - phase.floor();
    let x = p * (1.0 - p);
    let sine = 16.0 * x / (5.0 - 4.0 * x);
    (sine * sine).clamp(0.0, 1.0)
}

/// Independent pattern machine for a single LED.
#[derive(Copy, Clone, Debug)]
pub struct LedFeedback<I> {
    phase: LedPhase,
    command: LedCommand,
    pending: Option<LedCommand>,
    since: Option<I>,
    output: u8,
}

impl<I: Timestamp> LedFeedback<I> {
    pub const fn new() -> Self {
        Self {
            phase: LedPhase::Idle,
            command: LedCommand::Off,
            pending: None,
            since: None,
            output: 0,
        }
    }

    /// Queues `command`; it replaces the running pattern on the next poll.
    pub fn command(&mut self, command: LedCommand) {
        self.pending = Some(command);
    }

    /// Current brightness driven on the pin.
    pub const fn output(&self) -> u8 {
        self.output
    }

    /// Returns `true` when no pattern runs and nothing is pending.
    pub const fn is_idle(&self) -> bool {
        matches!(self.phase, LedPhase::Idle) && self.pending.is_none()
    }

    /// Returns `true` while a blink sequence is still counting.
    pub const fn is_blinking(&self) -> bool {
        matches!(self.phase, LedPhase::BlinkOn(_) | LedPhase::BlinkOff(_))
    }

    /// Advances the pattern; returns the new brightness when it changed.
    pub fn poll(&mut self, now: I) -> Option<u8> {
        if let Some(command) = self.pending.take() {
            self.apply(command, now);
        }

        let since = self.since.unwrap_or(now);
        let elapsed = now.saturating_duration_since(since);
        let target = match (self.phase, self.command) {
            (LedPhase::Idle, _) => 0,
            (LedPhase::ConstantOn, LedCommand::Constant { brightness }) => brightness,
            (LedPhase::BlinkOn(n), LedCommand::Blink(pattern)) => {
                if elapsed >= pattern.on {
                    self.since = Some(now);
                    if n + 1 >= pattern.count && pattern.hold {
                        self.phase = LedPhase::ConstantOn;
                        self.command = LedCommand::Constant {
                            brightness: pattern.brightness,
                        };
                        pattern.brightness
                    } else {
                        self.phase = LedPhase::BlinkOff(n);
                        0
                    }
                } else {
                    pattern.brightness
                }
            }
            (LedPhase::BlinkOff(n), LedCommand::Blink(pattern)) => {
                if elapsed >= pattern.off {
                    if n + 1 >= pattern.count {
                        self.phase = LedPhase::Idle;
                        self.since = None;
                        0
                    } else {
                        self.phase = LedPhase::BlinkOn(n + 1);
                        self.since = Some(now);
                        pattern.brightness
                    }
                } else {
                    0
                }
            }
            (LedPhase::Pulse, LedCommand::Pulse { brightness, cycle }) => {
                pulse_level(brightness, cycle, elapsed)
            }
            _ => {
                self.phase = LedPhase::Idle;
                0
            }
        };

        if target == self.output {
            None
        } else {
            self.output = target;
            Some(target)
        }
    }

    fn apply(&mut self, command: LedCommand, now: I) {
        self.command = command;
        self.since = Some(now);
        self.phase = match command {
            LedCommand::Off => LedPhase::Idle,
            LedCommand::Constant { .. } => LedPhase::ConstantOn,
            LedCommand::Blink(_) => LedPhase::BlinkOn(0),
            LedCommand::Pulse { cycle, .. } if cycle.is_zero() => LedPhase::Idle,
            LedCommand::Pulse { .. } => LedPhase::Pulse,
        };
    }
}

impl<I: Timestamp> Default for LedFeedback<I> {
    fn default() -> Self {
        Self::new()
    }
}

fn pulse_level(brightness: u8, cycle: Duration, elapsed: Duration) -> u8 {
    let cycle_us = cycle.as_micros().max(1);
    let into = elapsed.as_micros() % cycle_us;
    #[allow(clippy::cast_precision_loss)]
    let phase = into as f32 / cycle_us as f32;
    let level = f32::from(brightness) * raised_cosine(phase) + 0.5;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let level = level.clamp(0.0, 255.0) as u8;
    level
}

/// Sink for LED brightness values.
pub trait LedDriver {
    fn set_led(&mut self, id: ButtonId, brightness: u8);
}

/// LED access used by the orchestrator.
pub trait LedPort {
    /// Replaces the pattern on `id`.
    fn command(&mut self, id: ButtonId, command: LedCommand);

    /// Lets running blinks finish, then switches everything off.
    fn stop(&mut self);

    /// Returns `true` once a requested stop has completed, or nothing is running.
    fn is_idle(&self) -> bool;
}

/// One [`LedFeedback`] per button LED plus the stop lifecycle.
#[derive(Clone, Debug)]
pub struct LedBank<I, const N: usize = NUM_BUTTONS> {
    leds: [LedFeedback<I>; N],
    stopping: bool,
}

impl<I: Timestamp, const N: usize> LedBank<I, N> {
    pub const fn new() -> Self {
        Self {
            leds: [LedFeedback::new(); N],
            stopping: false,
        }
    }

    /// Advances every LED and forwards brightness changes to `driver`.
    pub fn poll<D: LedDriver>(&mut self, now: I, driver: &mut D) {
        if self.stopping && !self.leds.iter().any(LedFeedback::is_blinking) {
            for led in &mut self.leds {
                led.command(LedCommand::Off);
            }
        }
        for (index, led) in self.leds.iter_mut().enumerate() {
            if let (Some(level), Some(id)) = (led.poll(now), ButtonId::from_index(index)) {
                driver.set_led(id, level);
            }
        }
    }

    pub fn led(&self, id: ButtonId) -> Option<&LedFeedback<I>> {
        self.leds.get(id.index())
    }
}

impl<I: Timestamp, const N: usize> Default for LedBank<I, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Timestamp, const N: usize> LedPort for LedBank<I, N> {
    fn command(&mut self, id: ButtonId, command: LedCommand) {
        if let Some(led) = self.leds.get_mut(id.index()) {
            self.stopping = false;
            led.command(command);
        }
    }

    fn stop(&mut self) {
        self.stopping = true;
    }

    fn is_idle(&self) -> bool {
        if self.stopping {
            self.leds
                .iter()
                .all(|led| led.is_idle() && led.output() == 0)
        } else {
            !self.leds.iter().any(LedFeedback::is_blinking)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::mock::MockInstant;

    struct Recorder {
        writes: heapless::Vec<(u8, u8), 64>,
    }

    impl LedDriver for Recorder {
        fn set_led(&mut self, id: ButtonId, brightness: u8) {
            let _ = self.writes.push((id.get(), brightness));
        }
    }

    fn ms(value: u64) -> MockInstant {
        MockInstant::from_millis(value)
    }

    #[test]
    fn raised_cosine_hits_reference_points() {
        assert!(raised_cosine(0.0) < 0.001);
        assert!((raised_cosine(0.5) - 1.0).abs() < 0.001);
        assert!((raised_cosine(0.25) - 0.5).abs() < 0.01);
        assert!((raised_cosine(0.75) - 0.5).abs() < 0.01);
    }

    #[test]
    fn blink_count_is_clamped() {
        assert_eq!(BlinkPattern::clicks(0, 100, false).count(), 1);
        assert_eq!(BlinkPattern::clicks(9, 100, false).count(), MAX_BLINKS);
        let double = BlinkPattern::clicks(2, 100, false);
        assert_eq!(double.on, Duration::from_millis(100));
        assert_eq!(double.off, Duration::from_millis(300));
    }

    #[test]
    fn double_blink_sequence() {
        let mut led: LedFeedback<MockInstant> = LedFeedback::new();
        led.command(LedCommand::Blink(BlinkPattern::clicks(2, 200, false)));

        assert_eq!(led.poll(ms(0)), Some(200));
        assert_eq!(led.poll(ms(100)), Some(0));
        assert_eq!(led.poll(ms(400)), Some(200));
        assert_eq!(led.poll(ms(500)), Some(0));
        assert_eq!(led.poll(ms(800)), None);
        assert!(led.is_idle());
    }

    #[test]
    fn hold_keeps_last_blink_lit() {
        let mut led: LedFeedback<MockInstant> = LedFeedback::new();
        led.command(LedCommand::Blink(BlinkPattern::clicks(1, 90, true)));
        assert_eq!(led.poll(ms(0)), Some(90));
        assert_eq!(led.poll(ms(400)), None);
        assert_eq!(led.poll(ms(5_000)), None);
        assert_eq!(led.output(), 90);
    }

    #[test]
    fn new_command_overrides_running_pattern() {
        let mut led: LedFeedback<MockInstant> = LedFeedback::new();
        led.command(LedCommand::Blink(BlinkPattern::clicks(4, 200, false)));
        led.poll(ms(0));
        led.command(LedCommand::Constant { brightness: 30 });
        assert_eq!(led.poll(ms(10)), Some(30));
        assert_eq!(led.poll(ms(2_000)), None);
    }

    #[test]
    fn pulse_peaks_mid_cycle() {
        let mut led: LedFeedback<MockInstant> = LedFeedback::new();
        led.command(LedCommand::Pulse {
            brightness: 200,
            cycle: Duration::from_millis(1_000),
        });
        led.poll(ms(0));
        led.poll(ms(500));
        assert!(led.output() >= 198);
        led.poll(ms(1_000));
        assert!(led.output() <= 2);
    }

    #[test]
    fn bank_stop_waits_for_blink_then_goes_dark() {
        let mut bank: LedBank<MockInstant> = LedBank::new();
        let mut driver = Recorder {
            writes: heapless::Vec::new(),
        };
        let id = ButtonId::new(2).unwrap();
        bank.command(id, LedCommand::Blink(BlinkPattern::clicks(1, 50, true)));
        bank.poll(ms(0), &mut driver);
        bank.stop();
        assert!(!bank.is_idle());

        bank.poll(ms(100), &mut driver);
        assert!(!bank.is_idle());
        bank.poll(ms(400), &mut driver);
        bank.poll(ms(410), &mut driver);
        assert!(bank.is_idle());
        assert_eq!(driver.writes.last(), Some(&(2, 0)));
    }
}
