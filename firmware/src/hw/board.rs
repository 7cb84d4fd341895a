//! esp-hal bindings for the rev 2.2 board.
//!
//! Buttons are active high with pull-downs (GPIO5, 4, 6, 3, 21, 1). The
//! battery rail is divided into ADC2 on GPIO14, the charger standby line on
//! GPIO12 is active low, DC-in sense is GPIO7 and the charger enable is GPIO13.

use core::time::Duration;

use button_core::gesture::{ButtonId, NUM_BUTTONS};
use button_core::led::LedDriver;
use button_core::orchestrator::{Hardware, PowerControl, WakeReason};
use button_core::power::HardwareRevision;
use defmt::{info, warn};
use esp_hal::Blocking;
use esp_hal::analog::adc::{Adc, AdcPin};
use esp_hal::delay::Delay;
use esp_hal::gpio::{Input, Level, Output, RtcPin};
use esp_hal::i2c::master::I2c;
use esp_hal::peripherals::{ADC2, GPIO1, GPIO3, GPIO4, GPIO5, GPIO6, GPIO14, GPIO21};
use esp_hal::rtc_cntl::sleep::{Ext1WakeupSource, TimerWakeupSource, WakeSource, WakeupLevel};
use esp_hal::rtc_cntl::{Rtc, SleepSource, SocResetReason};
use heapless::Vec;

use super::{EdgeBank, REVISION, battery_volts, shtc3, wake_mask_from_levels};

pub type BatteryAdc = Adc<'static, ADC2<'static>, Blocking>;
pub type BatteryPin = AdcPin<GPIO14<'static>, ADC2<'static>>;

const ADC_ATTEMPTS: u8 = 8;

/// Maps the chip's reset and wake causes plus the sampled button levels onto
/// the core wake reason.
pub fn classify_wake(
    reset: Option<SocResetReason>,
    cause: SleepSource,
    pressed: [bool; NUM_BUTTONS],
) -> WakeReason {
    if reset != Some(SocResetReason::CoreDeepSleep) {
        return match reset {
            Some(SocResetReason::ChipPowerOn) => WakeReason::PowerOn,
            _ => WakeReason::Other,
        };
    }
    match cause {
        SleepSource::Timer => WakeReason::Timer,
        SleepSource::Ext1 | SleepSource::Gpio => {
            WakeReason::ButtonMask(wake_mask_from_levels(REVISION, pressed))
        }
        _ => WakeReason::Other,
    }
}

/// Sensors and board signals.
pub struct BoardHardware {
    wake: WakeReason,
    buttons: &'static EdgeBank,
    adc: BatteryAdc,
    vbat: BatteryPin,
    charger_standby: Input<'static>,
    dc_in: Input<'static>,
    charger_enable: Output<'static>,
    i2c: I2c<'static, Blocking>,
}

impl BoardHardware {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        wake: WakeReason,
        buttons: &'static EdgeBank,
        adc: BatteryAdc,
        vbat: BatteryPin,
        charger_standby: Input<'static>,
        dc_in: Input<'static>,
        charger_enable: Output<'static>,
        i2c: I2c<'static, Blocking>,
    ) -> Self {
        Self {
            wake,
            buttons,
            adc,
            vbat,
            charger_standby,
            dc_in,
            charger_enable,
            i2c,
        }
    }

    fn read_raw(&mut self) -> Option<u16> {
        // The oneshot read reports WouldBlock until the conversion lands.
        (0..ADC_ATTEMPTS).find_map(|_| self.adc.read_oneshot(&mut self.vbat).ok())
    }

    fn measure_shtc3(&mut self) -> Option<(f32, f32)> {
        let delay = Delay::new();
        self.i2c.write(shtc3::ADDRESS, &shtc3::WAKEUP).ok()?;
        delay.delay_micros(240);
        self.i2c.write(shtc3::ADDRESS, &shtc3::MEASURE).ok()?;
        delay.delay_millis(shtc3::MEASURE_MS);
        let mut frame = [0u8; 6];
        self.i2c.read(shtc3::ADDRESS, &mut frame).ok()?;
        let _ = self.i2c.write(shtc3::ADDRESS, &shtc3::SLEEP);
        shtc3::decode(frame)
    }
}

impl Hardware for BoardHardware {
    fn revision(&self) -> HardwareRevision {
        REVISION
    }

    fn wake_reason(&self) -> WakeReason {
        self.wake
    }

    fn button_pressed(&mut self, id: ButtonId) -> bool {
        self.buttons.is_pressed(id)
    }

    fn read_battery_voltage(&mut self) -> f32 {
        match self.read_raw() {
            Some(raw) => battery_volts(raw),
            None => {
                warn!("battery adc: conversion timed out");
                0.0
            }
        }
    }

    fn is_dc_connected(&mut self) -> bool {
        self.dc_in.is_high()
    }

    fn is_battery_present(&mut self) -> bool {
        let volts = self.read_battery_voltage();
        REVISION
            .thresholds()
            .present
            .is_none_or(|present| volts >= present)
    }

    fn is_charger_in_standby(&mut self) -> bool {
        self.charger_standby.is_low()
    }

    fn enable_charger(&mut self, enable: bool) {
        self.charger_enable.set_level(Level::from(enable));
    }

    fn read_temp_humidity(&mut self) -> (f32, f32) {
        self.measure_shtc3().unwrap_or_else(|| {
            warn!("shtc3: measurement failed");
            (0.0, 0.0)
        })
    }

    fn free_memory(&self) -> u32 {
        u32::try_from(esp_alloc::HEAP.free()).unwrap_or(u32::MAX)
    }
}

/// On/off LED outputs indexed by button.
pub struct BoardLeds {
    pins: [Output<'static>; NUM_BUTTONS],
}

impl BoardLeds {
    pub const fn new(pins: [Output<'static>; NUM_BUTTONS]) -> Self {
        Self { pins }
    }
}

impl LedDriver for BoardLeds {
    fn set_led(&mut self, id: ButtonId, brightness: u8) {
        self.pins[id.index()].set_level(Level::from(brightness > 0));
    }
}

/// Deep sleep and reset through the RTC controller.
pub struct BoardPower {
    rtc: Rtc<'static>,
}

impl BoardPower {
    pub const fn new(rtc: Rtc<'static>) -> Self {
        Self { rtc }
    }
}

impl PowerControl for BoardPower {
    fn enter_low_power_sleep(&mut self, wake_after: Option<Duration>, button_mask: u64) -> ! {
        info!(
            "sleep: timer={=?} mask={=u64:#x}",
            wake_after.map(|after| after.as_secs()),
            button_mask
        );

        // The button inputs are owned by the edge waiters, which never run
        // again once sleep is entered.
        let mut b1 = unsafe { GPIO5::steal() };
        let mut b2 = unsafe { GPIO4::steal() };
        let mut b3 = unsafe { GPIO6::steal() };
        let mut b4 = unsafe { GPIO3::steal() };
        let mut b5 = unsafe { GPIO21::steal() };
        let mut b6 = unsafe { GPIO1::steal() };
        let candidates: [(u8, &mut dyn RtcPin); NUM_BUTTONS] = [
            (5, &mut b1),
            (4, &mut b2),
            (6, &mut b3),
            (3, &mut b4),
            (21, &mut b5),
            (1, &mut b6),
        ];
        let mut wake_pins: Vec<&mut dyn RtcPin, NUM_BUTTONS> = Vec::new();
        for (gpio, pin) in candidates {
            if button_mask & (1 << gpio) != 0 {
                let _ = wake_pins.push(pin);
            }
        }

        let ext1 = Ext1WakeupSource::new(&mut wake_pins, WakeupLevel::High);
        let timer = wake_after.map(TimerWakeupSource::new);

        let mut sources: Vec<&dyn WakeSource, 2> = Vec::new();
        if button_mask != 0 {
            let _ = sources.push(&ext1);
        }
        if let Some(timer) = timer.as_ref() {
            let _ = sources.push(timer);
        }
        self.rtc.sleep_deep(&sources)
    }

    fn restart(&mut self) -> ! {
        info!("restart");
        esp_hal::system::software_reset()
    }
}
