use button_core::orchestrator::PowerControl;
use defmt::info;
use embassy_time::{Duration, Timer};

use super::{DeviceApp, STATUS};
use crate::hw::board::BoardPower;
use crate::time::FirmwareInstant;

const PERIOD: Duration = Duration::from_millis(10);

/// Runs one wake of the device and hands the final transition to the RTC.
#[embassy_executor::task]
pub async fn run(mut app: DeviceApp, mut power: BoardPower) -> ! {
    if let Err(transition) = app.boot(FirmwareInstant::now()) {
        info!("boot: wake ends during boot");
        power.apply(transition);
    }
    info!("boot: {}", defmt::Display2Format(&STATUS.snapshot()));

    loop {
        if let Some(transition) = app.step(FirmwareInstant::now()) {
            info!("wake done: {}", defmt::Display2Format(&STATUS.snapshot()));
            power.apply(transition);
        }
        Timer::after(PERIOD).await;
    }
}
