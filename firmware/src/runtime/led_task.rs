use embassy_time::{Duration, Timer};

use crate::hw::board::BoardLeds;
use crate::shared::SharedLeds;
use crate::time::FirmwareInstant;

const PERIOD: Duration = Duration::from_millis(20);

#[embassy_executor::task]
pub async fn run(leds: SharedLeds<'static>, mut driver: BoardLeds) -> ! {
    loop {
        leds.poll(FirmwareInstant::now(), &mut driver);
        Timer::after(PERIOD).await;
    }
}
