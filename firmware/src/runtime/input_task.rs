use button_core::gesture::ButtonId;
use embassy_time::{Duration, Timer};
use esp_hal::gpio::Input;

use super::EDGES;
use crate::shared::SharedGestures;
use crate::time::FirmwareInstant;

const PERIOD: Duration = Duration::from_millis(20);

/// Latches every level change on one button pin.
#[embassy_executor::task(pool_size = 6)]
pub async fn edge_waiter(id: ButtonId, pin: &'static mut Input<'static>) -> ! {
    loop {
        pin.wait_for_any_edge().await;
        EDGES.record(id, pin.is_high());
    }
}

/// Feeds latched edges and levels to the gesture classifiers.
#[embassy_executor::task]
pub async fn gesture_task(gestures: SharedGestures<'static>) -> ! {
    loop {
        EDGES.feed(gestures, FirmwareInstant::now(), |id| EDGES.is_pressed(id));
        Timer::after(PERIOD).await;
    }
}
