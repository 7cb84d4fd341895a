use defmt::info;
use embassy_time::{Duration, Timer};

use super::{BROKER, CONNECTIVITY, DeviceConnectivity, STATUS};
use crate::shared::ChannelConsumer;
use crate::time::FirmwareInstant;

const PERIOD: Duration = Duration::from_millis(10);

/// Owns the connectivity machine and mirrors it into the shared handle.
#[embassy_executor::task]
pub async fn run(mut manager: DeviceConnectivity, mut queue: ChannelConsumer<'static>) -> ! {
    let mut dropped = 0;
    loop {
        let changed = CONNECTIVITY.service(&mut manager, FirmwareInstant::now(), &mut queue);
        STATUS.record_link(manager.phase().link_state(), &manager.counters());
        if let Some(state) = changed {
            info!(
                "link: {} ({})",
                defmt::Display2Format(&state),
                defmt::Display2Format(&STATUS.snapshot())
            );
        }

        let inbound_drops = BROKER.dropped_inbound();
        if inbound_drops != dropped {
            info!("mqtt: {=u32} inbound messages dropped", inbound_drops - dropped);
            dropped = inbound_drops;
        }

        Timer::after(PERIOD).await;
    }
}
