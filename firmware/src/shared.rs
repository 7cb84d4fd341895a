//! Cells shared between the firmware tasks.
//!
//! The gesture and LED banks are polled by their own tasks and driven by the
//! orchestrator, so both sit behind a blocking mutex and are handed out as
//! cheap port adapters. The publish queue is an embassy channel wrapped in the
//! core queue traits.

use core::cell::RefCell;

use button_core::gesture::{
    ButtonId, Edges, GestureBank, GesturePort, GestureSnapshot, GestureTimings,
};
use button_core::led::{LedBank, LedCommand, LedDriver, LedPort};
use button_core::publish::{
    PUBLISH_QUEUE_DEPTH, PublishDequeueError, PublishEnqueueError, PublishItem,
    PublishQueueConsumer, PublishQueueProducer,
};
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::{Channel, TrySendError};

#[cfg(not(target_os = "none"))]
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
#[cfg(target_os = "none")]
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

use crate::time::FirmwareInstant;

/// Raw mutex backing every shared cell; tasks run on one executor but the
/// radio driver preempts, so the target needs a critical section.
#[cfg(target_os = "none")]
pub type SharedMutex = CriticalSectionRawMutex;
#[cfg(not(target_os = "none"))]
pub type SharedMutex = NoopRawMutex;

pub type GestureCell = Mutex<SharedMutex, RefCell<GestureBank<FirmwareInstant>>>;
pub type LedCell = Mutex<SharedMutex, RefCell<LedBank<FirmwareInstant>>>;
pub type PublishChannel = Channel<SharedMutex, PublishItem, PUBLISH_QUEUE_DEPTH>;

pub const fn gesture_cell(timings: GestureTimings) -> GestureCell {
    Mutex::new(RefCell::new(GestureBank::new(timings)))
}

pub const fn led_cell() -> LedCell {
    Mutex::new(RefCell::new(LedBank::new()))
}

/// Orchestrator-side view of the shared gesture bank.
#[derive(Copy, Clone)]
pub struct SharedGestures<'a> {
    cell: &'a GestureCell,
}

impl<'a> SharedGestures<'a> {
    pub const fn new(cell: &'a GestureCell) -> Self {
        Self { cell }
    }

    /// Feeds one button's latched edges and level into its classifier.
    pub fn update(&self, id: ButtonId, now: FirmwareInstant, edges: Edges, pressed: bool) {
        self.cell
            .lock(|bank| bank.borrow_mut().update(id, now, edges, pressed));
    }
}

impl GesturePort for SharedGestures<'_> {
    type Instant = FirmwareInstant;

    fn snapshot(&self, id: ButtonId) -> GestureSnapshot {
        self.cell.lock(|bank| bank.borrow().snapshot(id))
    }

    fn active(&self) -> Option<ButtonId> {
        self.cell.lock(|bank| bank.borrow().active())
    }

    fn clear_all(&mut self) {
        self.cell.lock(|bank| bank.borrow_mut().clear_all());
    }

    fn init_press(&mut self, id: ButtonId, now: FirmwareInstant) {
        self.cell.lock(|bank| bank.borrow_mut().init_press(id, now));
    }

    fn start(&mut self) {
        self.cell.lock(|bank| bank.borrow_mut().start());
    }

    fn stop(&mut self) {
        self.cell.lock(|bank| bank.borrow_mut().stop());
    }
}

/// Orchestrator-side view of the shared LED bank.
#[derive(Copy, Clone)]
pub struct SharedLeds<'a> {
    cell: &'a LedCell,
}

impl<'a> SharedLeds<'a> {
    pub const fn new(cell: &'a LedCell) -> Self {
        Self { cell }
    }

    /// Advances every LED pattern and writes changed levels to `driver`.
    pub fn poll<D: LedDriver>(&self, now: FirmwareInstant, driver: &mut D) {
        self.cell.lock(|bank| bank.borrow_mut().poll(now, driver));
    }
}

impl LedPort for SharedLeds<'_> {
    fn command(&mut self, id: ButtonId, command: LedCommand) {
        self.cell.lock(|bank| bank.borrow_mut().command(id, command));
    }

    fn stop(&mut self) {
        self.cell.lock(|bank| bank.borrow_mut().stop());
    }

    fn is_idle(&self) -> bool {
        self.cell.lock(|bank| bank.borrow().is_idle())
    }
}

/// Producer half of the publish channel.
#[derive(Copy, Clone)]
pub struct ChannelProducer<'a> {
    channel: &'a PublishChannel,
}

impl<'a> ChannelProducer<'a> {
    pub const fn new(channel: &'a PublishChannel) -> Self {
        Self { channel }
    }
}

impl PublishQueueProducer for ChannelProducer<'_> {
    type Error = ();

    fn try_enqueue(&mut self, item: PublishItem) -> Result<(), PublishEnqueueError> {
        self.channel
            .try_send(item)
            .map_err(|TrySendError::Full(_)| PublishEnqueueError::QueueFull)
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.channel.capacity())
    }

    fn len(&self) -> Option<usize> {
        Some(self.channel.len())
    }
}

/// Consumer half of the publish channel, owned by the network task.
pub struct ChannelConsumer<'a> {
    channel: &'a PublishChannel,
}

impl<'a> ChannelConsumer<'a> {
    pub const fn new(channel: &'a PublishChannel) -> Self {
        Self { channel }
    }
}

impl PublishQueueConsumer for ChannelConsumer<'_> {
    type Error = ();

    fn try_dequeue(&mut self) -> Result<Option<PublishItem>, PublishDequeueError> {
        Ok(self.channel.try_receive().ok())
    }

    fn is_drained(&self) -> bool {
        self.channel.is_empty()
    }

    fn clear(&mut self) {
        self.channel.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use button_core::gesture::Action;

    fn button(n: u8) -> ButtonId {
        ButtonId::new(n).expect("valid button")
    }

    fn item(topic: &str) -> PublishItem {
        PublishItem::text(topic, "PRESS", false).expect("item fits")
    }

    #[derive(Default)]
    struct Levels([u8; 6]);

    impl LedDriver for Levels {
        fn set_led(&mut self, id: ButtonId, brightness: u8) {
            self.0[id.index()] = brightness;
        }
    }

    #[test]
    fn gesture_port_sees_updates_from_the_polling_side() {
        let cell = gesture_cell(GestureTimings::default());
        let poller = SharedGestures::new(&cell);
        let mut port = SharedGestures::new(&cell);
        port.start();

        let id = button(3);
        poller.update(
            id,
            FirmwareInstant::from_millis(0),
            Edges {
                rising: true,
                falling: false,
            },
            true,
        );
        poller.update(id, FirmwareInstant::from_millis(60), Edges::default(), true);
        poller.update(
            id,
            FirmwareInstant::from_millis(100),
            Edges {
                rising: false,
                falling: true,
            },
            false,
        );
        for ms in (120..1_000).step_by(20) {
            poller.update(id, FirmwareInstant::from_millis(ms), Edges::default(), false);
        }

        let snapshot = port.snapshot(id);
        assert_eq!(snapshot.action, Action::Single);
        assert!(snapshot.finished);
        assert_eq!(port.active(), Some(id));

        port.clear_all();
        assert_eq!(port.active(), None);
    }

    #[test]
    fn led_port_commands_reach_the_driver_on_poll() {
        let cell = led_cell();
        let mut port = SharedLeds::new(&cell);
        let mut levels = Levels::default();

        port.command(button(2), LedCommand::Constant { brightness: 200 });
        SharedLeds::new(&cell).poll(FirmwareInstant::from_millis(0), &mut levels);
        assert_eq!(levels.0[1], 200);

        port.stop();
        SharedLeds::new(&cell).poll(FirmwareInstant::from_millis(20), &mut levels);
        SharedLeds::new(&cell).poll(FirmwareInstant::from_millis(40), &mut levels);
        assert_eq!(levels.0[1], 0);
        assert!(port.is_idle());
    }

    #[test]
    fn channel_queue_is_bounded_and_ordered() {
        let channel = PublishChannel::new();
        let mut producer = ChannelProducer::new(&channel);
        let mut consumer = ChannelConsumer::new(&channel);

        for n in 0..PUBLISH_QUEUE_DEPTH {
            let topic = match n {
                0 => "a",
                1 => "b",
                2 => "c",
                _ => "d",
            };
            assert_eq!(producer.try_enqueue(item(topic)), Ok(()));
        }
        assert_eq!(
            producer.try_enqueue(item("overflow")),
            Err(PublishEnqueueError::QueueFull)
        );
        assert_eq!(producer.len(), Some(PUBLISH_QUEUE_DEPTH));

        let first = consumer.try_dequeue().expect("infallible").expect("item");
        assert_eq!(first.topic.as_str(), "a");
        assert!(!consumer.is_drained());

        consumer.clear();
        assert!(consumer.is_drained());
        assert_eq!(consumer.try_dequeue(), Ok(None));
    }
}
