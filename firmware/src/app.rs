//! Binds the orchestrator to the firmware's shared cells.
//!
//! [`FirmwarePlatform`] hands the orchestrator lock-based views of the
//! gesture and LED banks, the connectivity handle and the publish channel.
//! [`App`] wraps one orchestrator run with telemetry draining and status
//! updates; the target app task only has to call [`App::boot`] once and
//! [`App::step`] on every tick.

use button_core::orchestrator::{
    Display, Hardware, Orchestrator, OrchestratorConfig, Platform, PowerTransition,
};
use button_core::state::Storage;

use crate::net::LinkHandle;
use crate::shared::{ChannelProducer, SharedGestures, SharedLeds};
use crate::status::StatusBoard;
use crate::telemetry::TelemetryDrain;
use crate::time::FirmwareInstant;

/// Collaborators for one wake of the device.
pub struct FirmwarePlatform<'a, H, D, S> {
    pub hardware: H,
    pub display: D,
    pub storage: S,
    gestures: SharedGestures<'a>,
    leds: SharedLeds<'a>,
    link: LinkHandle<'a>,
    queue: ChannelProducer<'a>,
}

impl<'a, H, D, S> FirmwarePlatform<'a, H, D, S> {
    pub const fn new(
        hardware: H,
        display: D,
        storage: S,
        gestures: SharedGestures<'a>,
        leds: SharedLeds<'a>,
        link: LinkHandle<'a>,
        queue: ChannelProducer<'a>,
    ) -> Self {
        Self {
            hardware,
            display,
            storage,
            gestures,
            leds,
            link,
            queue,
        }
    }
}

impl<'a, H, D, S> Platform for FirmwarePlatform<'a, H, D, S>
where
    H: Hardware,
    D: Display,
    S: Storage,
{
    type Instant = FirmwareInstant;
    type Hardware = H;
    type Display = D;
    type Storage = S;
    type Gestures = SharedGestures<'a>;
    type Leds = SharedLeds<'a>;
    type Link = LinkHandle<'a>;
    type Queue = ChannelProducer<'a>;

    fn hardware(&mut self) -> &mut H {
        &mut self.hardware
    }

    fn display(&mut self) -> &mut D {
        &mut self.display
    }

    fn storage(&mut self) -> &mut S {
        &mut self.storage
    }

    fn gestures(&mut self) -> &mut SharedGestures<'a> {
        &mut self.gestures
    }

    fn leds(&mut self) -> &mut SharedLeds<'a> {
        &mut self.leds
    }

    fn link(&mut self) -> &mut LinkHandle<'a> {
        &mut self.link
    }

    fn queue(&mut self) -> &mut ChannelProducer<'a> {
        &mut self.queue
    }
}

/// Orchestrator plus the bookkeeping the app task does around it.
pub struct App<'a, H, D, S> {
    orchestrator: Orchestrator<FirmwareInstant>,
    platform: FirmwarePlatform<'a, H, D, S>,
    drain: TelemetryDrain,
    status: &'a StatusBoard,
}

impl<'a, H, D, S> App<'a, H, D, S>
where
    H: Hardware,
    D: Display,
    S: Storage,
{
    pub fn new(
        config: OrchestratorConfig,
        platform: FirmwarePlatform<'a, H, D, S>,
        status: &'a StatusBoard,
    ) -> Self {
        Self {
            orchestrator: Orchestrator::new(config),
            platform,
            drain: TelemetryDrain::new(),
            status,
        }
    }

    /// Runs boot handling.
    ///
    /// # Errors
    ///
    /// Returns the transition to apply when the wake ends during boot.
    pub fn boot(&mut self, now: FirmwareInstant) -> Result<(), PowerTransition> {
        self.status
            .record_battery(self.platform.hardware.read_battery_voltage());
        let booted = self.orchestrator.boot(now, &mut self.platform);
        self.observe();
        booted
    }

    /// One orchestrator tick; returns the final transition once the run ends.
    pub fn step(&mut self, now: FirmwareInstant) -> Option<PowerTransition> {
        let transition = self.orchestrator.poll(now, &mut self.platform);
        self.observe();
        transition
    }

    pub fn orchestrator(&self) -> &Orchestrator<FirmwareInstant> {
        &self.orchestrator
    }

    pub fn platform_mut(&mut self) -> &mut FirmwarePlatform<'a, H, D, S> {
        &mut self.platform
    }

    fn observe(&mut self) {
        self.drain.drain(self.orchestrator.telemetry());
        self.status.record_run_state(self.orchestrator.run_state());
        self.status
            .record_free_heap(self.platform.hardware.free_memory());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use core::task::Poll;
    use core::time::Duration;

    use button_core::connectivity::{ConnectivityManager, LinkParams, NetTimings};
    use button_core::gesture::{ButtonId, GestureTimings};
    use button_core::orchestrator::{RunState, WakeReason};
    use button_core::power::HardwareRevision;
    use button_core::state::{DeviceState, MemoryStorage, truncated};

    use crate::display::LogDisplay;
    use crate::mailbox::{BrokerCommand, BrokerMailbox, WifiCommand, WifiMailbox};
    use crate::net::ConnectivityHandle;
    use crate::shared::{ChannelConsumer, PublishChannel, gesture_cell, led_cell};
    use embassy_futures::poll_once;

    const VERSION: &str = "2.0.0";
    const PARAMS: LinkParams = LinkParams {
        bssid: [0x02, 0, 0, 0, 0, 0x07],
        channel: 6,
    };

    struct Board {
        wake: WakeReason,
        volts: f32,
    }

    impl Hardware for Board {
        fn revision(&self) -> HardwareRevision {
            HardwareRevision::Rev2_2
        }

        fn wake_reason(&self) -> WakeReason {
            self.wake
        }

        fn button_pressed(&mut self, _id: ButtonId) -> bool {
            false
        }

        fn read_battery_voltage(&mut self) -> f32 {
            self.volts
        }

        fn is_dc_connected(&mut self) -> bool {
            false
        }

        fn is_battery_present(&mut self) -> bool {
            true
        }

        fn is_charger_in_standby(&mut self) -> bool {
            false
        }

        fn enable_charger(&mut self, _enable: bool) {}

        fn read_temp_humidity(&mut self) -> (f32, f32) {
            (22.0, 45.0)
        }

        fn free_memory(&self) -> u32 {
            90_000
        }
    }

    fn provisioned() -> MemoryStorage {
        let mut state = DeviceState::default();
        state.persisted.wifi_done = true;
        state.persisted.setup_done = true;
        state.persisted.last_sw_version = truncated(VERSION);
        state.prefs.device_name = truncated("desk");
        state.prefs.broker.base_topic = truncated("hb");
        MemoryStorage::with_state(&state).expect("fits")
    }

    /// Plays the radio and MQTT tasks: every request succeeds at once.
    fn serve_workers(wifi: &WifiMailbox, broker: &BrokerMailbox, published: &mut usize) {
        match wifi.try_command() {
            Some(WifiCommand::Begin(_)) => wifi.report_up(Some(PARAMS)),
            Some(WifiCommand::Disconnect { .. }) => wifi.report_down(),
            None => {}
        }
        while let Some(command) = broker_try(broker) {
            match command {
                BrokerCommand::Connect => broker.set_connected(true),
                BrokerCommand::Disconnect => broker.set_connected(false),
                BrokerCommand::Publish(_) => *published += 1,
                BrokerCommand::Subscribe(_) => {}
            }
        }
    }

    fn broker_try(broker: &BrokerMailbox) -> Option<BrokerCommand> {
        match poll_once(broker.next_command()) {
            Poll::Ready(command) => Some(command),
            Poll::Pending => None,
        }
    }

    #[test]
    fn timer_wake_reports_sensors_then_sleeps() {
        let gestures = gesture_cell(GestureTimings::default());
        let leds = led_cell();
        let publish = PublishChannel::new();
        let handle = ConnectivityHandle::new();
        let status = StatusBoard::new();
        let wifi = WifiMailbox::new();
        let broker = BrokerMailbox::new();

        let platform = FirmwarePlatform::new(
            Board {
                wake: WakeReason::Timer,
                volts: 3.9,
            },
            LogDisplay::new(),
            provisioned(),
            SharedGestures::new(&gestures),
            SharedLeds::new(&leds),
            handle.link(),
            ChannelProducer::new(&publish),
        );
        let config = OrchestratorConfig {
            sw_version: VERSION,
            ..OrchestratorConfig::default()
        };
        let mut app = App::new(config, platform, &status);
        let mut manager = ConnectivityManager::new(
            wifi.link(),
            broker.client(),
            NetTimings::default(),
            None,
        );
        let mut consumer = ChannelConsumer::new(&publish);
        let mut published = 0;

        assert_eq!(app.boot(FirmwareInstant::from_millis(0)), Ok(()));
        assert_eq!(status.snapshot().run_state, Some(RunState::AwaitNetConnect));
        assert_eq!(status.snapshot().battery_mv, Some(3_900));

        let mut transition = None;
        for ms in (10..15_000).step_by(10) {
            let now = FirmwareInstant::from_millis(ms);
            handle.service(&mut manager, now, &mut consumer);
            serve_workers(&wifi, &broker, &mut published);
            if let Some(done) = app.step(now) {
                transition = Some(done);
                break;
            }
        }

        assert_eq!(
            transition,
            Some(PowerTransition::Sleep {
                wake_after: Some(Duration::from_secs(600)),
                button_mask: HardwareRevision::Rev2_2.wake_mask(),
            })
        );
        assert!(published >= 4, "published {published}");
        assert_eq!(status.snapshot().min_free_heap, Some(90_000));

        let saved = app
            .platform_mut()
            .storage
            .load_all()
            .expect("record saved");
        assert_eq!(saved.persisted.quick_connect, Some(PARAMS));
    }

    #[test]
    fn blank_device_shows_welcome_and_sleeps_at_boot() {
        let gestures = gesture_cell(GestureTimings::default());
        let leds = led_cell();
        let publish = PublishChannel::new();
        let handle = ConnectivityHandle::new();
        let status = StatusBoard::new();

        let platform = FirmwarePlatform::new(
            Board {
                wake: WakeReason::PowerOn,
                volts: 3.9,
            },
            LogDisplay::new(),
            MemoryStorage::new(),
            SharedGestures::new(&gestures),
            SharedLeds::new(&leds),
            handle.link(),
            ChannelProducer::new(&publish),
        );
        let mut app = App::new(OrchestratorConfig::default(), platform, &status);

        let booted = app.boot(FirmwareInstant::from_millis(0));
        assert!(matches!(booted, Err(PowerTransition::Sleep { .. })));
        assert_eq!(
            app.platform_mut().display.page(),
            crate::display::Page::Welcome
        );
        assert!(app.orchestrator().telemetry().len() >= 2);
    }
}
