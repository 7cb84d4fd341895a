#![allow(dead_code)]

use core::{ops::Add, time::Duration};
use std::collections::VecDeque;

use button_core::connectivity::{
    BrokerClient, BrokerError, ConnectivityManager, InboundMessage, LinkDriver, LinkParams,
    NetTimings,
};
use button_core::gesture::{ButtonId, Edges, GestureBank, GestureTimings};
use button_core::led::{LedBank, LedDriver};
use button_core::orchestrator::{
    Display, DisplayState, Hardware, Orchestrator, OrchestratorConfig, Platform, PowerTransition,
    WakeReason,
};
use button_core::power::HardwareRevision;
use button_core::publish::{LocalPublishQueue, PublishItem};
use button_core::state::{DeviceState, MemoryStorage, truncated};
use button_core::time::Timestamp;

pub const STEP_MS: u64 = 10;
pub const SW_VERSION: &str = "1.4.0";

pub const PARAMS: LinkParams = LinkParams {
    bssid: [0x02, 0x11, 0x22, 0x33, 0x44, 0x55],
    channel: 11,
};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct SimInstant(u64);

impl SimInstant {
    pub const fn from_millis(value: u64) -> Self {
        Self(value * 1_000)
    }

    pub const fn as_millis(self) -> u64 {
        self.0 / 1_000
    }
}

impl Add<Duration> for SimInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        let micros = u64::try_from(rhs.as_micros()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(micros))
    }
}

impl Timestamp for SimInstant {
    fn saturating_duration_since(&self, earlier: Self) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

pub struct SimHardware {
    pub revision: HardwareRevision,
    pub wake: WakeReason,
    pub battery_volts: f32,
    pub dc_connected: bool,
    pub battery_present: bool,
    pub charger_standby: bool,
    pub charger_enabled: bool,
    pub free_memory: u32,
}

impl Default for SimHardware {
    fn default() -> Self {
        Self {
            revision: HardwareRevision::Rev2_2,
            wake: WakeReason::Timer,
            battery_volts: 3.9,
            dc_connected: false,
            battery_present: true,
            charger_standby: false,
            charger_enabled: false,
            free_memory: 120_000,
        }
    }
}

impl Hardware for SimHardware {
    fn revision(&self) -> HardwareRevision {
        self.revision
    }

    fn wake_reason(&self) -> WakeReason {
        self.wake
    }

    fn button_pressed(&mut self, _id: ButtonId) -> bool {
        false
    }

    fn read_battery_voltage(&mut self) -> f32 {
        self.battery_volts
    }

    fn is_dc_connected(&mut self) -> bool {
        self.dc_connected
    }

    fn is_battery_present(&mut self) -> bool {
        self.battery_present
    }

    fn is_charger_in_standby(&mut self) -> bool {
        self.charger_standby
    }

    fn enable_charger(&mut self, enable: bool) {
        self.charger_enabled = enable;
    }

    fn read_temp_humidity(&mut self) -> (f32, f32) {
        (21.5, 40.25)
    }

    fn free_memory(&self) -> u32 {
        self.free_memory
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Page {
    Main,
    Info,
    Welcome,
    Message(String),
    Error(String),
}

#[derive(Default)]
pub struct SimDisplay {
    pub pages: Vec<Page>,
    pub ended: u32,
}

impl SimDisplay {
    pub fn shows_message(&self, needle: &str) -> bool {
        self.pages
            .iter()
            .any(|page| {
                matches!(page, Page::Message(text) | Page::Error(text) if text.contains(needle))
            })
    }
}

impl Display for SimDisplay {
    fn disp_main(&mut self) {
        self.pages.push(Page::Main);
    }

    fn disp_info(&mut self) {
        self.pages.push(Page::Info);
    }

    fn disp_welcome(&mut self) {
        self.pages.push(Page::Welcome);
    }

    fn disp_message(&mut self, text: &str, _duration: Option<Duration>) {
        self.pages.push(Page::Message(text.to_owned()));
    }

    fn disp_error(&mut self, text: &str, _duration: Option<Duration>) {
        self.pages.push(Page::Error(text.to_owned()));
    }

    fn end(&mut self) {
        self.ended += 1;
    }

    fn state(&self) -> DisplayState {
        DisplayState::Idle
    }
}

pub struct SimLink {
    pub accept: bool,
    pub up: bool,
    pub begins: Vec<Option<LinkParams>>,
    pub erased: bool,
}

impl Default for SimLink {
    fn default() -> Self {
        Self {
            accept: true,
            up: false,
            begins: Vec::new(),
            erased: false,
        }
    }
}

impl LinkDriver for SimLink {
    fn begin(&mut self, params: Option<&LinkParams>) {
        self.begins.push(params.copied());
        self.up = self.accept;
    }

    fn is_up(&mut self) -> bool {
        self.up
    }

    fn current_params(&mut self) -> Option<LinkParams> {
        self.up.then_some(PARAMS)
    }

    fn disconnect(&mut self, erase: bool) {
        self.up = false;
        self.erased |= erase;
    }
}

#[derive(Default)]
pub struct SimBroker {
    pub connected: bool,
    pub published: Vec<PublishItem>,
    pub subscribed: Vec<String>,
    pub inbound: VecDeque<InboundMessage>,
}

impl SimBroker {
    pub fn payloads_on(&self, topic: &str) -> Vec<String> {
        self.published
            .iter()
            .filter(|item| item.topic.as_str() == topic)
            .map(|item| String::from_utf8_lossy(&item.payload).into_owned())
            .collect()
    }

    pub fn deliver(&mut self, topic: &str, payload: &str) {
        let mut message = InboundMessage {
            topic: truncated(topic),
            payload: heapless::Vec::new(),
        };
        message
            .payload
            .extend_from_slice(payload.as_bytes())
            .expect("payload fits");
        self.inbound.push_back(message);
    }
}

impl BrokerClient for SimBroker {
    fn connect(&mut self) {
        self.connected = true;
    }

    fn is_connected(&mut self) -> bool {
        self.connected
    }

    fn publish(&mut self, item: &PublishItem) -> Result<(), BrokerError> {
        if !self.connected {
            return Err(BrokerError::NotConnected);
        }
        self.published.push(item.clone());
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.subscribed.push(topic.to_owned());
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn poll_inbound(&mut self) -> Option<InboundMessage> {
        if self.connected {
            self.inbound.pop_front()
        } else {
            None
        }
    }
}

#[derive(Default)]
pub struct NullLeds;

impl LedDriver for NullLeds {
    fn set_led(&mut self, _id: ButtonId, _brightness: u8) {}
}

pub type SimNet = ConnectivityManager<SimInstant, SimLink, SimBroker>;

/// One simulated wake of the device.
pub struct SimPlatform {
    pub hardware: SimHardware,
    pub display: SimDisplay,
    pub storage: MemoryStorage,
    pub gestures: GestureBank<SimInstant>,
    pub leds: LedBank<SimInstant>,
    pub net: SimNet,
    pub queue: LocalPublishQueue,
    /// Pin level per button index, driven by the scenario.
    pub levels: [bool; 6],
}

impl SimPlatform {
    pub fn new(storage: MemoryStorage, wake: WakeReason) -> Self {
        Self {
            hardware: SimHardware {
                wake,
                ..SimHardware::default()
            },
            display: SimDisplay::default(),
            storage,
            gestures: GestureBank::new(GestureTimings::default()),
            leds: LedBank::new(),
            net: ConnectivityManager::new(
                SimLink::default(),
                SimBroker::default(),
                NetTimings::default(),
                None,
            ),
            queue: LocalPublishQueue::new(),
            levels: [false; 6],
        }
    }

    /// Changes a pin level and latches the matching edge for the next step.
    pub fn set_button(&mut self, id: ButtonId, now: SimInstant, pressed: bool) {
        self.levels[id.index()] = pressed;
        let edges = Edges {
            rising: pressed,
            falling: !pressed,
        };
        self.gestures.update(id, now, edges, pressed);
    }

    /// Polls every worker once in the order the firmware tasks run.
    pub fn step(
        &mut self,
        orchestrator: &mut Orchestrator<SimInstant>,
        now: SimInstant,
    ) -> Option<PowerTransition> {
        for id in ButtonId::all() {
            let pressed = self.levels[id.index()];
            self.gestures.update(id, now, Edges::default(), pressed);
        }
        self.leds.poll(now, &mut NullLeds);
        self.net.poll(now, &mut self.queue);
        orchestrator.poll(now, self)
    }
}

impl Platform for SimPlatform {
    type Instant = SimInstant;
    type Hardware = SimHardware;
    type Display = SimDisplay;
    type Storage = MemoryStorage;
    type Gestures = GestureBank<SimInstant>;
    type Leds = LedBank<SimInstant>;
    type Link = SimNet;
    type Queue = LocalPublishQueue;

    fn hardware(&mut self) -> &mut SimHardware {
        &mut self.hardware
    }

    fn display(&mut self) -> &mut SimDisplay {
        &mut self.display
    }

    fn storage(&mut self) -> &mut MemoryStorage {
        &mut self.storage
    }

    fn gestures(&mut self) -> &mut GestureBank<SimInstant> {
        &mut self.gestures
    }

    fn leds(&mut self) -> &mut LedBank<SimInstant> {
        &mut self.leds
    }

    fn link(&mut self) -> &mut SimNet {
        &mut self.net
    }

    fn queue(&mut self) -> &mut LocalPublishQueue {
        &mut self.queue
    }
}

pub fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        sw_version: SW_VERSION,
        ..OrchestratorConfig::default()
    }
}

/// A device that finished both setup stages.
pub fn provisioned_state() -> DeviceState {
    let mut state = DeviceState::default();
    state.persisted.wifi_done = true;
    state.persisted.setup_done = true;
    state.persisted.last_sw_version = truncated(SW_VERSION);
    state.prefs.device_name = truncated("hall");
    state.prefs.broker.base_topic = truncated("homebuttons");
    state.prefs.broker.server = truncated("10.0.0.2");
    state.prefs.broker.port = 1883;
    state
}

pub fn storage_with(state: &DeviceState) -> MemoryStorage {
    MemoryStorage::with_state(state).expect("state fits a record")
}

pub fn button(raw: u8) -> ButtonId {
    ButtonId::new(raw).expect("valid button")
}

/// Wake mask bit for `id` on the default revision.
pub fn wake_mask_for(id: ButtonId) -> WakeReason {
    let pin = HardwareRevision::Rev2_2.button_pins()[id.index()];
    WakeReason::ButtonMask(1 << pin)
}

/// Steps from `start` until a transition is returned or `limit_ms` passes.
pub fn run_until_transition(
    orchestrator: &mut Orchestrator<SimInstant>,
    platform: &mut SimPlatform,
    start: u64,
    limit_ms: u64,
) -> Option<(PowerTransition, u64)> {
    let mut now = start;
    while now <= start + limit_ms {
        if let Some(transition) = platform.step(orchestrator, SimInstant::from_millis(now)) {
            return Some((transition, now));
        }
        now += STEP_MS;
    }
    None
}

/// Steps over `[start, start + millis)` and returns the next timestamp.
pub fn run_for(
    orchestrator: &mut Orchestrator<SimInstant>,
    platform: &mut SimPlatform,
    start: u64,
    millis: u64,
) -> u64 {
    let mut now = start;
    while now < start + millis {
        assert_eq!(
            platform.step(orchestrator, SimInstant::from_millis(now)),
            None,
            "unexpected transition at {now} ms"
        );
        now += STEP_MS;
    }
    now
}

/// Boots one wake and returns the orchestrator.
pub fn boot(
    platform: &mut SimPlatform,
) -> (Orchestrator<SimInstant>, Result<(), PowerTransition>) {
    let mut orchestrator = Orchestrator::new(config());
    let result = orchestrator.boot(SimInstant::from_millis(0), platform);
    (orchestrator, result)
}
