//! Host stand-ins for the board, radio, broker and panel.
//!
//! Every observable side effect is queued as an [`Event`]; the session drains
//! them after each tick and prints them with the simulated time.

use core::fmt;
use core::ops::Add;
use core::time::Duration;
use std::collections::VecDeque;

use button_core::connectivity::{
    BrokerClient, BrokerError, ConnectivityManager, InboundMessage, LinkDriver, LinkParams,
    NetTimings,
};
use button_core::gesture::{ButtonId, Edges, GestureBank, GestureTimings, NUM_BUTTONS};
use button_core::led::{LedBank, LedDriver};
use button_core::orchestrator::{
    Display, DisplayState, Hardware, Orchestrator, Platform, PowerTransition, WakeReason,
};
use button_core::power::HardwareRevision;
use button_core::publish::{LocalPublishQueue, Payload, PublishItem};
use button_core::state::{MemoryStorage, truncated};
use button_core::time::Timestamp;

/// Access point the simulated radio always finds.
pub const ACCESS_POINT: LinkParams = LinkParams {
    bssid: [0x02, 0x48, 0x42, 0x54, 0x4e, 0x53],
    channel: 6,
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

/// Something the device did that the transcript should show.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Page(String),
    DisplayEnd,
    Led { id: ButtonId, level: u8 },
    Charger(bool),
    LinkBegin(Option<LinkParams>),
    LinkDisconnect { erase: bool },
    BrokerConnect { accepted: bool },
    BrokerDisconnect,
    Published(PublishItem),
    Subscribed(String),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Page(page) => write!(f, "display: {page}"),
            Event::DisplayEnd => f.write_str("display: end"),
            Event::Led { id, level } => write!(f, "led {id}: {level}"),
            Event::Charger(on) => write!(f, "charger: {}", if *on { "on" } else { "off" }),
            Event::LinkBegin(Some(params)) => {
                write!(f, "wifi: quick connect channel {}", params.channel)
            }
            Event::LinkBegin(None) => f.write_str("wifi: scan and connect"),
            Event::LinkDisconnect { erase } => write!(f, "wifi: disconnect erase={erase}"),
            Event::BrokerConnect { accepted } => write!(f, "mqtt: connect accepted={accepted}"),
            Event::BrokerDisconnect => f.write_str("mqtt: disconnect"),
            Event::Published(item) => write!(
                f,
                "publish {}{} {:?}",
                item.topic,
                if item.retained { " (retained)" } else { "" },
                String::from_utf8_lossy(&item.payload)
            ),
            Event::Subscribed(topic) => write!(f, "subscribe {topic}"),
        }
    }
}

/// Power inputs and sensor values; the session keeps these across wakes.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BoardInputs {
    pub revision: HardwareRevision,
    pub battery_volts: f32,
    pub battery_present: bool,
    pub dc_connected: bool,
    pub charger_standby: bool,
    pub free_memory: u32,
    pub temperature: f32,
    pub humidity: f32,
}

impl Default for BoardInputs {
    fn default() -> Self {
        Self {
            revision: HardwareRevision::Rev2_2,
            battery_volts: 3.9,
            battery_present: true,
            dc_connected: false,
            charger_standby: false,
            free_memory: 120_000,
            temperature: 21.5,
            humidity: 40.25,
        }
    }
}

pub struct SimHardware {
    pub inputs: BoardInputs,
    pub wake: WakeReason,
    pub levels: [bool; NUM_BUTTONS],
    pub charger_enabled: bool,
    events: Vec<Event>,
}

impl SimHardware {
    pub fn new(inputs: BoardInputs, wake: WakeReason) -> Self {
        Self {
            inputs,
            wake,
            levels: [false; NUM_BUTTONS],
            charger_enabled: false,
            events: Vec::new(),
        }
    }
}

impl Hardware for SimHardware {
    fn revision(&self) -> HardwareRevision {
        self.inputs.revision
    }

    fn wake_reason(&self) -> WakeReason {
        self.wake
    }

    fn button_pressed(&mut self, id: ButtonId) -> bool {
        self.levels[id.index()]
    }

    fn read_battery_voltage(&mut self) -> f32 {
        if self.inputs.battery_present {
            self.inputs.battery_volts
        } else {
            0.0
        }
    }

    fn is_dc_connected(&mut self) -> bool {
        self.inputs.dc_connected
    }

    fn is_battery_present(&mut self) -> bool {
        self.inputs.battery_present
    }

    fn is_charger_in_standby(&mut self) -> bool {
        self.inputs.charger_standby
    }

    fn enable_charger(&mut self, enable: bool) {
        if self.charger_enabled != enable {
            self.charger_enabled = enable;
            self.events.push(Event::Charger(enable));
        }
    }

    fn read_temp_humidity(&mut self) -> (f32, f32) {
        (self.inputs.temperature, self.inputs.humidity)
    }

    fn free_memory(&self) -> u32 {
        self.inputs.free_memory
    }
}

/// Records page requests instead of drawing them.
#[derive(Default)]
pub struct SimDisplay {
    events: Vec<Event>,
}

impl SimDisplay {
    fn show(&mut self, page: String) {
        self.events.push(Event::Page(page));
    }
}

fn one_line(text: &str) -> String {
    text.replace('\n', " ")
}

impl Display for SimDisplay {
    fn disp_main(&mut self) {
        self.show("main".to_owned());
    }

    fn disp_info(&mut self) {
        self.show("info".to_owned());
    }

    fn disp_welcome(&mut self) {
        self.show("welcome".to_owned());
    }

    fn disp_message(&mut self, text: &str, duration: Option<Duration>) {
        let mut page = format!("message {:?}", one_line(text));
        if let Some(duration) = duration {
            page.push_str(&format!(" for {}ms", duration.as_millis()));
        }
        self.show(page);
    }

    fn disp_error(&mut self, text: &str, duration: Option<Duration>) {
        let mut page = format!("error {:?}", one_line(text));
        if let Some(duration) = duration {
            page.push_str(&format!(" for {}ms", duration.as_millis()));
        }
        self.show(page);
    }

    fn end(&mut self) {
        self.events.push(Event::DisplayEnd);
    }

    fn state(&self) -> DisplayState {
        DisplayState::Idle
    }
}

/// Reports brightness changes.
#[derive(Default)]
pub struct SimLeds {
    events: Vec<Event>,
}

impl LedDriver for SimLeds {
    fn set_led(&mut self, id: ButtonId, brightness: u8) {
        self.events.push(Event::Led {
            id,
            level: brightness,
        });
    }
}

/// Radio that joins instantly while the access point is reachable.
pub struct SimLink {
    pub reachable: bool,
    up: bool,
    events: Vec<Event>,
}

impl SimLink {
    pub const fn new(reachable: bool) -> Self {
        Self {
            reachable,
            up: false,
            events: Vec::new(),
        }
    }

    /// Makes the access point (un)reachable; an established link drops.
    pub fn set_reachable(&mut self, reachable: bool) {
        self.reachable = reachable;
        if !reachable {
            self.up = false;
        }
    }
}

impl LinkDriver for SimLink {
    fn begin(&mut self, params: Option<&LinkParams>) {
        self.events.push(Event::LinkBegin(params.copied()));
        self.up = self.reachable;
    }

    fn is_up(&mut self) -> bool {
        self.up
    }

    fn current_params(&mut self) -> Option<LinkParams> {
        self.up.then_some(ACCESS_POINT)
    }

    fn disconnect(&mut self, erase: bool) {
        self.up = false;
        self.events.push(Event::LinkDisconnect { erase });
    }
}

/// Broker that accepts sessions while reachable.
pub struct SimBroker {
    pub reachable: bool,
    connected: bool,
    inbound: VecDeque<InboundMessage>,
    events: Vec<Event>,
}

impl SimBroker {
    pub const fn new(reachable: bool) -> Self {
        Self {
            reachable,
            connected: false,
            inbound: VecDeque::new(),
            events: Vec::new(),
        }
    }

    pub fn set_reachable(&mut self, reachable: bool) {
        self.reachable = reachable;
        if !reachable {
            self.connected = false;
        }
    }

    /// Queues a message for the device.
    ///
    /// # Errors
    ///
    /// Returns the payload length when it does not fit a message.
    pub fn deliver(&mut self, topic: &str, payload: &str) -> Result<(), usize> {
        let payload = Payload::from_slice(payload.as_bytes()).map_err(|_| payload.len())?;
        self.inbound.push_back(InboundMessage {
            topic: truncated(topic),
            payload,
        });
        Ok(())
    }
}

impl BrokerClient for SimBroker {
    fn connect(&mut self) {
        self.connected = self.reachable;
        self.events.push(Event::BrokerConnect {
            accepted: self.connected,
        });
    }

    fn is_connected(&mut self) -> bool {
        self.connected
    }

    fn publish(&mut self, item: &PublishItem) -> Result<(), BrokerError> {
        if !self.connected {
            return Err(BrokerError::NotConnected);
        }
        self.events.push(Event::Published(item.clone()));
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        if !self.connected {
            return Err(BrokerError::NotConnected);
        }
        self.events.push(Event::Subscribed(topic.to_owned()));
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.events.push(Event::BrokerDisconnect);
        }
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

pub type SimNet = ConnectivityManager<SimInstant, SimLink, SimBroker>;

/// Collaborators for one wake.
pub struct SimPlatform {
    pub hardware: SimHardware,
    pub display: SimDisplay,
    pub storage: MemoryStorage,
    pub gestures: GestureBank<SimInstant>,
    pub leds: LedBank<SimInstant>,
    pub net: SimNet,
    pub queue: LocalPublishQueue,
    driver: SimLeds,
}

impl SimPlatform {
    pub fn new(
        storage: MemoryStorage,
        hardware: SimHardware,
        link: SimLink,
        broker: SimBroker,
        quick_cache: Option<LinkParams>,
    ) -> Self {
        Self {
            hardware,
            display: SimDisplay::default(),
            storage,
            gestures: GestureBank::new(GestureTimings::default()),
            leds: LedBank::new(),
            net: ConnectivityManager::new(link, broker, NetTimings::default(), quick_cache),
            queue: LocalPublishQueue::new(),
            driver: SimLeds::default(),
        }
    }

    /// Changes a pin level and latches the edge for the next tick.
    pub fn set_button(&mut self, id: ButtonId, now: SimInstant, pressed: bool) {
        self.hardware.levels[id.index()] = pressed;
        let edges = Edges {
            rising: pressed,
            falling: !pressed,
        };
        self.gestures.update(id, now, edges, pressed);
    }

    /// One pass over every worker in firmware task order.
    pub fn step(
        &mut self,
        orchestrator: &mut Orchestrator<SimInstant>,
        now: SimInstant,
    ) -> Option<PowerTransition> {
        for id in ButtonId::all() {
            let pressed = self.hardware.levels[id.index()];
            self.gestures.update(id, now, Edges::default(), pressed);
        }
        self.leds.poll(now, &mut self.driver);
        self.net.poll(now, &mut self.queue);
        orchestrator.poll(now, self)
    }

    /// Takes every event queued since the previous call.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        events.append(&mut self.hardware.events);
        events.append(&mut self.display.events);
        events.append(&mut self.driver.events);
        events.append(&mut self.net.link_mut().events);
        events.append(&mut self.net.broker_mut().events);
        events
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
