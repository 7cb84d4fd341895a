use button_core::connectivity::{ConnectivityManager, NetTimings};
use button_core::gesture::{ButtonId, GestureTimings, NUM_BUTTONS};
use button_core::orchestrator::OrchestratorConfig;
use button_core::state::Storage;
use defmt::{info, warn};
use embassy_executor::Spawner;
use embassy_net::StackResources;
use embassy_time::Timer;
use esp_hal::analog::adc::{Adc, AdcConfig, Attenuation};
use esp_hal::clock::CpuClock;
use esp_hal::efuse::Efuse;
use esp_hal::gpio::{Input, InputConfig, Level, Output, OutputConfig, Pull};
use esp_hal::i2c::master::{Config as I2cConfig, I2c};
use esp_hal::rng::Rng;
use esp_hal::rtc_cntl::{Rtc, reset_reason, wakeup_cause};
use esp_hal::system::Cpu;
use esp_hal::time::Rate;
use esp_hal::timer::timg::TimerGroup;
use esp_println as _;
use esp_storage::FlashStorage;
use static_cell::StaticCell;

use crate::app::{App, FirmwarePlatform};
use crate::display::LogDisplay;
use crate::flash::{RECORD_OFFSET, RecordFlash};
use crate::hw::board::{BoardHardware, BoardLeds, BoardPower, classify_wake};
use crate::hw::{EdgeBank, LED_PINS};
use crate::mailbox::{BrokerLink, BrokerMailbox, WifiLink, WifiMailbox};
use crate::mqtt;
use crate::net::ConnectivityHandle;
use crate::shared::{
    ChannelConsumer, ChannelProducer, GestureCell, LedCell, PublishChannel, SharedGestures,
    SharedLeds, gesture_cell, led_cell,
};
use crate::status::StatusBoard;
use crate::time::FirmwareInstant;

mod input_task;
mod led_task;
mod mqtt_task;
mod network_task;
mod orchestrator_task;
mod wifi_task;

pub(super) type DeviceApp =
    App<'static, BoardHardware, LogDisplay, RecordFlash<FlashStorage<'static>>>;
pub(super) type DeviceConnectivity =
    ConnectivityManager<FirmwareInstant, WifiLink<'static>, BrokerLink<'static>>;

/// Station credentials baked in at build time; setup mode replaces these on
/// a provisioned unit.
pub(super) const WIFI_SSID: &str = match option_env!("HOME_BUTTONS_WIFI_SSID") {
    Some(ssid) => ssid,
    None => "",
};
pub(super) const WIFI_PASSWORD: &str = match option_env!("HOME_BUTTONS_WIFI_PASSWORD") {
    Some(password) => password,
    None => "",
};

pub(super) static EDGES: EdgeBank = EdgeBank::new();
pub(super) static CONNECTIVITY: ConnectivityHandle = ConnectivityHandle::new();
pub(super) static WIFI: WifiMailbox = WifiMailbox::new();
pub(super) static BROKER: BrokerMailbox = BrokerMailbox::new();
pub(super) static PUBLISH: PublishChannel = PublishChannel::new();
pub(super) static STATUS: StatusBoard = StatusBoard::new();

static GESTURES: StaticCell<GestureCell> = StaticCell::new();
static LEDS: StaticCell<LedCell> = StaticCell::new();
static BUTTON_PINS: StaticCell<[Input<'static>; NUM_BUTTONS]> = StaticCell::new();
static RADIO: StaticCell<esp_radio::Controller<'static>> = StaticCell::new();
static NET_RESOURCES: StaticCell<StackResources<4>> = StaticCell::new();

esp_bootloader_esp_idf::esp_app_desc!();

#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);
    let reset = reset_reason(Cpu::ProCpu);
    let cause = wakeup_cause();

    // esp-radio requires an allocator.
    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 65536);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    let button_cfg = InputConfig::default().with_pull(Pull::Down);
    let buttons = BUTTON_PINS.init([
        Input::new(peripherals.GPIO5, button_cfg),
        Input::new(peripherals.GPIO4, button_cfg),
        Input::new(peripherals.GPIO6, button_cfg),
        Input::new(peripherals.GPIO3, button_cfg),
        Input::new(peripherals.GPIO21, button_cfg),
        Input::new(peripherals.GPIO1, button_cfg),
    ]);
    let mut held = [false; NUM_BUTTONS];
    for (id, pin) in ButtonId::all().zip(buttons.iter()) {
        held[id.index()] = pin.is_high();
        EDGES.set_level(id, held[id.index()]);
    }
    let wake = classify_wake(reset, cause, held);
    info!(
        "boot: reset={} cause={} wake={} leds={=[u8]}",
        defmt::Debug2Format(&reset),
        defmt::Debug2Format(&cause),
        defmt::Debug2Format(&wake),
        &LED_PINS[..]
    );

    let led_cfg = OutputConfig::default();
    let leds = BoardLeds::new([
        Output::new(peripherals.GPIO15, Level::Low, led_cfg),
        Output::new(peripherals.GPIO16, Level::Low, led_cfg),
        Output::new(peripherals.GPIO17, Level::Low, led_cfg),
        Output::new(peripherals.GPIO2, Level::Low, led_cfg),
        Output::new(peripherals.GPIO38, Level::Low, led_cfg),
        Output::new(peripherals.GPIO37, Level::Low, led_cfg),
    ]);

    let mut adc_cfg = AdcConfig::new();
    let vbat = adc_cfg.enable_pin(peripherals.GPIO14, Attenuation::_11dB);
    let adc = Adc::new(peripherals.ADC2, adc_cfg);
    let i2c = I2c::new(
        peripherals.I2C0,
        I2cConfig::default().with_frequency(Rate::from_khz(100)),
    )
    .expect("I2C init failed")
    .with_sda(peripherals.GPIO10)
    .with_scl(peripherals.GPIO11);
    let hardware = BoardHardware::new(
        wake,
        &EDGES,
        adc,
        vbat,
        Input::new(peripherals.GPIO12, InputConfig::default().with_pull(Pull::Up)),
        Input::new(peripherals.GPIO7, InputConfig::default()),
        Output::new(peripherals.GPIO13, Level::Low, OutputConfig::default()),
        i2c,
    );

    let mut storage = RecordFlash::new(FlashStorage::new(peripherals.FLASH), RECORD_OFFSET);
    let stored = storage.load_all().ok();
    if stored.is_none() {
        info!("storage: no usable record");
    }
    let prefs = stored.as_ref().map(|state| state.prefs.clone()).unwrap_or_default();
    let quick_cache = stored.as_ref().and_then(|state| state.persisted.quick_connect);

    let gestures: &'static GestureCell = GESTURES.init(gesture_cell(GestureTimings::default()));
    let led_bank: &'static LedCell = LEDS.init(led_cell());
    let platform = FirmwarePlatform::new(
        hardware,
        LogDisplay::new(),
        storage,
        SharedGestures::new(gestures),
        SharedLeds::new(led_bank),
        CONNECTIVITY.link(),
        ChannelProducer::new(&PUBLISH),
    );
    let app = DeviceApp::new(
        OrchestratorConfig {
            sw_version: env!("CARGO_PKG_VERSION"),
            ..OrchestratorConfig::default()
        },
        platform,
        &STATUS,
    );
    let power = BoardPower::new(Rtc::new(peripherals.LPWR));

    let manager = DeviceConnectivity::new(
        WIFI.link(),
        BROKER.client(),
        NetTimings::default(),
        quick_cache,
    );

    for (id, pin) in ButtonId::all().zip(buttons) {
        spawner
            .spawn(input_task::edge_waiter(id, pin))
            .expect("failed to spawn edge waiter");
    }
    spawner
        .spawn(input_task::gesture_task(SharedGestures::new(gestures)))
        .expect("failed to spawn gesture task");
    spawner
        .spawn(led_task::run(SharedLeds::new(led_bank), leds))
        .expect("failed to spawn LED task");
    spawner
        .spawn(network_task::run(manager, ChannelConsumer::new(&PUBLISH)))
        .expect("failed to spawn network task");
    spawner
        .spawn(orchestrator_task::run(app, power))
        .expect("failed to spawn orchestrator task");

    let radio = match esp_radio::init() {
        Ok(radio) => radio,
        Err(err) => {
            warn!("esp-radio init failed: {}", defmt::Debug2Format(&err));
            park().await
        }
    };
    let radio = RADIO.init(radio);
    let (controller, interfaces) =
        match esp_radio::wifi::new(radio, peripherals.WIFI, esp_radio::wifi::Config::default()) {
            Ok(parts) => parts,
            Err(err) => {
                warn!("wifi init failed: {}", defmt::Debug2Format(&err));
                park().await
            }
        };

    let mut rng = Rng::new();
    let seed = u64::from(rng.random()) << 32 | u64::from(rng.random());
    let (stack, runner) = embassy_net::new(
        interfaces.sta,
        embassy_net::Config::dhcpv4(Default::default()),
        NET_RESOURCES.init(StackResources::<4>::new()),
        seed,
    );

    spawner
        .spawn(wifi_task::net_runner(runner))
        .expect("failed to spawn net runner");
    spawner
        .spawn(wifi_task::run(controller, stack))
        .expect("failed to spawn Wi-Fi task");
    spawner
        .spawn(mqtt_task::run(
            stack,
            prefs,
            mqtt::client_id(Efuse::mac_address()),
        ))
        .expect("failed to spawn MQTT task");

    park().await
}

async fn park() -> ! {
    loop {
        Timer::after_secs(60).await;
    }
}
