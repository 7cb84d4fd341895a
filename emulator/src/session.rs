use core::fmt;
use core::mem;
use core::time::Duration;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use button_core::connectivity::LinkControl;
use button_core::gesture::ButtonId;
use button_core::orchestrator::{Orchestrator, OrchestratorConfig, PowerTransition, WakeReason};
use button_core::state::{DeviceState, MemoryStorage, Storage, truncated};
use button_core::telemetry::{EventId, TelemetryRecord};

use crate::script::{self, BootKind, Command, PowerCommand};
use crate::sim::{BoardInputs, SimBroker, SimHardware, SimInstant, SimLink, SimPlatform};

/// Simulation tick, matching the firmware task periods.
pub const STEP_MS: u64 = 10;
const CLICK_HOLD_MS: u64 = 80;
const CLICK_GAP_MS: u64 = 120;

const HELP: &[&str] = &[
    "boot reset|timer|button <n>       - start a wake over the stored record",
    "board <version>                   - board revision from the next boot",
    "power battery <volts>|absent      - set the battery reading",
    "power dc on|off | standby on|off  - set the charger inputs",
    "press <n> | release <n>           - change one button level",
    "click <n> [count]                 - short presses 200ms apart",
    "hold <n> <duration>               - press, wait, release",
    "advance <duration>                - run the device for a while",
    "link up|down | broker up|down     - make the network (un)reachable",
    "inbound <topic> [payload]         - deliver a broker message",
    "heap <bytes>                      - set the free heap reading",
    "provision <name>                  - store a provisioned record",
    "status                            - show device and session state",
    "quit                              - end the session",
];

/// One printed line, stamped when the device produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Output {
    pub at_ms: Option<u64>,
    pub text: String,
}

impl Output {
    fn note(text: impl Into<String>) -> Self {
        Self {
            at_ms: None,
            text: text.into(),
        }
    }

    fn at(at_ms: u64, text: impl Into<String>) -> Self {
        Self {
            at_ms: Some(at_ms),
            text: text.into(),
        }
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.at_ms {
            Some(at) => write!(f, "{at:>8} ms  {}", self.text),
            None => f.write_str(&self.text),
        }
    }
}

/// A running wake: orchestrator, platform and the telemetry cursor.
struct Wake {
    orchestrator: Orchestrator<SimInstant>,
    platform: SimPlatform,
    next_record: EventId,
}

pub struct Session {
    config: OrchestratorConfig,
    now_ms: u64,
    wakes: u32,
    inputs: BoardInputs,
    link_reachable: bool,
    broker_reachable: bool,
    /// The record while the device sleeps; moved into the platform on boot.
    stored: MemoryStorage,
    wake: Option<Wake>,
    transcript: Option<TranscriptLogger>,
    closed: bool,
}

impl Session {
    pub fn new(transcript: Option<&Path>) -> io::Result<Self> {
        let transcript = transcript.map(TranscriptLogger::new).transpose()?;
        Ok(Self {
            config: OrchestratorConfig {
                sw_version: env!("CARGO_PKG_VERSION"),
                ..OrchestratorConfig::default()
            },
            now_ms: 0,
            wakes: 0,
            inputs: BoardInputs::default(),
            link_reachable: true,
            broker_reachable: true,
            stored: MemoryStorage::new(),
            wake: None,
            transcript,
            closed: false,
        })
    }

    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn handle_command(&mut self, line: &str) -> io::Result<Vec<Output>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(transcript) = self.transcript.as_mut() {
            transcript.append_line(self.now_ms, TranscriptRole::Host, trimmed)?;
        }

        let outputs = match script::parse_line(trimmed) {
            Ok(Some(command)) => self.execute(command),
            Ok(None) => Vec::new(),
            Err(err) => vec![Output::note(format!("ERR syntax {err}"))],
        };

        if let Some(transcript) = self.transcript.as_mut() {
            for output in &outputs {
                let at = output.at_ms.unwrap_or(self.now_ms);
                transcript.append_line(at, TranscriptRole::Device, &output.text)?;
            }
        }
        Ok(outputs)
    }

    fn execute(&mut self, command: Command<'_>) -> Vec<Output> {
        let mut out = Vec::new();
        match command {
            Command::Boot(kind) => self.boot(kind, &mut out),
            Command::Board(revision) => {
                self.inputs.revision = revision;
                out.push(Output::note(format!(
                    "board {revision:?} from the next boot"
                )));
            }
            Command::Power(change) => self.apply_power(change, &mut out),
            Command::Press(id) => self.set_button(id, true, &mut out),
            Command::Release(id) => self.set_button(id, false, &mut out),
            Command::Click { id, count } => self.click(id, count, &mut out),
            Command::Hold { id, duration } => {
                self.set_button(id, true, &mut out);
                self.advance(duration_ms(duration), &mut out);
                if self.wake.is_some() {
                    self.set_button(id, false, &mut out);
                }
            }
            Command::Advance(duration) => self.advance(duration_ms(duration), &mut out),
            Command::Link(up) => {
                self.link_reachable = up;
                if let Some(wake) = self.wake.as_mut() {
                    wake.platform.net.link_mut().set_reachable(up);
                }
                out.push(Output::note(format!("access point {}", reachability(up))));
            }
            Command::Broker(up) => {
                self.broker_reachable = up;
                if let Some(wake) = self.wake.as_mut() {
                    wake.platform.net.broker_mut().set_reachable(up);
                }
                out.push(Output::note(format!("broker {}", reachability(up))));
            }
            Command::Inbound { topic, payload } => self.inbound(topic, payload, &mut out),
            Command::Heap(bytes) => {
                self.inputs.free_memory = bytes;
                self.sync_inputs();
                out.push(Output::note(format!("free heap {bytes} bytes")));
            }
            Command::Provision(name) => self.provision(name, &mut out),
            Command::Status => self.status(&mut out),
            Command::Help => {
                out.push(Output::note("Available commands:"));
                for line in HELP {
                    out.push(Output::note(format!("  {line}")));
                }
            }
            Command::Quit => {
                self.closed = true;
                out.push(Output::note("Session closed."));
            }
        }
        out
    }

    fn boot(&mut self, kind: BootKind, out: &mut Vec<Output>) {
        if let Some(wake) = self.wake.take() {
            out.push(Output::note("abandoning the running wake"));
            self.stored = wake.platform.storage;
        }

        let reason = match kind {
            BootKind::Reset => WakeReason::PowerOn,
            BootKind::Timer => WakeReason::Timer,
            BootKind::Button(id) => {
                WakeReason::ButtonMask(1 << self.inputs.revision.button_pins()[id.index()])
            }
        };
        let quick_cache = self
            .stored
            .load_all()
            .ok()
            .and_then(|state| state.persisted.quick_connect);
        let mut hardware = SimHardware::new(self.inputs, reason);
        if let BootKind::Button(id) = kind {
            // The wake button is still held when the firmware starts.
            hardware.levels[id.index()] = true;
        }
        let platform = SimPlatform::new(
            mem::take(&mut self.stored),
            hardware,
            SimLink::new(self.link_reachable),
            SimBroker::new(self.broker_reachable),
            quick_cache,
        );

        self.wakes += 1;
        out.push(Output::at(
            self.now_ms,
            format!("boot #{} wake={reason:?}", self.wakes),
        ));
        let mut wake = Wake {
            orchestrator: Orchestrator::new(self.config),
            platform,
            next_record: 0,
        };
        let booted = wake
            .orchestrator
            .boot(SimInstant::from_millis(self.now_ms), &mut wake.platform);
        self.wake = Some(wake);
        self.collect(out);
        if let Err(transition) = booted {
            self.finish(transition, out);
        }
    }

    fn apply_power(&mut self, change: PowerCommand, out: &mut Vec<Output>) {
        let note = match change {
            PowerCommand::BatteryVolts(volts) => {
                self.inputs.battery_volts = volts;
                self.inputs.battery_present = true;
                format!("battery {volts:.2} V")
            }
            PowerCommand::BatteryAbsent => {
                self.inputs.battery_present = false;
                "battery removed".to_owned()
            }
            PowerCommand::Dc(on) => {
                self.inputs.dc_connected = on;
                format!("dc input {}", on_off(on))
            }
            PowerCommand::Standby(on) => {
                self.inputs.charger_standby = on;
                format!("charger standby {}", on_off(on))
            }
        };
        self.sync_inputs();
        out.push(Output::note(note));
    }

    fn sync_inputs(&mut self) {
        if let Some(wake) = self.wake.as_mut() {
            wake.platform.hardware.inputs = self.inputs;
        }
    }

    fn set_button(&mut self, id: ButtonId, pressed: bool, out: &mut Vec<Output>) {
        let Some(wake) = self.wake.as_mut() else {
            out.push(asleep());
            return;
        };
        wake.platform
            .set_button(id, SimInstant::from_millis(self.now_ms), pressed);
        out.push(Output::at(
            self.now_ms,
            format!("button {id} {}", if pressed { "down" } else { "up" }),
        ));
    }

    fn click(&mut self, id: ButtonId, count: u8, out: &mut Vec<Output>) {
        for remaining in (0..count).rev() {
            self.set_button(id, true, out);
            self.advance(CLICK_HOLD_MS, out);
            if self.wake.is_none() {
                return;
            }
            self.set_button(id, false, out);
            if remaining > 0 {
                self.advance(CLICK_GAP_MS, out);
            }
        }
    }

    /// Runs the device in [`STEP_MS`] ticks; stops ticking once the wake ends
    /// but still moves the clock to the target.
    fn advance(&mut self, millis: u64, out: &mut Vec<Output>) {
        let target = self.now_ms.saturating_add(millis);
        while self.now_ms < target {
            self.now_ms = (self.now_ms + STEP_MS).min(target);
            let Some(wake) = self.wake.as_mut() else {
                self.now_ms = target;
                break;
            };
            let transition = wake
                .platform
                .step(&mut wake.orchestrator, SimInstant::from_millis(self.now_ms));
            self.collect(out);
            if let Some(transition) = transition {
                self.finish(transition, out);
            }
        }
    }

    fn inbound(&mut self, topic: &str, payload: &str, out: &mut Vec<Output>) {
        let Some(wake) = self.wake.as_mut() else {
            out.push(asleep());
            return;
        };
        match wake.platform.net.broker_mut().deliver(topic, payload) {
            Ok(()) => out.push(Output::note(format!("queued {topic} {payload:?}"))),
            Err(len) => out.push(Output::note(format!(
                "ERR payload of {len} bytes does not fit a message"
            ))),
        }
    }

    fn provision(&mut self, name: &str, out: &mut Vec<Output>) {
        if self.wake.is_some() {
            out.push(Output::note("ERR the device is awake; advance until it sleeps"));
            return;
        }
        let mut state = DeviceState::default();
        state.persisted.wifi_done = true;
        state.persisted.setup_done = true;
        state.persisted.last_sw_version = truncated(self.config.sw_version);
        state.prefs.device_name = truncated(name);
        state.prefs.broker.server = truncated("broker.local");
        state.prefs.broker.port = 1883;
        state.prefs.broker.base_topic = truncated("homebuttons");
        state.prefs.broker.discovery_prefix = truncated("homeassistant");
        match MemoryStorage::with_state(&state) {
            Ok(storage) => {
                self.stored = storage;
                out.push(Output::note(format!(
                    "stored provisioned record for {}",
                    state.prefs.device_name
                )));
            }
            Err(err) => out.push(Output::note(format!("ERR storage {err}"))),
        }
    }

    fn status(&mut self, out: &mut Vec<Output>) {
        out.push(Output::note(format!(
            "clock {} ms, {} wake(s)",
            self.now_ms, self.wakes
        )));
        let inputs = self.inputs;
        out.push(Output::note(format!(
            "inputs: battery {:.2} V present={} dc={} standby={} heap={}",
            inputs.battery_volts,
            inputs.battery_present,
            inputs.dc_connected,
            inputs.charger_standby,
            inputs.free_memory
        )));
        out.push(Output::note(format!(
            "network: access point {}, broker {}",
            reachability(self.link_reachable),
            reachability(self.broker_reachable)
        )));

        let state = match self.wake.as_ref() {
            Some(wake) => {
                let orchestrator = &wake.orchestrator;
                out.push(Output::note(format!(
                    "awake: boot {} loop {:?} run-state {}",
                    orchestrator.boot_cause(),
                    orchestrator.loop_kind(),
                    orchestrator.run_state()
                )));
                out.push(Output::note(format!(
                    "link: {} {:?}",
                    wake.platform.net.link_state(),
                    wake.platform.net.counters()
                )));
                Some(orchestrator.state().clone())
            }
            None => {
                out.push(Output::note("asleep"));
                self.stored.load_all().ok()
            }
        };
        match state {
            Some(state) => {
                let flags = &state.persisted;
                out.push(Output::note(format!(
                    "record: name={:?} provisioned={} low_batt={} awake_mode={} \
                     quick_connect={} failed_connections={} check_connection={}",
                    state.prefs.device_name.as_str(),
                    state.is_provisioned(),
                    flags.low_batt_mode,
                    flags.user_awake_mode,
                    flags.quick_connect.is_some(),
                    flags.failed_connections,
                    flags.check_connection
                )));
            }
            None => out.push(Output::note("record: empty")),
        }
    }

    /// Moves device events and new telemetry into `out`.
    fn collect(&mut self, out: &mut Vec<Output>) {
        let Some(wake) = self.wake.as_mut() else {
            return;
        };
        for event in wake.platform.drain_events() {
            out.push(Output::at(self.now_ms, event.to_string()));
        }
        let telemetry = wake.orchestrator.telemetry();
        for record in telemetry.records_after(wake.next_record) {
            out.push(Output::at(record.timestamp.as_millis(), render(record)));
        }
        wake.next_record = telemetry.next_id();
    }

    fn finish(&mut self, transition: PowerTransition, out: &mut Vec<Output>) {
        self.collect(out);
        out.push(Output::at(self.now_ms, describe_transition(transition)));
        if let Some(wake) = self.wake.take() {
            self.stored = wake.platform.storage;
        }
    }
}

fn render(record: &TelemetryRecord<SimInstant>) -> String {
    let mut line = format!("telemetry #{} {}", record.id, record.event);
    let details = record.details.to_string();
    if !details.is_empty() {
        line.push(' ');
        line.push_str(&details);
    }
    if let Some(elapsed) = record.elapsed {
        line.push_str(&format!(" +{}ms", elapsed.as_millis()));
    }
    line
}

fn describe_transition(transition: PowerTransition) -> String {
    match transition {
        PowerTransition::Sleep {
            wake_after,
            button_mask,
        } => {
            let timer = wake_after.map_or_else(|| "off".to_owned(), |after| {
                format!("{}s", after.as_secs())
            });
            format!("power: deep sleep timer={timer} buttons={button_mask:#x}")
        }
        PowerTransition::Restart => "power: restart".to_owned(),
        PowerTransition::Setup(kind) => format!("power: restart into {kind:?} setup"),
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn asleep() -> Output {
    Output::note("ERR the device is asleep; use `boot`")
}

const fn on_off(on: bool) -> &'static str {
    if on { "on" } else { "off" }
}

const fn reachability(up: bool) -> &'static str {
    if up { "reachable" } else { "unreachable" }
}

struct TranscriptLogger {
    writer: BufWriter<std::fs::File>,
}

impl TranscriptLogger {
    fn new(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut logger = Self {
            writer: BufWriter::new(file),
        };

        logger.write_header()?;
        Ok(logger)
    }

    fn write_header(&mut self) -> io::Result<()> {
        writeln!(self.writer, "# Home Buttons emulator transcript")?;
        writeln!(self.writer, "# Timestamps are simulated milliseconds")?;
        writeln!(self.writer)?;
        self.writer.flush()
    }

    fn append_line(&mut self, at_ms: u64, role: TranscriptRole, line: &str) -> io::Result<()> {
        writeln!(self.writer, "[+{at_ms:>8} ms] {} {line}", role.prefix())?;
        self.writer.flush()
    }
}

enum TranscriptRole {
    Host,
    Device,
}

impl TranscriptRole {
    fn prefix(&self) -> &'static str {
        match self {
            TranscriptRole::Host => "HOST>",
            TranscriptRole::Device => "DEV <",
        }
    }
}
