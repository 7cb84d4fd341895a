//! Top-level sequencer.
//!
//! [`Orchestrator::boot`] runs once per wake: it loads the device record,
//! handles firmware-update and power-mode decisions, derives the boot cause and
//! picks the sleep or awake run loop. [`Orchestrator::poll`] then advances the
//! run-state machine one step per call. Every exit path returns a
//! [`PowerTransition`] only after the record was written back to storage, and
//! the caller hands it to [`PowerControl::apply`].

pub mod platform;

use core::{fmt, fmt::Write as _, time::Duration};

use heapless::String;

use crate::connectivity::{LinkControl, LinkState, NetEvent};
use crate::gesture::{Action, ButtonId, GesturePort, LongTier};
use crate::led::{BlinkPattern, LedCommand, LedPort};
use crate::power::{self, PowerAction, PowerInputs, PowerMode};
use crate::publish::{DEFAULT_ENQUEUE_TIMEOUT, Outbox, PublishItem, Topic};
use crate::state::{DeviceState, Storage, StorageError};
use crate::telemetry::{TelemetryEventKind, TelemetryPayload, TelemetryRecorder};
use crate::time::Timestamp;
use crate::topics::{
    AVAILABLE_OFFLINE, AVAILABLE_ONLINE, BUTTON_PRESS_PAYLOAD, CommandError, DeviceCommand,
    SWITCH_OFF, SWITCH_ON, TopicBuilder,
};

pub use platform::{
    Display, DisplayState, Hardware, Platform, PowerControl, SetupKind, WakeReason,
};

/// Outbox depth; covers the session announcements plus one gesture and one
/// sensor set.
pub const OUTBOX_DEPTH: usize = 16;

const MSG_RESTART: &str = "RESTART...";
const MSG_LOW_BATTERY_OFF: &str = "Turned\nOFF\n\nPlease\nrecharge\nbattery!";
const MSG_LOW_BATTERY: &str = "Battery\nLOW\n\nPlease\nrecharge\nsoon!";
const MSG_FULLY_CHARGED: &str = "Fully\ncharged!";
const MSG_NET_FAILED: &str = "Network\nconnection\nnot\nsuccessful";
const MSG_CHECK_CONNECTION: &str = "Check\nconnection!";
const MSG_FACTORY_RESET: &str = "Factory\nRESET...";
const PROMPT_SETUP: &str = "Release\nfor\nSETUP\n\nKeep\nholding\nfor\nWi-Fi SETUP";
const PROMPT_WIFI_SETUP: &str = "Release\nfor\nWi-Fi SETUP\n\nKeep\nholding\nfor\nFACTORY\nRESET";
const PROMPT_FACTORY_RESET: &str = "Release\nfor\nFACTORY\nRESET";

/// Why the device is running.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootCause {
    Reset,
    Timer,
    Button(ButtonId),
}

impl BootCause {
    /// Derives the cause; a button mask that maps to no button counts as a reset.
    #[must_use]
    pub fn from_wake(reason: WakeReason, revision: power::HardwareRevision) -> Self {
        match reason {
            WakeReason::Timer => BootCause::Timer,
            WakeReason::ButtonMask(mask) => revision
                .button_for_mask(mask)
                .map_or(BootCause::Reset, BootCause::Button),
            WakeReason::PowerOn | WakeReason::Other => BootCause::Reset,
        }
    }
}

impl fmt::Display for BootCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootCause::Reset => f.write_str("reset"),
            BootCause::Timer => f.write_str("timer"),
            BootCause::Button(id) => write!(f, "button {id}"),
        }
    }
}

/// Run-state shared by both loops.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RunState {
    AwaitNetConnect,
    AwaitUserInputStart,
    AwaitUserInputFinish,
    CmdShutdown,
    AwaitNetDisconnect,
    AwaitShutdown,
    AwaitFactoryReset,
}

impl RunState {
    /// Returns `true` once the loop is tearing down.
    #[must_use]
    pub const fn is_shutting_down(self) -> bool {
        matches!(
            self,
            RunState::CmdShutdown
                | RunState::AwaitNetDisconnect
                | RunState::AwaitShutdown
                | RunState::AwaitFactoryReset
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Which run loop was chosen at boot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LoopKind {
    Sleep,
    Awake,
}

/// Terminal action requested by the orchestrator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PowerTransition {
    Sleep {
        wake_after: Option<Duration>,
        button_mask: u64,
    },
    Restart,
    Setup(SetupKind),
}

/// Timeouts and limits for the run loops.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OrchestratorConfig {
    pub sw_version: &'static str,
    pub net_connect_timeout: Duration,
    pub max_failed_connections: u8,
    pub info_screen_time: Duration,
    pub awake_sensor_interval: Duration,
    pub awake_redraw_interval: Duration,
    pub message_time: Duration,
    pub shutdown_flush_timeout: Duration,
    pub min_free_memory: u32,
    pub led_brightness: u8,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            sw_version: env!("CARGO_PKG_VERSION"),
            net_connect_timeout: Duration::from_secs(45),
            max_failed_connections: 5,
            info_screen_time: Duration::from_secs(30),
            awake_sensor_interval: Duration::from_secs(60),
            awake_redraw_interval: Duration::from_secs(1),
            message_time: Duration::from_secs(3),
            shutdown_flush_timeout: Duration::from_secs(2),
            min_free_memory: 20_000,
            led_brightness: 255,
        }
    }
}

/// The application sequencer.
pub struct Orchestrator<I: Timestamp> {
    config: OrchestratorConfig,
    state: DeviceState,
    run_state: RunState,
    loop_kind: LoopKind,
    boot_cause: BootCause,
    boot_at: Option<I>,
    active_button: Option<ButtonId>,
    dispatched: Action,
    prompt: Action,
    last_sensor_publish: Option<I>,
    last_redraw: Option<I>,
    info_screen_since: Option<I>,
    shutdown_since: Option<I>,
    outbox: Outbox<I, OUTBOX_DEPTH>,
    telemetry: TelemetryRecorder<I>,
}

impl<I: Timestamp> Orchestrator<I> {
    #[must_use]
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            state: DeviceState::default(),
            run_state: RunState::AwaitNetConnect,
            loop_kind: LoopKind::Sleep,
            boot_cause: BootCause::Reset,
            boot_at: None,
            active_button: None,
            dispatched: Action::Idle,
            prompt: Action::Idle,
            last_sensor_publish: None,
            last_redraw: None,
            info_screen_since: None,
            shutdown_since: None,
            outbox: Outbox::new(DEFAULT_ENQUEUE_TIMEOUT),
            telemetry: TelemetryRecorder::new(),
        }
    }

    pub const fn state(&self) -> &DeviceState {
        &self.state
    }

    pub const fn run_state(&self) -> RunState {
        self.run_state
    }

    pub const fn loop_kind(&self) -> LoopKind {
        self.loop_kind
    }

    pub const fn boot_cause(&self) -> BootCause {
        self.boot_cause
    }

    pub const fn telemetry(&self) -> &TelemetryRecorder<I> {
        &self.telemetry
    }

    pub const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Runs boot handling.
    ///
    /// # Errors
    ///
    /// Returns the power transition to apply when the boot ends before a run
    /// loop starts (sleep, restart, or setup).
    pub fn boot<P>(&mut self, now: I, p: &mut P) -> Result<(), PowerTransition>
    where
        P: Platform<Instant = I>,
    {
        self.boot_at = Some(now);
        self.state = match p.storage().load_all() {
            Ok(state) => state,
            Err(StorageError::Empty) => DeviceState::default(),
            Err(error) => {
                self.storage_failure(now, error);
                DeviceState::default()
            }
        };
        // Every save mirrors the link's cache, so seed it before the first one.
        p.link().set_quick_cache(self.state.persisted.quick_connect);

        self.handle_firmware_update(now, p)?;
        self.select_power_mode(now, p)?;
        self.refresh_sensors(p);

        let revision = p.hardware().revision();
        self.boot_cause = BootCause::from_wake(p.hardware().wake_reason(), revision);
        self.telemetry.record(
            TelemetryEventKind::Boot(self.boot_cause),
            TelemetryPayload::None,
            now,
        );

        let awake = self.state.flags.awake_mode;
        match self.boot_cause {
            BootCause::Reset => self.boot_from_reset(now, p, awake)?,
            BootCause::Timer => self.boot_from_timer(p, awake),
            BootCause::Button(id) => self.boot_from_button(now, p, id, awake)?,
        }

        let filter = TopicBuilder::from_prefs(&self.state.prefs).command_filter();
        // A fresh link controller always has room for the command filter.
        let _ = p.link().subscribe_on_session(filter.as_str());

        if awake {
            self.loop_kind = LoopKind::Awake;
            self.state.persisted.info_screen_showing = false;
            self.state.persisted.check_connection = false;
            self.state.persisted.charge_complete_showing = false;
            p.display().disp_main();
            p.gestures().start();
        } else {
            self.loop_kind = LoopKind::Sleep;
        }
        p.link().request_connect();
        Ok(())
    }

    fn handle_firmware_update<P>(&mut self, now: I, p: &mut P) -> Result<(), PowerTransition>
    where
        P: Platform<Instant = I>,
    {
        let current = self.config.sw_version;
        if self.state.persisted.last_sw_version.as_str() == current {
            return Ok(());
        }
        let first_boot = self.state.persisted.last_sw_version.is_empty();
        self.state.persisted.last_sw_version = crate::state::truncated(current);
        if first_boot {
            return Ok(());
        }
        self.state.persisted.send_discovery_config = true;
        let mut text: String<48> = String::new();
        let _ = write!(text, "Firmware\nupdated to\n{current}");
        p.display().disp_message(text.as_str(), None);
        Err(self.restart(now, p))
    }

    fn select_power_mode<P>(&mut self, now: I, p: &mut P) -> Result<(), PowerTransition>
    where
        P: Platform<Instant = I>,
    {
        let hardware = p.hardware();
        let revision = hardware.revision();
        let thresholds = revision.thresholds();
        // Boards without power sensing always run from the battery.
        let inputs = if revision.has_power_sensing() {
            PowerInputs {
                battery_present: hardware.is_battery_present(),
                dc_connected: hardware.is_dc_connected(),
                battery_volts: hardware.read_battery_voltage(),
            }
        } else {
            PowerInputs {
                battery_present: true,
                dc_connected: false,
                battery_volts: hardware.read_battery_voltage(),
            }
        };
        let decision = power::determine_power_mode(
            inputs,
            &thresholds,
            self.state.persisted.user_awake_mode,
            self.state.persisted.low_batt_mode,
            || hardware.read_battery_voltage(),
        );
        if decision.charging {
            hardware.enable_charger(true);
        }

        let sensors = &mut self.state.sensors;
        sensors.battery_present = inputs.battery_present;
        sensors.dc_connected = inputs.dc_connected;
        sensors.charging = decision.charging;
        sensors.battery_low = decision.battery_low;
        self.state.persisted.low_batt_mode = decision.low_batt_mode;
        self.state.flags.awake_mode = decision.mode == PowerMode::Awake;
        self.telemetry.record(
            TelemetryEventKind::PowerModeSelected(decision.mode),
            TelemetryPayload::None,
            now,
        );

        match decision.action {
            PowerAction::Continue => Ok(()),
            PowerAction::RestartNow => Err(self.restart(now, p)),
            PowerAction::SleepNow => {
                if decision.entered_low_batt {
                    p.display().disp_message(MSG_LOW_BATTERY_OFF, None);
                    p.display().end();
                }
                Err(self.sleep(now, p))
            }
        }
    }

    fn boot_from_reset<P>(&mut self, now: I, p: &mut P, awake: bool) -> Result<(), PowerTransition>
    where
        P: Platform<Instant = I>,
    {
        if !self.state.persisted.silent_restart {
            p.display().disp_message(MSG_RESTART, None);
        }
        let setup = if self.state.persisted.restart_to_wifi_setup {
            Some(SetupKind::Wifi)
        } else if self.state.persisted.restart_to_setup {
            Some(SetupKind::Device)
        } else {
            None
        };
        self.state.persisted.clear_transient();
        p.link().set_quick_cache(None);
        self.save(now, p);
        if let Some(kind) = setup {
            return Err(PowerTransition::Setup(kind));
        }

        if !self.state.is_provisioned() {
            p.display().disp_welcome();
            p.display().end();
            return Err(self.sleep(now, p));
        }
        p.display().disp_main();
        if awake {
            self.run_state = RunState::AwaitNetConnect;
            Ok(())
        } else {
            p.display().end();
            Err(self.sleep(now, p))
        }
    }

    fn boot_from_timer<P>(&mut self, p: &mut P, awake: bool)
    where
        P: Platform<Instant = I>,
    {
        if !awake {
            if self.state.persisted.info_screen_showing {
                self.state.persisted.info_screen_showing = false;
                p.display().disp_main();
            }
            if p.hardware().is_charger_in_standby() && !self.state.persisted.charge_complete_showing
            {
                self.state.persisted.charge_complete_showing = true;
                p.display().disp_message(MSG_FULLY_CHARGED, None);
            }
        }
        self.run_state = RunState::AwaitNetConnect;
    }

    fn boot_from_button<P>(
        &mut self,
        now: I,
        p: &mut P,
        id: ButtonId,
        awake: bool,
    ) -> Result<(), PowerTransition>
    where
        P: Platform<Instant = I>,
    {
        if !self.state.persisted.wifi_done {
            return Err(self.setup(now, p, SetupKind::Wifi));
        }
        if !self.state.persisted.setup_done {
            return Err(self.setup(now, p, SetupKind::Device));
        }
        if awake {
            self.run_state = RunState::AwaitNetConnect;
            return Ok(());
        }

        let persisted = &mut self.state.persisted;
        let dismissed = if persisted.info_screen_showing {
            persisted.info_screen_showing = false;
            true
        } else if persisted.charge_complete_showing {
            persisted.charge_complete_showing = false;
            true
        } else if persisted.check_connection {
            persisted.check_connection = false;
            true
        } else {
            false
        };
        if dismissed {
            p.display().disp_main();
            p.display().end();
            return Err(self.sleep(now, p));
        }

        p.gestures().init_press(id, now);
        p.gestures().start();
        self.active_button = Some(id);
        self.run_state = RunState::AwaitUserInputFinish;
        Ok(())
    }

    /// Advances the active run loop by one step.
    ///
    /// Returns the power transition once the loop has finished; the record has
    /// already been saved at that point.
    pub fn poll<P>(&mut self, now: I, p: &mut P) -> Option<PowerTransition>
    where
        P: Platform<Instant = I>,
    {
        self.handle_net_events(now, p);
        self.flush_outbox(now, p);

        let transition = match self.loop_kind {
            LoopKind::Sleep => self.poll_sleep(now, p),
            LoopKind::Awake => self.poll_awake(now, p),
        };
        if transition.is_some() {
            return transition;
        }

        if self.loop_kind == LoopKind::Awake {
            let free = p.hardware().free_memory();
            if free < self.config.min_free_memory {
                self.telemetry.record(
                    TelemetryEventKind::LowMemoryRestart,
                    TelemetryPayload::FreeMemory(free),
                    now,
                );
                self.state.persisted.silent_restart = true;
                return Some(self.restart(now, p));
            }
        }
        None
    }

    fn poll_sleep<P>(&mut self, now: I, p: &mut P) -> Option<PowerTransition>
    where
        P: Platform<Instant = I>,
    {
        match self.run_state {
            RunState::AwaitUserInputFinish => return self.await_input_finish(now, p),
            RunState::AwaitNetConnect => {
                if p.link().link_state() == LinkState::FullyConnected {
                    if let Some(id) = self.active_button
                        && self.dispatched.is_click()
                    {
                        self.publish_button(now, id, self.dispatched);
                    }
                    self.refresh_sensors(p);
                    self.publish_sensors(now);
                    self.state.persisted.failed_connections = 0;
                    self.set_run_state(now, RunState::CmdShutdown);
                } else if self.connect_timed_out(now) {
                    self.handle_connect_timeout(now, p);
                    self.set_run_state(now, RunState::CmdShutdown);
                }
            }
            RunState::AwaitUserInputStart => {
                self.set_run_state(now, RunState::CmdShutdown);
            }
            RunState::CmdShutdown => self.cmd_shutdown(now, p),
            RunState::AwaitNetDisconnect => self.await_net_disconnect(now, p),
            RunState::AwaitShutdown => {
                if p.display().state() == DisplayState::Idle && p.leds().is_idle() {
                    if self.state.flags.awake_mode {
                        self.state.persisted.silent_restart = true;
                        return Some(self.restart(now, p));
                    }
                    return Some(self.sleep(now, p));
                }
            }
            RunState::AwaitFactoryReset => return self.await_factory_reset(now, p),
        }
        None
    }

    fn poll_awake<P>(&mut self, now: I, p: &mut P) -> Option<PowerTransition>
    where
        P: Platform<Instant = I>,
    {
        match self.run_state {
            RunState::AwaitNetConnect => {
                if p.link().link_state() == LinkState::FullyConnected {
                    p.gestures().clear_all();
                    self.refresh_sensors(p);
                    self.publish_sensors(now);
                    self.last_sensor_publish = Some(now);
                    self.set_run_state(now, RunState::AwaitUserInputStart);
                } else if !p.hardware().is_dc_connected() {
                    self.state.sensors.charging = false;
                    self.state.persisted.info_screen_showing = false;
                    p.display().disp_main();
                    self.set_run_state(now, RunState::CmdShutdown);
                }
            }
            RunState::AwaitUserInputStart => self.await_input_start(now, p),
            RunState::AwaitUserInputFinish => return self.await_input_finish(now, p),
            RunState::CmdShutdown => {
                self.state.persisted.info_screen_showing = false;
                self.cmd_shutdown(now, p);
            }
            RunState::AwaitNetDisconnect => self.await_net_disconnect(now, p),
            RunState::AwaitShutdown => {
                if p.display().state() == DisplayState::Idle && p.leds().is_idle() {
                    return Some(self.sleep(now, p));
                }
            }
            RunState::AwaitFactoryReset => return self.await_factory_reset(now, p),
        }
        None
    }

    fn await_input_start<P>(&mut self, now: I, p: &mut P)
    where
        P: Platform<Instant = I>,
    {
        let due =
            |last: Option<I>, every: Duration| last.is_none_or(|at| now.has_elapsed(at, every));

        if let Some(id) = p.gestures().active() {
            self.active_button = Some(id);
            self.set_run_state(now, RunState::AwaitUserInputFinish);
        } else if due(self.last_sensor_publish, self.config.awake_sensor_interval) {
            self.refresh_sensors(p);
            self.publish_sensors(now);
            self.last_sensor_publish = Some(now);
        } else if due(self.last_redraw, self.config.awake_redraw_interval) {
            if self.state.flags.display_redraw {
                self.state.flags.display_redraw = false;
                if self.state.persisted.info_screen_showing {
                    p.display().disp_info();
                } else {
                    p.display().disp_main();
                }
            }
            self.last_redraw = Some(now);
        } else if self.state.persisted.info_screen_showing
            && self
                .info_screen_since
                .is_none_or(|since| now.has_elapsed(since, self.config.info_screen_time))
        {
            p.display().disp_main();
            self.state.persisted.info_screen_showing = false;
        } else if !p.hardware().is_dc_connected() {
            self.state.sensors.dc_connected = false;
            self.publish_availability(now);
            self.state.sensors.charging = false;
            p.display().disp_main();
            self.set_run_state(now, RunState::CmdShutdown);
        }

        let user_awake = self.state.persisted.user_awake_mode;
        if self.state.sensors.charging {
            if p.hardware().is_charger_in_standby() {
                self.state.sensors.charging = false;
                p.display().disp_main();
                if !user_awake {
                    self.set_run_state(now, RunState::CmdShutdown);
                }
            }
        } else if !user_awake && self.run_state != RunState::CmdShutdown {
            p.display().disp_main();
            self.set_run_state(now, RunState::CmdShutdown);
        }
    }

    fn await_input_finish<P>(&mut self, now: I, p: &mut P) -> Option<PowerTransition>
    where
        P: Platform<Instant = I>,
    {
        let awake = self.loop_kind == LoopKind::Awake;
        let Some(id) = self.active_button else {
            if awake {
                p.gestures().clear_all();
                self.set_run_state(now, RunState::AwaitUserInputStart);
            } else {
                self.set_run_state(now, RunState::CmdShutdown);
            }
            return None;
        };

        let snapshot = p.gestures().snapshot(id);
        if !snapshot.finished {
            self.show_prompt(snapshot.action, p);
            return None;
        }

        let action = snapshot.action;
        self.prompt = Action::Idle;
        self.telemetry.record(
            TelemetryEventKind::GestureDispatched(id),
            TelemetryPayload::Gesture(action),
            now,
        );
        p.gestures().clear_all();
        if awake {
            self.active_button = None;
        }

        let idle_state = if awake {
            RunState::AwaitUserInputStart
        } else {
            RunState::CmdShutdown
        };
        match action {
            Action::Single | Action::Double | Action::Triple | Action::Quad => {
                if awake && self.state.persisted.info_screen_showing {
                    self.dismiss_info_screen(p);
                    self.set_run_state(now, idle_state);
                    return None;
                }
                let pattern = BlinkPattern::clicks(
                    action.click_count(),
                    self.config.led_brightness,
                    !awake,
                );
                p.leds().command(id, LedCommand::Blink(pattern));
                if awake {
                    self.publish_button(now, id, action);
                    self.set_run_state(now, idle_state);
                } else {
                    if self.state.sensors.battery_low {
                        p.display()
                            .disp_message(MSG_LOW_BATTERY, Some(self.config.message_time));
                    }
                    self.dispatched = action;
                    self.set_run_state(now, RunState::AwaitNetConnect);
                }
            }
            Action::Long(LongTier::One) => {
                if awake && self.state.persisted.info_screen_showing {
                    self.dismiss_info_screen(p);
                } else {
                    // The info page was drawn by the live prompt.
                    self.state.persisted.info_screen_showing = true;
                    self.info_screen_since = Some(now);
                }
                self.set_run_state(now, idle_state);
            }
            Action::Long(LongTier::Two) => {
                self.state.persisted.restart_to_setup = true;
                return Some(self.restart(now, p));
            }
            Action::Long(LongTier::Three) => {
                self.state.persisted.restart_to_wifi_setup = true;
                return Some(self.restart(now, p));
            }
            Action::Long(LongTier::Four) => {
                p.display().disp_message(MSG_FACTORY_RESET, None);
                p.link().request_disconnect(true);
                p.display().end();
                p.gestures().stop();
                self.set_run_state(now, RunState::AwaitFactoryReset);
            }
            Action::Idle => self.set_run_state(now, idle_state),
        }
        None
    }

    fn show_prompt<P>(&mut self, action: Action, p: &mut P)
    where
        P: Platform<Instant = I>,
    {
        if action == self.prompt {
            return;
        }
        match action {
            Action::Long(LongTier::One) => p.display().disp_info(),
            Action::Long(LongTier::Two) => p.display().disp_message(PROMPT_SETUP, None),
            Action::Long(LongTier::Three) => p.display().disp_message(PROMPT_WIFI_SETUP, None),
            Action::Long(LongTier::Four) => p.display().disp_message(PROMPT_FACTORY_RESET, None),
            _ => {}
        }
        self.prompt = action;
    }

    fn dismiss_info_screen<P>(&mut self, p: &mut P)
    where
        P: Platform<Instant = I>,
    {
        p.display().disp_main();
        self.state.persisted.info_screen_showing = false;
    }

    fn cmd_shutdown<P>(&mut self, now: I, p: &mut P)
    where
        P: Platform<Instant = I>,
    {
        let since = *self.shutdown_since.get_or_insert(now);
        p.gestures().stop();
        p.leds().stop();

        let connected = p.link().link_state() == LinkState::FullyConnected;
        let flush_expired = now.has_elapsed(since, self.config.shutdown_flush_timeout);
        if !self.outbox.is_empty() {
            if connected && !flush_expired {
                return;
            }
            let dropped = u32::try_from(self.outbox.len()).unwrap_or(u32::MAX);
            self.outbox.clear();
            self.telemetry.record(
                TelemetryEventKind::PublishDropped,
                TelemetryPayload::Count(dropped),
                now,
            );
        }
        p.link().request_disconnect(false);
        self.set_run_state(now, RunState::AwaitNetDisconnect);
    }

    fn await_net_disconnect<P>(&mut self, now: I, p: &mut P)
    where
        P: Platform<Instant = I>,
    {
        if !p.link().is_disconnected() {
            return;
        }
        if self.state.flags.display_redraw {
            self.state.flags.display_redraw = false;
            p.display().disp_main();
        }
        p.display().end();
        self.set_run_state(now, RunState::AwaitShutdown);
    }

    fn await_factory_reset<P>(&mut self, now: I, p: &mut P) -> Option<PowerTransition>
    where
        P: Platform<Instant = I>,
    {
        if !p.link().is_disconnected() || p.display().state() != DisplayState::Idle {
            return None;
        }
        self.state.reset();
        if let Err(error) = p.storage().clear_all() {
            self.storage_failure(now, error);
        }
        self.telemetry.record(
            TelemetryEventKind::RestartRequested,
            TelemetryPayload::None,
            now,
        );
        Some(PowerTransition::Restart)
    }

    fn connect_timed_out(&self, now: I) -> bool {
        self.boot_at
            .is_some_and(|boot| now.has_elapsed(boot, self.config.net_connect_timeout))
    }

    fn handle_connect_timeout<P>(&mut self, now: I, p: &mut P)
    where
        P: Platform<Instant = I>,
    {
        self.telemetry.record(
            TelemetryEventKind::ConnectTimeout,
            TelemetryPayload::None,
            now,
        );
        match self.boot_cause {
            BootCause::Button(_) => {
                p.display()
                    .disp_error(MSG_NET_FAILED, Some(self.config.message_time));
            }
            BootCause::Timer => {
                let persisted = &mut self.state.persisted;
                persisted.failed_connections = persisted.failed_connections.saturating_add(1);
                let failures = persisted.failed_connections;
                if failures >= self.config.max_failed_connections {
                    persisted.failed_connections = 0;
                    persisted.check_connection = true;
                    p.display().disp_error(MSG_CHECK_CONNECTION, None);
                    self.telemetry.record(
                        TelemetryEventKind::CheckConnectionRaised,
                        TelemetryPayload::Count(u32::from(failures)),
                        now,
                    );
                }
            }
            BootCause::Reset => {}
        }
    }

    fn handle_net_events<P>(&mut self, now: I, p: &mut P)
    where
        P: Platform<Instant = I>,
    {
        while let Some(event) = p.link().next_event() {
            match event {
                NetEvent::SessionEstablished => {
                    self.telemetry.record(
                        TelemetryEventKind::SessionEstablished,
                        TelemetryPayload::None,
                        now,
                    );
                    self.announce(now);
                }
                NetEvent::Message(message) => {
                    let result = TopicBuilder::from_prefs(&self.state.prefs)
                        .parse_command(message.topic.as_str(), &message.payload);
                    self.apply_command(now, p, result);
                }
            }
        }
    }

    /// Publishes retained state after every session establishment.
    fn announce(&mut self, now: I) {
        self.publish_availability(now);
        let topics = TopicBuilder::from_prefs(&self.state.prefs);
        let mut items: heapless::Vec<(Topic, String<24>), 9> = heapless::Vec::new();
        let mut interval = String::new();
        let _ = write!(interval, "{}", self.state.prefs.sensor_interval());
        let _ = items.push((topics.sensor_interval_state(), interval));
        for id in ButtonId::all() {
            let label = crate::state::truncated(self.state.prefs.button_label(id));
            let _ = items.push((topics.button_label_state(id), label));
        }
        let awake = if self.state.persisted.user_awake_mode {
            SWITCH_ON
        } else {
            SWITCH_OFF
        };
        let _ = items.push((topics.awake_mode_state(), crate::state::truncated(awake)));
        for (topic, payload) in items {
            self.publish(now, topic.as_str(), payload.as_str(), true);
        }
        // The discovery layer consumes this flag when it runs.
        self.state.persisted.send_discovery_config = false;
    }

    fn apply_command<P>(&mut self, now: I, p: &mut P, result: Result<DeviceCommand, CommandError>)
    where
        P: Platform<Instant = I>,
    {
        let command = match result {
            Ok(command) => command,
            Err(CommandError::InvalidPayload(topic)) => {
                let cmd_topic = TopicBuilder::from_prefs(&self.state.prefs).command_topic(topic);
                self.publish(now, cmd_topic.as_str(), "", true);
                return;
            }
            Err(CommandError::NotACommand | CommandError::Cleared(_)) => return,
        };
        let topic = command.topic();
        match command {
            DeviceCommand::SensorInterval(minutes) => {
                self.state.prefs.set_sensor_interval(minutes);
                self.save(now, p);
                let state_topic =
                    TopicBuilder::from_prefs(&self.state.prefs).sensor_interval_state();
                let mut payload: String<4> = String::new();
                let _ = write!(payload, "{minutes}");
                self.publish(now, state_topic.as_str(), payload.as_str(), true);
                self.publish_sensors(now);
            }
            DeviceCommand::ButtonLabel { id, label } => {
                self.state.prefs.set_button_label(id, label.as_str());
                let state_topic =
                    TopicBuilder::from_prefs(&self.state.prefs).button_label_state(id);
                self.publish(now, state_topic.as_str(), label.as_str(), true);
                self.state.flags.display_redraw = true;
            }
            DeviceCommand::AwakeMode(on) => {
                self.state.persisted.user_awake_mode = on;
                if on {
                    self.state.flags.awake_mode = true;
                }
                self.save(now, p);
                let state_topic = TopicBuilder::from_prefs(&self.state.prefs).awake_mode_state();
                let payload = if on { SWITCH_ON } else { SWITCH_OFF };
                self.publish(now, state_topic.as_str(), payload, true);
            }
        }
        let cmd_topic = TopicBuilder::from_prefs(&self.state.prefs).command_topic(topic);
        self.publish(now, cmd_topic.as_str(), "", true);
        self.telemetry.record(
            TelemetryEventKind::CommandApplied,
            TelemetryPayload::Command(topic),
            now,
        );
    }

    fn publish_button(&mut self, now: I, id: ButtonId, action: Action) {
        if let Some(topic) = TopicBuilder::from_prefs(&self.state.prefs).button(id, action) {
            self.publish(now, topic.as_str(), BUTTON_PRESS_PAYLOAD, false);
        }
    }

    fn publish_sensors(&mut self, now: I) {
        let topics = TopicBuilder::from_prefs(&self.state.prefs);
        let (temperature, humidity, battery) =
            (topics.temperature(), topics.humidity(), topics.battery());
        let sensors = self.state.sensors;

        let mut payload: String<16> = String::new();
        let _ = write!(payload, "{:.2}", sensors.temperature);
        self.publish(now, temperature.as_str(), payload.as_str(), false);
        payload.clear();
        let _ = write!(payload, "{:.2}", sensors.humidity);
        self.publish(now, humidity.as_str(), payload.as_str(), false);
        payload.clear();
        let _ = write!(payload, "{}", sensors.battery_pct);
        self.publish(now, battery.as_str(), payload.as_str(), false);
    }

    fn publish_availability(&mut self, now: I) {
        let topic = TopicBuilder::from_prefs(&self.state.prefs).awake_mode_available();
        let payload = if self.state.sensors.dc_connected {
            AVAILABLE_ONLINE
        } else {
            AVAILABLE_OFFLINE
        };
        self.publish(now, topic.as_str(), payload, true);
    }

    fn publish(&mut self, now: I, topic: &str, payload: &str, retained: bool) {
        let queued = PublishItem::text(topic, payload, retained)
            .ok()
            .is_some_and(|item| self.outbox.push(item).is_ok());
        if !queued {
            self.telemetry.record(
                TelemetryEventKind::PublishDropped,
                TelemetryPayload::Count(1),
                now,
            );
        }
    }

    fn flush_outbox<P>(&mut self, now: I, p: &mut P)
    where
        P: Platform<Instant = I>,
    {
        let report = self.outbox.flush(now, p.queue());
        if report.dropped > 0 {
            self.telemetry.record(
                TelemetryEventKind::PublishDropped,
                TelemetryPayload::Count(u32::from(report.dropped)),
                now,
            );
        }
    }

    fn refresh_sensors<P>(&mut self, p: &mut P)
    where
        P: Platform<Instant = I>,
    {
        let hardware = p.hardware();
        let (temperature, humidity) = hardware.read_temp_humidity();
        let thresholds = hardware.revision().thresholds();
        self.state.sensors.temperature = temperature;
        self.state.sensors.humidity = humidity;
        self.state.sensors.battery_pct =
            power::battery_percent(hardware.read_battery_voltage(), &thresholds);
    }

    fn set_run_state(&mut self, now: I, next: RunState) {
        if next == self.run_state {
            return;
        }
        self.telemetry.record(
            TelemetryEventKind::RunStateChanged,
            TelemetryPayload::RunState {
                from: self.run_state,
                to: next,
            },
            now,
        );
        self.run_state = next;
    }

    fn storage_failure(&mut self, now: I, error: StorageError) {
        self.telemetry.record(
            TelemetryEventKind::StorageFailure,
            TelemetryPayload::Storage(error),
            now,
        );
    }

    fn save<P>(&mut self, now: I, p: &mut P)
    where
        P: Platform<Instant = I>,
    {
        self.state.persisted.quick_connect = p.link().quick_cache();
        if let Err(error) = p.storage().save_all(&self.state) {
            self.storage_failure(now, error);
        }
    }

    /// Saves and builds the sleep transition.
    fn sleep<P>(&mut self, now: I, p: &mut P) -> PowerTransition
    where
        P: Platform<Instant = I>,
    {
        self.save(now, p);
        p.leds().stop();
        let persisted = &self.state.persisted;
        let wake_after = (self.state.is_provisioned()
            && !persisted.low_batt_mode
            && !persisted.check_connection)
            .then(|| {
                if persisted.info_screen_showing {
                    self.config.info_screen_time
                } else {
                    Duration::from_secs(u64::from(self.state.prefs.sensor_interval()) * 60)
                }
            });
        let button_mask = p.hardware().revision().wake_mask();
        self.telemetry.record(
            TelemetryEventKind::SleepRequested,
            TelemetryPayload::Sleep { wake_after },
            now,
        );
        PowerTransition::Sleep {
            wake_after,
            button_mask,
        }
    }

    fn restart<P>(&mut self, now: I, p: &mut P) -> PowerTransition
    where
        P: Platform<Instant = I>,
    {
        self.save(now, p);
        self.telemetry.record(
            TelemetryEventKind::RestartRequested,
            TelemetryPayload::None,
            now,
        );
        PowerTransition::Restart
    }

    fn setup<P>(&mut self, now: I, p: &mut P, kind: SetupKind) -> PowerTransition
    where
        P: Platform<Instant = I>,
    {
        self.save(now, p);
        PowerTransition::Setup(kind)
    }
}
