//! Shared status board for the firmware tasks.
//!
//! Lightweight atomics track the last battery sample, the orchestrator run
//! state, the link state and delivery counters so any task can log a
//! [`StatusSnapshot`] without touching the state machines themselves.

use core::fmt;

use button_core::connectivity::{ConnectivityCounters, LinkState};
use button_core::orchestrator::RunState;
use portable_atomic::{AtomicU8, AtomicU32, Ordering};

const UNKNOWN: u8 = 0;

const RUN_STATES: [RunState; 7] = [
    RunState::AwaitNetConnect,
    RunState::AwaitUserInputStart,
    RunState::AwaitUserInputFinish,
    RunState::CmdShutdown,
    RunState::AwaitNetDisconnect,
    RunState::AwaitShutdown,
    RunState::AwaitFactoryReset,
];

fn encode_run_state(state: RunState) -> u8 {
    RUN_STATES
        .iter()
        .position(|candidate| *candidate == state)
        .and_then(|index| u8::try_from(index + 1).ok())
        .unwrap_or(UNKNOWN)
}

fn decode_run_state(raw: u8) -> Option<RunState> {
    RUN_STATES.get(usize::from(raw).checked_sub(1)?).copied()
}

/// Point-in-time copy of the board.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StatusSnapshot {
    /// Millivolts; `None` before the first sample.
    pub battery_mv: Option<u32>,
    pub run_state: Option<RunState>,
    pub link: LinkState,
    pub delivered: u32,
    pub publish_failures: u32,
    pub link_losses: u32,
    /// Lowest free heap seen, in bytes; `None` before the first sample.
    pub min_free_heap: Option<u32>,
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.battery_mv {
            Some(mv) => write!(f, "batt={mv}mV")?,
            None => f.write_str("batt=?")?,
        }
        match self.run_state {
            Some(state) => write!(f, " run={state}")?,
            None => f.write_str(" run=?")?,
        }
        write!(
            f,
            " link={} sent={} failed={} lost={}",
            self.link, self.delivered, self.publish_failures, self.link_losses
        )?;
        if let Some(heap) = self.min_free_heap {
            write!(f, " heap={heap}")?;
        }
        Ok(())
    }
}

/// Status atomics written by the app and network tasks.
pub struct StatusBoard {
    battery_mv: AtomicU32,
    run_state: AtomicU8,
    link_state: AtomicU8,
    delivered: AtomicU32,
    publish_failures: AtomicU32,
    link_losses: AtomicU32,
    min_free_heap: AtomicU32,
}

impl StatusBoard {
    pub const fn new() -> Self {
        Self {
            battery_mv: AtomicU32::new(0),
            run_state: AtomicU8::new(UNKNOWN),
            link_state: AtomicU8::new(0),
            delivered: AtomicU32::new(0),
            publish_failures: AtomicU32::new(0),
            link_losses: AtomicU32::new(0),
            min_free_heap: AtomicU32::new(u32::MAX),
        }
    }

    /// Stores a battery reading. Unusable readings store 1 mV so the sample
    /// still counts as taken.
    pub fn record_battery(&self, volts: f32) {
        let millivolts = if volts.is_finite() && volts > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let mv = (volts * 1000.0 + 0.5) as u32;
            mv.max(1)
        } else {
            1
        };
        self.battery_mv.store(millivolts, Ordering::Relaxed);
    }

    /// Stores the run state; returns `true` when it changed.
    pub fn record_run_state(&self, state: RunState) -> bool {
        let raw = encode_run_state(state);
        self.run_state.swap(raw, Ordering::Relaxed) != raw
    }

    pub fn record_link(&self, state: LinkState, counters: &ConnectivityCounters) {
        self.link_state
            .store(crate::net::encode_state(state), Ordering::Relaxed);
        self.delivered.store(counters.delivered, Ordering::Relaxed);
        self.publish_failures
            .store(counters.publish_failures, Ordering::Relaxed);
        self.link_losses
            .store(counters.link_losses, Ordering::Relaxed);
    }

    pub fn record_free_heap(&self, bytes: u32) {
        self.min_free_heap.fetch_min(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let battery_mv = match self.battery_mv.load(Ordering::Relaxed) {
            0 => None,
            mv => Some(mv),
        };
        let min_free_heap = match self.min_free_heap.load(Ordering::Relaxed) {
            u32::MAX => None,
            bytes => Some(bytes),
        };
        StatusSnapshot {
            battery_mv,
            run_state: decode_run_state(self.run_state.load(Ordering::Relaxed)),
            link: crate::net::decode_state(self.link_state.load(Ordering::Relaxed)),
            delivered: self.delivered.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            link_losses: self.link_losses.load(Ordering::Relaxed),
            min_free_heap,
        }
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}
