//! Telemetry event catalog and the fixed-capacity ring the orchestrator
//! records into.
//!
//! The core never logs directly. Decisions worth tracing are stored as typed
//! records with a monotonically increasing [`EventId`]; the firmware drains new
//! records with [`TelemetryRecorder::records_after`] and forwards them to its
//! logger, the emulator prints them as transcript lines.

use core::{fmt, time::Duration};

use heapless::HistoryBuf;

use crate::gesture::{Action, ButtonId};
use crate::orchestrator::{BootCause, RunState};
use crate::power::PowerMode;
use crate::state::StorageError;
use crate::time::Timestamp;
use crate::topics::CommandTopic;

/// Identifier assigned to each telemetry record.
pub type EventId = u32;

/// Total number of telemetry entries retained in memory.
pub const TELEMETRY_RING_CAPACITY: usize = 64;

/// Discriminated telemetry events.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TelemetryEventKind {
    Boot(BootCause),
    PowerModeSelected(PowerMode),
    RunStateChanged,
    GestureDispatched(ButtonId),
    SessionEstablished,
    CommandApplied,
    ConnectTimeout,
    CheckConnectionRaised,
    PublishDropped,
    StorageFailure,
    LowMemoryRestart,
    SleepRequested,
    RestartRequested,
}

impl fmt::Display for TelemetryEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryEventKind::Boot(cause) => write!(f, "boot {cause}"),
            TelemetryEventKind::PowerModeSelected(mode) => write!(f, "power-mode {mode}"),
            TelemetryEventKind::RunStateChanged => f.write_str("run-state"),
            TelemetryEventKind::GestureDispatched(id) => write!(f, "gesture {id}"),
            TelemetryEventKind::SessionEstablished => f.write_str("session-established"),
            TelemetryEventKind::CommandApplied => f.write_str("command-applied"),
            TelemetryEventKind::ConnectTimeout => f.write_str("connect-timeout"),
            TelemetryEventKind::CheckConnectionRaised => f.write_str("check-connection"),
            TelemetryEventKind::PublishDropped => f.write_str("publish-dropped"),
            TelemetryEventKind::StorageFailure => f.write_str("storage-failure"),
            TelemetryEventKind::LowMemoryRestart => f.write_str("low-memory-restart"),
            TelemetryEventKind::SleepRequested => f.write_str("sleep"),
            TelemetryEventKind::RestartRequested => f.write_str("restart"),
        }
    }
}

/// Extra data attached to a record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TelemetryPayload {
    None,
    RunState { from: RunState, to: RunState },
    Gesture(Action),
    Count(u32),
    Storage(StorageError),
    FreeMemory(u32),
    Command(CommandTopic),
    Sleep { wake_after: Option<Duration> },
}

impl fmt::Display for TelemetryPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryPayload::None => Ok(()),
            TelemetryPayload::RunState { from, to } => write!(f, "{from} -> {to}"),
            TelemetryPayload::Gesture(action) => write!(f, "{action}"),
            TelemetryPayload::Count(count) => write!(f, "count={count}"),
            TelemetryPayload::Storage(error) => write!(f, "{error}"),
            TelemetryPayload::FreeMemory(bytes) => write!(f, "free={bytes}"),
            TelemetryPayload::Command(topic) => write!(f, "{topic:?}"),
            TelemetryPayload::Sleep {
                wake_after: Some(after),
            } => write!(f, "wake-after={}ms", after.as_millis()),
            TelemetryPayload::Sleep { wake_after: None } => f.write_str("wake-after=none"),
        }
    }
}

/// Telemetry record stored in the ring buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TelemetryRecord<TInstant>
where
    TInstant: Copy,
{
    pub id: EventId,
    pub timestamp: TInstant,
    /// Time since the previous record, if any.
    pub elapsed: Option<Duration>,
    pub event: TelemetryEventKind,
    pub details: TelemetryPayload,
}

/// Telemetry ring buffer type alias.
pub type TelemetryRing<TInstant, const CAPACITY: usize = TELEMETRY_RING_CAPACITY> =
    HistoryBuf<TelemetryRecord<TInstant>, CAPACITY>;

/// Records telemetry events into a fixed-size ring buffer.
pub struct TelemetryRecorder<TInstant, const CAPACITY: usize = TELEMETRY_RING_CAPACITY>
where
    TInstant: Copy,
{
    ring: TelemetryRing<TInstant, CAPACITY>,
    last_recorded_at: Option<TInstant>,
    next_event_id: EventId,
}

impl<TInstant, const CAPACITY: usize> TelemetryRecorder<TInstant, CAPACITY>
where
    TInstant: Timestamp,
{
    /// Creates a new telemetry recorder with an empty history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: HistoryBuf::new(),
            last_recorded_at: None,
            next_event_id: 0,
        }
    }

    /// Returns an iterator over the recorded telemetry in chronological order.
    pub fn oldest_first(&self) -> impl Iterator<Item = &TelemetryRecord<TInstant>> + '_ {
        self.ring.oldest_ordered()
    }

    /// Returns the most recent telemetry record, if available.
    pub fn latest(&self) -> Option<&TelemetryRecord<TInstant>> {
        self.ring.recent()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Id the next record will receive.
    pub const fn next_id(&self) -> EventId {
        self.next_event_id
    }

    /// Records still in the ring with an id at or after `next`.
    ///
    /// Callers keep the returned cursor ([`Self::next_id`]) to drain each
    /// record once.
    pub fn records_after(
        &self,
        next: EventId,
    ) -> impl Iterator<Item = &TelemetryRecord<TInstant>> + '_ {
        self.ring
            .oldest_ordered()
            .filter(move |record| record.id.wrapping_sub(next) < EventId::MAX / 2)
    }

    /// Counts stored records of one kind.
    pub fn count(&self, event: TelemetryEventKind) -> usize {
        self.ring
            .oldest_ordered()
            .filter(|record| record.event == event)
            .count()
    }

    /// Records an event with the supplied payload.
    pub fn record(
        &mut self,
        event: TelemetryEventKind,
        payload: TelemetryPayload,
        timestamp: TInstant,
    ) -> EventId {
        let id = self.next_event_id;
        self.next_event_id = self.next_event_id.wrapping_add(1);

        let elapsed = self
            .last_recorded_at
            .map(|previous| timestamp.saturating_duration_since(previous));
        self.last_recorded_at = Some(timestamp);

        self.ring.write(TelemetryRecord {
            id,
            timestamp,
            elapsed,
            event,
            details: payload,
        });

        id
    }
}

impl<TInstant, const CAPACITY: usize> Default for TelemetryRecorder<TInstant, CAPACITY>
where
    TInstant: Timestamp,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::mock::MockInstant;

    #[test]
    fn records_carry_elapsed_time() {
        let mut recorder: TelemetryRecorder<MockInstant, 4> = TelemetryRecorder::new();
        recorder.record(
            TelemetryEventKind::ConnectTimeout,
            TelemetryPayload::None,
            MockInstant::from_millis(10),
        );
        recorder.record(
            TelemetryEventKind::PublishDropped,
            TelemetryPayload::Count(1),
            MockInstant::from_millis(35),
        );

        let latest = recorder.latest().unwrap();
        assert_eq!(latest.id, 1);
        assert_eq!(latest.elapsed, Some(Duration::from_millis(25)));
        assert_eq!(recorder.oldest_first().next().unwrap().elapsed, None);
    }

    #[test]
    fn ring_keeps_newest_and_cursor_drains_once() {
        let mut recorder: TelemetryRecorder<MockInstant, 2> = TelemetryRecorder::new();
        for step in 0..3 {
            recorder.record(
                TelemetryEventKind::SessionEstablished,
                TelemetryPayload::None,
                MockInstant::from_millis(step),
            );
        }
        assert_eq!(recorder.len(), 2);
        let ids: heapless::Vec<EventId, 4> = recorder.records_after(0).map(|r| r.id).collect();
        assert_eq!(ids.as_slice(), &[1, 2]);

        let cursor = recorder.next_id();
        assert_eq!(recorder.records_after(cursor).count(), 0);
        recorder.record(
            TelemetryEventKind::SleepRequested,
            TelemetryPayload::Sleep { wake_after: None },
            MockInstant::from_millis(9),
        );
        assert_eq!(recorder.records_after(cursor).count(), 1);
    }
}
