//! Forwards core telemetry records to the firmware log.
//!
//! The orchestrator records into its own ring; the app task keeps a
//! [`TelemetryDrain`] cursor and logs each new record exactly once, over
//! defmt on target and stdout on host.

use core::fmt::Write as _;

use button_core::telemetry::{EventId, TelemetryRecord, TelemetryRecorder};
use heapless::String;

use crate::time::FirmwareInstant;

/// Longest rendered event text; longer lines are cut.
pub const LOG_LINE_LEN: usize = 96;

/// Cursor over a telemetry ring.
#[derive(Debug, Default)]
pub struct TelemetryDrain {
    next: EventId,
    skipped: u32,
}

impl TelemetryDrain {
    pub const fn new() -> Self {
        Self {
            next: 0,
            skipped: 0,
        }
    }

    /// Logs records added since the previous call and returns how many.
    pub fn drain<const N: usize>(
        &mut self,
        recorder: &TelemetryRecorder<FirmwareInstant, N>,
    ) -> usize {
        let mut logged = 0;
        for record in recorder.records_after(self.next) {
            if logged == 0 && record.id != self.next {
                let lost = record.id.wrapping_sub(self.next);
                self.skipped = self.skipped.saturating_add(lost);
                emit_skipped(lost);
            }
            let line = render(record);
            emit_log(record.id, record.timestamp.as_micros(), line.as_str());
            logged += 1;
        }
        self.next = recorder.next_id();
        logged
    }

    /// Records overwritten in the ring before they could be logged.
    pub const fn skipped(&self) -> u32 {
        self.skipped
    }
}

/// Renders the event, its payload and the gap to the previous record.
pub fn render(record: &TelemetryRecord<FirmwareInstant>) -> String<LOG_LINE_LEN> {
    let mut line = String::new();
    // Overflow only truncates the line.
    let _ = write!(line, "{}", record.event);
    let mut details: String<LOG_LINE_LEN> = String::new();
    let _ = write!(details, "{}", record.details);
    if !details.is_empty() {
        let _ = write!(line, " {details}");
    }
    if let Some(elapsed) = record.elapsed {
        let _ = write!(line, " +{}ms", elapsed.as_millis());
    }
    line
}

#[cfg(target_os = "none")]
fn emit_log(id: EventId, timestamp_us: u64, line: &str) {
    defmt::info!("telemetry #{} t={}us {=str}", id, timestamp_us, line);
}

#[cfg(not(target_os = "none"))]
fn emit_log(id: EventId, timestamp_us: u64, line: &str) {
    println!("telemetry #{id} t={timestamp_us}us {line}");
}

#[cfg(target_os = "none")]
fn emit_skipped(count: u32) {
    defmt::warn!("telemetry: {} records overwritten before logging", count);
}

#[cfg(not(target_os = "none"))]
fn emit_skipped(count: u32) {
    println!("telemetry: {count} records overwritten before logging");
}

#[cfg(test)]
mod tests {
    use super::*;

    use button_core::orchestrator::RunState;
    use button_core::telemetry::{TelemetryEventKind, TelemetryPayload};

    fn at(ms: u64) -> FirmwareInstant {
        FirmwareInstant::from_millis(ms)
    }

    #[test]
    fn each_record_is_logged_once() {
        let mut recorder: TelemetryRecorder<FirmwareInstant, 8> = TelemetryRecorder::new();
        let mut drain = TelemetryDrain::new();

        recorder.record(TelemetryEventKind::SessionEstablished, TelemetryPayload::None, at(10));
        recorder.record(TelemetryEventKind::SleepRequested, TelemetryPayload::None, at(20));
        assert_eq!(drain.drain(&recorder), 2);
        assert_eq!(drain.drain(&recorder), 0);

        recorder.record(TelemetryEventKind::ConnectTimeout, TelemetryPayload::None, at(30));
        assert_eq!(drain.drain(&recorder), 1);
        assert_eq!(drain.skipped(), 0);
    }

    #[test]
    fn overwritten_records_are_counted() {
        let mut recorder: TelemetryRecorder<FirmwareInstant, 4> = TelemetryRecorder::new();
        let mut drain = TelemetryDrain::new();

        for ms in 0..6 {
            recorder.record(TelemetryEventKind::PublishDropped, TelemetryPayload::Count(1), at(ms));
        }
        assert_eq!(drain.drain(&recorder), 4);
        assert_eq!(drain.skipped(), 2);
    }

    #[test]
    fn render_includes_payload_and_gap() {
        let mut recorder: TelemetryRecorder<FirmwareInstant, 4> = TelemetryRecorder::new();
        recorder.record(TelemetryEventKind::SessionEstablished, TelemetryPayload::None, at(100));
        recorder.record(
            TelemetryEventKind::RunStateChanged,
            TelemetryPayload::RunState {
                from: RunState::AwaitNetConnect,
                to: RunState::AwaitUserInputStart,
            },
            at(350),
        );

        let first = recorder.oldest_first().next().expect("first");
        assert_eq!(render(first).as_str(), "session-established");

        let latest = recorder.latest().expect("latest");
        let line = render(latest);
        assert!(line.starts_with("run-state "));
        assert!(line.ends_with(" +250ms"));
    }
}
