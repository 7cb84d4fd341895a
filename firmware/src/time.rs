//! Embassy clock adapter for the core state machines.

use core::ops::Add;
use core::time::Duration;

use button_core::time::Timestamp;
use embassy_time::Instant;

/// [`Instant`] wrapper implementing the core [`Timestamp`] contract.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct FirmwareInstant(Instant);

impl FirmwareInstant {
    #[cfg(target_os = "none")]
    pub fn now() -> Self {
        Self(Instant::now())
    }

    #[cfg_attr(target_os = "none", allow(dead_code))]
    pub const fn from_millis(millis: u64) -> Self {
        Self(Instant::from_millis(millis))
    }

    pub const fn into_embassy(self) -> Instant {
        self.0
    }

    pub fn as_micros(self) -> u64 {
        self.0.as_micros()
    }
}

impl From<Instant> for FirmwareInstant {
    fn from(value: Instant) -> Self {
        Self(value)
    }
}

impl Add<Duration> for FirmwareInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        let micros = u64::try_from(rhs.as_micros()).unwrap_or(u64::MAX);
        Self(Instant::from_micros(self.0.as_micros().saturating_add(micros)))
    }
}

impl Timestamp for FirmwareInstant {
    fn saturating_duration_since(&self, earlier: Self) -> Duration {
        Duration::from_micros(self.0.as_micros().saturating_sub(earlier.0.as_micros()))
    }
}

/// Converts a core duration into the embassy representation.
pub fn to_embassy(duration: Duration) -> embassy_time::Duration {
    let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
    embassy_time::Duration::from_micros(micros)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addition_saturates_instead_of_wrapping() {
        let late = FirmwareInstant::from(Instant::from_micros(u64::MAX - 5));
        let later = late + Duration::from_secs(1);
        assert_eq!(later.as_micros(), u64::MAX);
    }

    #[test]
    fn duration_since_never_goes_negative() {
        let earlier = FirmwareInstant::from_millis(100);
        let later = FirmwareInstant::from_millis(350);
        assert_eq!(
            later.saturating_duration_since(earlier),
            Duration::from_millis(250)
        );
        assert_eq!(earlier.saturating_duration_since(later), Duration::ZERO);
        assert!(later.has_elapsed(earlier, Duration::from_millis(250)));
    }
}
