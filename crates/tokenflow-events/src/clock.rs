//! Tick clock: conversion between logical ticks and timestamps.
//!
//! Ticks are the only ordering key inside the engine. The clock maps them
//! onto a simulation timeline anchored at a configurable epoch so that
//! consumers can display events against calendar time.
//!
//! # Design Principles
//!
//! - All conversions use checked arithmetic (no silent overflow).
//! - The mapping is a pure function of `(epoch, tick_duration_ms)`, so the
//!   same configuration always yields the same simulation timestamps.

use chrono::{DateTime, TimeDelta, Utc};

/// Errors that can occur during clock operations.
#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    /// A tick does not fit on the timeline.
    #[error("tick {tick} overflows the simulation timeline")]
    TickOverflow {
        /// The tick that could not be converted.
        tick: u64,
    },

    /// Invalid clock configuration (e.g. zero tick duration).
    #[error("invalid clock configuration: {reason}")]
    InvalidConfig {
        /// Explanation of what is wrong with the configuration.
        reason: String,
    },
}

/// Converts between wall-clock timestamps and discrete logical ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickClock {
    /// Timestamp of tick 0.
    epoch: DateTime<Utc>,

    /// Length of one tick in milliseconds (at least 1).
    tick_duration_ms: u64,
}

impl TickClock {
    /// Create a clock whose tick 0 falls on `epoch`.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::InvalidConfig`] if `tick_duration_ms` is 0.
    pub fn new(epoch: DateTime<Utc>, tick_duration_ms: u64) -> Result<Self, ClockError> {
        if tick_duration_ms == 0 {
            return Err(ClockError::InvalidConfig {
                reason: "tick_duration_ms must be at least 1".to_owned(),
            });
        }
        Ok(Self {
            epoch,
            tick_duration_ms,
        })
    }

    /// Return the timestamp of tick 0.
    pub const fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }

    /// Return the configured tick length in milliseconds.
    pub const fn tick_duration_ms(&self) -> u64 {
        self.tick_duration_ms
    }

    /// Map a tick onto the simulation timeline.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::TickOverflow`] if the offset does not fit.
    pub fn timestamp_for(&self, tick: u64) -> Result<DateTime<Utc>, ClockError> {
        let offset_ms = tick
            .checked_mul(self.tick_duration_ms)
            .and_then(|ms| i64::try_from(ms).ok())
            .ok_or(ClockError::TickOverflow { tick })?;
        let delta = TimeDelta::try_milliseconds(offset_ms).ok_or(ClockError::TickOverflow { tick })?;
        self.epoch
            .checked_add_signed(delta)
            .ok_or(ClockError::TickOverflow { tick })
    }

    /// Map a timestamp onto the tick that contains it.
    ///
    /// Timestamps before the epoch clamp to tick 0; partial ticks round down.
    pub fn tick_for(&self, at: DateTime<Utc>) -> u64 {
        let elapsed_ms = at.signed_duration_since(self.epoch).num_milliseconds();
        let Ok(elapsed_ms) = u64::try_from(elapsed_ms) else {
            return 0;
        };
        elapsed_ms.checked_div(self.tick_duration_ms).unwrap_or(0)
    }
}

impl Default for TickClock {
    /// One-millisecond ticks anchored at the Unix epoch.
    fn default() -> Self {
        Self {
            epoch: DateTime::<Utc>::default(),
            tick_duration_ms: 1,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn zero_duration_is_rejected() {
        assert!(TickClock::new(epoch(), 0).is_err());
    }

    #[test]
    fn tick_zero_is_the_epoch() {
        let clock = TickClock::new(epoch(), 1000).unwrap();
        assert_eq!(clock.timestamp_for(0).unwrap(), epoch());
    }

    #[test]
    fn ticks_map_to_offsets() {
        let clock = TickClock::new(epoch(), 1000).unwrap();
        let ts = clock.timestamp_for(90).unwrap();
        assert_eq!(ts, epoch() + TimeDelta::seconds(90));
        assert_eq!(clock.tick_for(ts), 90);
    }

    #[test]
    fn partial_ticks_round_down() {
        let clock = TickClock::new(epoch(), 1000).unwrap();
        let ts = epoch() + TimeDelta::milliseconds(2999);
        assert_eq!(clock.tick_for(ts), 2);
    }

    #[test]
    fn timestamps_before_epoch_clamp_to_zero() {
        let clock = TickClock::new(epoch(), 10).unwrap();
        let ts = epoch() - TimeDelta::seconds(5);
        assert_eq!(clock.tick_for(ts), 0);
    }

    #[test]
    fn overflow_is_reported() {
        let clock = TickClock::new(epoch(), 1000).unwrap();
        assert!(clock.timestamp_for(u64::MAX).is_err());
    }
}
